//! Structured logging for the digest service.
//!
//! Console + optional rolling NDJSON file output, and redaction of
//! credentials before they reach logs or API responses.

pub mod logger;
pub mod redact;

pub use logger::init_logger;
pub use redact::redact_sensitive_data;
