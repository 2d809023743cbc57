pub mod clock;
pub mod error;
pub mod message;
pub mod summary;
pub mod traits;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{DigestError, GenerationError, ReaderError};
pub use message::{AppendOutcome, ChannelInfo, Message, RawAuthor, RawMessage};
pub use summary::{
    CacheEntry, CacheMetrics, CacheStatus, ChannelDigest, ClearAck, EntryStatus, Fingerprint,
    ServerSummaryResponse, SyncReport,
};
pub use traits::{
    ChatPlatformReader, LlmProvider, LlmRequest, LlmResponse, MessageStore, Summarizer,
    SummaryStore,
};
