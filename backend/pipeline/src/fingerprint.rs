//! Order-independent content fingerprints over a channel's message ids.

use sha2::{Digest, Sha256};

use chatdigest_core::Fingerprint;

const DOMAIN: &[u8] = b"chatdigest/window/v1";

/// Digest of a set of message ids.
///
/// Ids are sorted and deduplicated first, so any enumeration order of the
/// same set gives the same digest. Each id is length-prefixed to keep the
/// encoding injective, and the set size is mixed in, so the empty set has
/// its own well-defined digest.
pub fn fingerprint<I, S>(message_ids: I) -> Fingerprint
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut ids: Vec<S> = message_ids.into_iter().collect();
    ids.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));
    ids.dedup_by(|a, b| a.as_ref() == b.as_ref());

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN);
    hasher.update((ids.len() as u64).to_be_bytes());
    for id in &ids {
        let bytes = id.as_ref().as_bytes();
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    Fingerprint::new(hex::encode(hasher.finalize()))
}
