//! Rendezvous hashing — which replica owns a cache key.
//!
//! Score every `(key, replica)` pair and take the maximum. Replica sets
//! are small and change rarely, so recomputing per lookup from the
//! current peer view is cheaper than maintaining a ring.

/// The replica owning `key`, or `None` for an empty view. Ties (which
/// would need a digest collision) break toward the larger id.
pub fn owner<'a, I>(key: &str, replicas: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    replicas
        .into_iter()
        .map(|r| (score(key, r), r))
        .max_by(|a, b| a.cmp(b))
        .map(|(_, r)| r)
}

fn score(key: &str, replica: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(&[0]);
    hasher.update(replica.as_bytes());
    let digest = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(first)
}
