use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The local key-value storage engine the cluster layer sits on top of.
///
/// The cluster never manages expiry or eviction itself; it only requires
/// that replicas expire in lock-step with the origin, which is why
/// [`put_with_expiry`](CacheStore::put_with_expiry) takes the absolute
/// expiry already computed by the writing node rather than a relative
/// duration.
///
/// Expiry timestamps are unix milliseconds, with `0` meaning the entry
/// never expires.
pub trait CacheStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Stores a value with a relative time-to-live, returning the absolute
    /// expiry timestamp assigned to it.
    fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<u64, Self::Error>;

    /// Stores a replica of a value written elsewhere, using the absolute
    /// expiry computed by the origin node.
    fn put_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry_at: u64,
    ) -> Result<(), Self::Error>;

    /// Retrieves a value if it exists and has not expired.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Removes a value, returning whether it existed.
    fn delete(&self, key: &str) -> Result<bool, Self::Error>;
}

/// The current wall-clock time in unix milliseconds.
pub fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
