use std::time::Duration;

/// Uniform random jitter in `[0, max]`.
///
/// Seeded from the high-resolution clock through xorshift64; good enough to
/// spread retries apart, not for anything security related.
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
        | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    Duration::from_millis(x % (max_ms + 1))
}
