use std::time::{Instant, SystemTime};

/// Returns the current unix timestamp in microseconds.
#[inline]
pub fn timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_micros() as u64
}

/// Microseconds elapsed since `since`, saturated to the u32 range used by the
/// wire protocol's real-time statistics field.
#[inline]
pub fn elapsed_micros(since: Instant) -> u32 {
    let micros = since.elapsed().as_micros();
    if micros > u128::from(u32::max_value()) {
        u32::max_value()
    } else {
        micros as u32
    }
}
