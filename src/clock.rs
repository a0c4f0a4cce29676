use std::time::Duration;

/// Resolution of the monotonic clock used to time each Process crossing
#[cfg(unix)]
pub fn resolution() -> Option<Duration> {
    use nix::time::{clock_getres, ClockId};

    let ts = clock_getres(ClockId::CLOCK_MONOTONIC).ok()?;
    let secs = u64::try_from(ts.tv_sec()).ok()?;
    let nanos = u32::try_from(ts.tv_nsec()).ok()?;
    Some(Duration::new(secs, nanos))
}

#[cfg(not(unix))]
pub fn resolution() -> Option<Duration> {
    None
}

/// "Note: clock resolution is N ns." when the resolution is known
pub fn resolution_note() -> Option<String> {
    resolution().map(|res| format!("Note: clock resolution is {} ns.", res.as_nanos()))
}
