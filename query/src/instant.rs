use std::{
    ops::{Add, Sub},
    time::Duration,
};

/// Wall-clock timestamp used for staleness and garbage collection bookkeeping.
/// Contains Duration since Unix Epoch (Unix Timestamp).
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Instant(pub Duration);

impl Instant {
    /// Get the current system time as a Unix Timestamp.
    ///
    /// Queries never call this directly, they ask their [`QueryRuntime`](crate::QueryRuntime).
    pub fn now() -> Self {
        let duration = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Instant(duration)
    }

    /// Creates an instant from milliseconds since the Unix Epoch.
    pub fn from_millis(millis: u64) -> Self {
        Instant(Duration::from_millis(millis))
    }

    /// Milliseconds since the Unix Epoch.
    pub fn as_millis(&self) -> u64 {
        self.0.as_millis() as u64
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    /// Elapsed time between two instants. Saturates at zero.
    #[inline]
    fn sub(self, rhs: Instant) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        Instant(self.0.saturating_add(rhs))
    }
}

impl std::fmt::Display for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_millis())
    }
}

impl std::fmt::Debug for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Instant").field(&self.0.as_millis()).finish()
    }
}

/// Data is stale once strictly more than `stale_time` has elapsed since `updated_at`.
/// No stale time means the data never goes stale by age.
pub(crate) fn is_stale_at(updated_at: Instant, stale_time: Option<Duration>, now: Instant) -> bool {
    match stale_time {
        Some(stale_time) => now - updated_at > stale_time,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtraction_saturates() {
        let earlier = Instant::from_millis(10);
        let later = Instant::from_millis(25);
        assert_eq!(later - earlier, Duration::from_millis(15));
        assert_eq!(earlier - later, Duration::ZERO);
    }

    #[test]
    fn staleness_is_strict() {
        let updated_at = Instant::from_millis(1_000);
        let stale_time = Some(Duration::from_millis(100));

        assert!(!is_stale_at(updated_at, stale_time, Instant::from_millis(1_100)));
        assert!(is_stale_at(updated_at, stale_time, Instant::from_millis(1_101)));
        assert!(!is_stale_at(updated_at, None, Instant::from_millis(u64::MAX / 2)));
    }
}
