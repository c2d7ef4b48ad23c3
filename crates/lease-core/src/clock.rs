/// Source of epoch-millisecond timestamps used for expiration arithmetic.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock of the local machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock running a fixed offset away from the system clock.
///
/// Useful to simulate a participant whose time drifted from the store.
#[derive(Debug, Clone, Copy)]
pub struct OffsetClock {
    offset_ms: i64,
}

impl OffsetClock {
    pub fn new(offset_ms: i64) -> Self {
        Self { offset_ms }
    }
}

impl Clock for OffsetClock {
    fn now_millis(&self) -> i64 {
        SystemClock.now_millis() + self.offset_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_clock_trails_system_clock() {
        let before = SystemClock.now_millis();
        let skewed = OffsetClock::new(-5_000).now_millis();
        assert!(skewed <= before - 4_000);
    }
}
