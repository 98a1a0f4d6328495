use std::time::Duration;

pub const DEFAULT_MAX_EXPONENT: u32 = 4;

/// Exponential retry delay: `2^min(n, cap) - 1` seconds after `n`
/// consecutive operational failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    failures: u32,
    max_exponent: u32,
}

impl Backoff {
    pub fn new(max_exponent: u32) -> Self {
        Self {
            failures: 0,
            max_exponent: max_exponent.min(31),
        }
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn delay(&self) -> Duration {
        let exponent = self.failures.min(self.max_exponent);
        Duration::from_secs((1u64 << exponent) - 1)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EXPONENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_then_caps() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.delay(), Duration::ZERO);
        let mut delays = Vec::new();
        for _ in 0..6 {
            backoff.record_failure();
            delays.push(backoff.delay().as_secs());
        }
        assert_eq!(delays, vec![1, 3, 7, 15, 15, 15]);
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::default();
        backoff.record_failure();
        backoff.record_failure();
        backoff.reset();
        backoff.record_failure();
        assert_eq!(backoff.delay(), Duration::from_secs(1));
        assert_eq!(backoff.failures(), 1);
    }
}
