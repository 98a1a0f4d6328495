use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Minimum spacing between outgoing picture-loss indications.
pub const LOSS_INDICATION_INTERVAL: Duration = Duration::from_millis(500);

/// Lock-free gate allowing at most one keyframe request per interval.
///
/// Shared by the packet reader and the event loop; contention resolves with a
/// single compare-and-swap and the loser simply skips its request.
#[derive(Debug)]
pub struct KeyframeRequestLimiter {
    origin: Instant,
    interval_ms: u64,
    // Milliseconds since `origin` plus one; zero means never sent.
    last: AtomicU64,
}

impl KeyframeRequestLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            interval_ms: interval.as_millis() as u64,
            last: AtomicU64::new(0),
        }
    }

    /// Returns true if the caller may send a request now.
    pub fn try_acquire(&self) -> bool {
        let now = self.origin.elapsed().as_millis() as u64 + 1;
        let last = self.last.load(Ordering::Acquire);
        if last != 0 && now.saturating_sub(last) < self.interval_ms {
            return false;
        }
        self.last
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for KeyframeRequestLimiter {
    fn default() -> Self {
        Self::new(LOSS_INDICATION_INTERVAL)
    }
}

/// "Force the next encoded frame to be a keyframe." Last request wins.
#[derive(Debug, Default)]
pub struct KeyframeFlag(AtomicBool);

impl KeyframeFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Reads and clears the flag.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}
