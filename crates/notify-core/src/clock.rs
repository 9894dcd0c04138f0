use crate::duration::duration_ms;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch.
pub type Timestamp = u64;

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Timestamp;
}

pub fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

pub fn window_start(now: Timestamp, window: Duration) -> Timestamp {
    now.saturating_sub(duration_ms(window))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        now_ms()
    }
}

/// Settable clock shared between clones, for driving windows in tests.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<AtomicU64>,
}

impl MockClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.current.fetch_add(duration_ms(by), Ordering::SeqCst);
    }

    pub fn set(&self, at: Timestamp) {
        self.current.store(at, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> Timestamp {
        self.current.load(Ordering::SeqCst)
    }
}
