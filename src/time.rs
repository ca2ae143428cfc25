use chrono::{DateTime, Duration, Utc};
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};

pub type Timestamp = DateTime<Utc>;

/// Source of wall-clock time for lease bookkeeping.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock pinned to a fixed origin that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Timestamp,
    offset_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(origin: Timestamp) -> Self {
        Self {
            origin,
            offset_ms: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn origin(&self) -> Timestamp {
        self.origin
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.origin + Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}
