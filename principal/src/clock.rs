use chrono::{DateTime, Utc};

/// `clock.now()` is the sole ambient dependency of the core. Pure
/// matcher/builder code never calls `Utc::now()`
/// directly; it takes a `&dyn Clock` and reads through it, so tests can
/// supply a fixed or stepped reading instead.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock double for tests: always returns the same instant
/// unless advanced explicitly.
#[derive(Debug, Clone)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
