// Copyright 2025 Accord project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

///
/// A monotonic clock measured in microseconds since an arbitrary origin.
///
/// All trigger timestamps in the scheduler are expressed against a `Clock`, which keeps the
/// scheduling logic independent of wall time and lets tests drive time explicitly.
///
pub trait Clock: Send + Sync + 'static {
    /// Microseconds elapsed since this clock's origin.
    fn now_us(&self) -> i64;

    /// Milliseconds elapsed since this clock's origin.
    fn now_ms(&self) -> u64 {
        (self.now_us() / 1000) as u64
    }
}

///
/// The production clock: an `Instant` captured at construction.
///
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }
}

///
/// A clock that only moves when told to. Safe to share across the threads under test.
///
pub struct FakeClock {
    now_us: Mutex<i64>,
}

impl FakeClock {
    pub fn new() -> Arc<FakeClock> {
        Arc::new(FakeClock {
            now_us: Mutex::new(0),
        })
    }

    pub fn advance_us(&self, us: i64) {
        *self.now_us.lock() += us;
    }

    pub fn advance_ms(&self, ms: i64) {
        self.advance_us(ms * 1000);
    }

    pub fn set_us(&self, us: i64) {
        *self.now_us.lock() = us;
    }
}

impl Clock for FakeClock {
    fn now_us(&self) -> i64 {
        *self.now_us.lock()
    }
}
