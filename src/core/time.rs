//! Tick based time keeping.
//!
//! Handlers do not read a wall clock. A fixed frequency timer calls
//! `Clock::tick()` and every timeout is expressed as a number of ticks. The
//! counter is a single atomic word so the timer interrupt can advance it
//! while the receive and task sides read it.

use std::sync::atomic::{
    AtomicU32,
    Ordering,
};

/// Frequency of the timer driving the clocks, timeouts are tuned for it.
pub const TIMER_FREQUENCY_HZ: u32 = 2;

/// A point in time measured in ticks since the clock was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Instant(u32);

/// A wrapping tick counter.
#[derive(Debug, Default)]
pub struct Clock {
    now: AtomicU32,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            now: AtomicU32::new(0),
        }
    }

    /// Advances the clock by one tick, wrapping around at u32::MAX.
    pub fn tick(&self) {
        self.now.fetch_add(1, Ordering::Relaxed);
    }

    pub fn now(&self) -> Instant {
        Instant(self.now.load(Ordering::Relaxed))
    }

    /// Returns the ticks passed since then, correct across a single wraparound.
    pub fn elapsed(&self, then: Instant) -> u32 {
        self.now().0.wrapping_sub(then.0)
    }
}
