use std::{cmp::Ordering, marker::PhantomData, time::Duration};

use rustix::time::{clock_gettime, ClockId};

/// Monotonic clock, the time base of vblank and vsync timestamps
#[derive(Debug)]
pub struct Monotonic;

impl ClockSource for Monotonic {
    fn id() -> ClockId {
        ClockId::Monotonic
    }
}

/// Id for a clock according to unix clockid_t
pub trait ClockSource {
    /// Gets the id of the clock source
    fn id() -> ClockId;
}

/// Defines a clock with a specific kind
#[derive(Debug)]
pub struct Clock<Kind> {
    _kind: PhantomData<Kind>,
}

impl<Kind: ClockSource> Clock<Kind> {
    /// Initialize a new clock
    pub fn new() -> Self {
        Clock { _kind: PhantomData }
    }

    /// Returns the current time
    pub fn now(&self) -> Time<Kind> {
        let tp = clock_gettime(Kind::id());
        Time::from(Duration::new(tp.tv_sec as u64, tp.tv_nsec as u32))
    }
}

impl<Kind: ClockSource> Default for Clock<Kind> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Kind> Clone for Clock<Kind> {
    fn clone(&self) -> Self {
        Clock { _kind: PhantomData }
    }
}

/// A point in time for a clock with a specific kind
pub struct Time<Kind> {
    tp: Duration,
    _kind: PhantomData<Kind>,
}

impl<Kind> Time<Kind> {
    /// Gets the duration between self and a later time
    ///
    /// Returns [`Duration::ZERO`] if `later` is actually earlier than `self`.
    pub fn duration_since(&self, later: Time<Kind>) -> Duration {
        later.tp.saturating_sub(self.tp)
    }

    /// Returns the time `duration` after this time
    pub fn saturating_add(&self, duration: Duration) -> Time<Kind> {
        Time {
            tp: self.tp.saturating_add(duration),
            _kind: PhantomData,
        }
    }

    /// Returns the timestamp in nanoseconds since the clock's epoch
    pub fn as_nanos(&self) -> u128 {
        self.tp.as_nanos()
    }
}

impl<Kind> Clone for Time<Kind> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Time<Kind> {}

impl<Kind> From<Time<Kind>> for Duration {
    fn from(time: Time<Kind>) -> Self {
        time.tp
    }
}

impl<Kind> From<Duration> for Time<Kind> {
    fn from(tp: Duration) -> Self {
        Time {
            tp,
            _kind: PhantomData,
        }
    }
}

impl<Kind> std::fmt::Debug for Time<Kind> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Time").field("tp", &self.tp).finish()
    }
}

impl<Kind> PartialEq for Time<Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.tp == other.tp
    }
}

impl<Kind> Eq for Time<Kind> {}

impl<Kind> PartialOrd for Time<Kind> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<Kind> Ord for Time<Kind> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tp.cmp(&other.tp)
    }
}
