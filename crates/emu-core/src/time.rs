//! Absolute emulated time.
//!
//! Floppy timing spans from sub-microsecond bit cells up to multi-second
//! motor spin-up, so time is kept as an integer count of picoseconds. A
//! 64-bit counter covers roughly 213 days of emulated time.

use core::fmt;

const PS_PER_NS: u64 = 1_000;
const PS_PER_US: u64 = 1_000_000;
const PS_PER_MS: u64 = 1_000_000_000;
const PS_PER_S: u64 = 1_000_000_000_000;

/// A point in (or span of) emulated time, in picoseconds.
///
/// `Time::NEVER` is the "no such event" sentinel. Arithmetic saturates so
/// that `NEVER` stays `NEVER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(pub u64);

impl Time {
    pub const ZERO: Self = Self(0);
    pub const NEVER: Self = Self(u64::MAX);

    #[must_use]
    pub const fn from_ps(ps: u64) -> Self {
        Self(ps)
    }

    #[must_use]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns * PS_PER_NS)
    }

    #[must_use]
    pub const fn from_micros(us: u64) -> Self {
        Self(us * PS_PER_US)
    }

    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms * PS_PER_MS)
    }

    /// Period of a clock running at `hz`.
    #[must_use]
    pub const fn from_hz(hz: u64) -> Self {
        if hz == 0 {
            Self::NEVER
        } else {
            Self(PS_PER_S / hz)
        }
    }

    /// Duration of `cycles` periods of a clock running at `hz`.
    #[must_use]
    pub const fn from_cycles(cycles: u64, hz: u64) -> Self {
        if hz == 0 {
            Self::NEVER
        } else {
            Self((cycles as u128 * PS_PER_S as u128 / hz as u128) as u64)
        }
    }

    #[must_use]
    pub const fn as_ps(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_never(self) -> bool {
        self.0 == u64::MAX
    }

    /// Shift by a signed number of picoseconds, clamping at zero.
    #[must_use]
    pub const fn offset(self, delta: i64) -> Self {
        if self.is_never() {
            return self;
        }
        if delta >= 0 {
            Self(self.0.saturating_add(delta as u64))
        } else {
            Self(self.0.saturating_sub(delta.unsigned_abs()))
        }
    }

    /// Signed distance `self - earlier` in picoseconds.
    #[must_use]
    pub const fn diff(self, earlier: Self) -> i64 {
        self.0.wrapping_sub(earlier.0) as i64
    }
}

impl core::ops::Add for Time {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl core::ops::AddAssign for Time {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl core::ops::Sub for Time {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        if self.is_never() {
            return self;
        }
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return write!(f, "never");
        }
        let secs = self.0 / PS_PER_S;
        let rem = self.0 % PS_PER_S;
        write!(
            f,
            "{secs}.{:03},{:03},{:03}",
            rem / PS_PER_MS,
            (rem / PS_PER_US) % 1000,
            (rem / PS_PER_NS) % 1000
        )
    }
}
