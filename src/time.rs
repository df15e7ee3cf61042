//! Nanosecond time keeping.
//!
//! [`Instant`] is a monotonic nanosecond count since an arbitrary process
//! epoch; [`Duration`] a nanosecond span. All stack deadlines (receive
//! timeouts, TDMA cycle starts, slot offsets) are expressed in these types.

use core::{fmt, ops};
use std::sync::OnceLock;

fn epoch() -> std::time::Instant {
    static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
    *EPOCH.get_or_init(std::time::Instant::now)
}

/// A point in time, as nanoseconds since the process epoch.
#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Instant {
    nanos: i64,
}

impl Instant {
    pub const ZERO: Instant = Instant::from_nanos(0);

    /// Current monotonic time.
    pub fn now() -> Instant {
        Instant::from_nanos(epoch().elapsed().as_nanos() as i64)
    }

    pub const fn from_nanos(nanos: i64) -> Instant {
        Instant { nanos }
    }

    pub const fn from_micros(micros: i64) -> Instant {
        Instant {
            nanos: micros * 1_000,
        }
    }

    pub const fn from_millis(millis: i64) -> Instant {
        Instant {
            nanos: millis * 1_000_000,
        }
    }

    pub const fn total_nanos(&self) -> i64 {
        self.nanos
    }

    /// Nanoseconds from `self` until `later`, saturating at zero.
    pub fn nanos_until(&self, later: Instant) -> Duration {
        Duration::from_nanos((later.nanos - self.nanos).max(0) as u64)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:09}s", self.nanos / 1_000_000_000, self.nanos % 1_000_000_000)
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant::from_nanos(self.nanos + rhs.nanos as i64)
    }
}

impl ops::AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.nanos += rhs.nanos as i64;
    }
}

impl ops::Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant::from_nanos(self.nanos - rhs.nanos as i64)
    }
}

impl ops::Sub<Instant> for Instant {
    type Output = i64;

    /// Signed distance in nanoseconds.
    fn sub(self, rhs: Instant) -> i64 {
        self.nanos - rhs.nanos
    }
}

/// A span of time in nanoseconds.
#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Duration {
    nanos: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration::from_nanos(0);

    pub const fn from_nanos(nanos: u64) -> Duration {
        Duration { nanos }
    }

    pub const fn from_micros(micros: u64) -> Duration {
        Duration {
            nanos: micros * 1_000,
        }
    }

    pub const fn from_millis(millis: u64) -> Duration {
        Duration {
            nanos: millis * 1_000_000,
        }
    }

    pub const fn total_nanos(&self) -> u64 {
        self.nanos
    }

    pub const fn total_micros(&self) -> u64 {
        self.nanos / 1_000
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ns", self.nanos)
    }
}

impl ops::Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration::from_nanos(self.nanos + rhs.nanos)
    }
}

impl ops::Sub<Duration> for Duration {
    type Output = Duration;

    fn sub(self, rhs: Duration) -> Duration {
        Duration::from_nanos(self.nanos.saturating_sub(rhs.nanos))
    }
}

impl ops::Mul<u64> for Duration {
    type Output = Duration;

    fn mul(self, rhs: u64) -> Duration {
        Duration::from_nanos(self.nanos * rhs)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(value: Duration) -> Self {
        std::time::Duration::from_nanos(value.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_arithmetic() {
        let t = Instant::from_micros(5);
        assert_eq!(t + Duration::from_micros(7), Instant::from_micros(12));
        assert_eq!(t - Duration::from_micros(2), Instant::from_micros(3));
        assert_eq!(Instant::from_micros(12) - t, 7_000);
    }

    #[test]
    fn nanos_until_saturates() {
        let a = Instant::from_millis(2);
        let b = Instant::from_millis(1);
        assert_eq!(a.nanos_until(b), Duration::ZERO);
        assert_eq!(b.nanos_until(a), Duration::from_millis(1));
    }

    #[test]
    fn now_is_monotonic() {
        let a = Instant::now();
        let b = Instant::now();
        assert!(b >= a);
    }
}
