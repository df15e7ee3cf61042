//! Transmit slots: the schedulable unit of a TDMA cycle.

use crate::rtskb::PrioQueue;
use crate::time::Duration;

/// The default slot carries all real-time traffic without an explicit
/// slot assignment.
pub const DEFAULT_SLOT: usize = 0;
/// Non-real-time traffic goes here; aliases [`DEFAULT_SLOT`] until it is
/// configured separately.
pub const DEFAULT_NRT_SLOT: usize = 1;

/// One transmit window inside the cycle.
///
/// `period` and `phasing` sub-schedule the slot: it fires in cycle `n`
/// iff `n % period == phasing`. Within one firing at most one frame
/// leaves the queue.
pub struct Slot {
    pub id: usize,
    /// Nanosecond offset of the firing inside the cycle.
    pub offset: Duration,
    pub period: u64,
    pub phasing: u64,
    /// Largest frame this slot may carry.
    pub mtu: usize,
    pub queue: PrioQueue,
}

impl Slot {
    pub fn new(id: usize, offset: Duration, period: u64, phasing: u64, mtu: usize) -> Slot {
        Slot {
            id,
            offset,
            period: period.max(1),
            phasing,
            mtu,
            queue: PrioQueue::new(16),
        }
    }

    /// Does this slot fire in cycle number `cycle_no`?
    pub fn fires_in(&self, cycle_no: u64) -> bool {
        cycle_no % self.period == self.phasing % self.period
    }
}

impl core::fmt::Debug for Slot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("period", &self.period)
            .field("phasing", &self.phasing)
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phasing_subschedule() {
        let every = Slot::new(2, Duration::from_micros(100), 1, 0, 1500);
        assert!(every.fires_in(0) && every.fires_in(1) && every.fires_in(7));

        let odd = Slot::new(3, Duration::from_micros(200), 2, 1, 1500);
        assert!(!odd.fires_in(0));
        assert!(odd.fires_in(1));
        assert!(!odd.fires_in(2));
        assert!(odd.fires_in(3));
    }
}
