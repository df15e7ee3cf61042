//! Bounded buffer queues: a plain FIFO and a 32-class priority queue with
//! O(1) dequeue via a usage bitmap.

use std::collections::VecDeque;

use super::Rtskb;
use crate::sys::RtLock;

/// Most urgent queueing class.
pub const QUEUE_MAX_PRIO: u8 = 0;
/// Least urgent queueing class.
pub const QUEUE_MIN_PRIO: u8 = 31;

const PRIO_CLASSES: usize = QUEUE_MIN_PRIO as usize + 1;

/// FIFO of buffers (or chains), spinlock-protected.
pub struct SkbQueue {
    inner: RtLock<VecDeque<Box<Rtskb>>>,
}

impl SkbQueue {
    /// Queue capacity is reserved up front; enqueueing within it never
    /// allocates.
    pub fn new(capacity: usize) -> SkbQueue {
        SkbQueue {
            inner: RtLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn queue_head(&self, skb: Box<Rtskb>) {
        self.inner.lock().push_front(skb);
    }

    pub fn queue_tail(&self, skb: Box<Rtskb>) {
        self.inner.lock().push_back(skb);
    }

    pub fn dequeue(&self) -> Option<Box<Rtskb>> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the queue, freeing every buffer to its pool.
    pub fn purge(&self) {
        while let Some(skb) = self.dequeue() {
            skb.free();
        }
    }
}

impl core::fmt::Debug for SkbQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SkbQueue").field("len", &self.len()).finish()
    }
}

struct PrioInner {
    usage: u32,
    qlen: usize,
    classes: [VecDeque<Box<Rtskb>>; PRIO_CLASSES],
}

/// Priority queue with insertion order preserved inside each class.
///
/// `dequeue` picks the lowest-numbered non-empty class by scanning the
/// usage bitmap, independent of how many buffers are queued.
pub struct PrioQueue {
    inner: RtLock<PrioInner>,
}

impl PrioQueue {
    pub fn new(capacity_per_class: usize) -> PrioQueue {
        PrioQueue {
            inner: RtLock::new(PrioInner {
                usage: 0,
                qlen: 0,
                classes: core::array::from_fn(|_| VecDeque::with_capacity(capacity_per_class)),
            }),
        }
    }

    pub fn enqueue(&self, skb: Box<Rtskb>) {
        let class = skb.priority.class().min(QUEUE_MIN_PRIO) as usize;
        let mut inner = self.inner.lock();
        inner.classes[class].push_back(skb);
        inner.usage |= 1 << class;
        inner.qlen += 1;
    }

    pub fn dequeue(&self) -> Option<Box<Rtskb>> {
        let mut inner = self.inner.lock();
        if inner.usage == 0 {
            return None;
        }
        let class = inner.usage.trailing_zeros() as usize;
        let skb = inner.classes[class].pop_front();
        if inner.classes[class].is_empty() {
            inner.usage &= !(1 << class);
        }
        inner.qlen -= 1;
        skb
    }

    pub fn len(&self) -> usize {
        self.inner.lock().qlen
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn purge(&self) {
        while let Some(skb) = self.dequeue() {
            skb.free();
        }
    }
}

impl core::fmt::Debug for PrioQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PrioQueue").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtskb::{Pool, Priority};

    #[test]
    fn fifo_order() {
        let pool = Pool::new(3);
        let queue = SkbQueue::new(3);
        for tag in 1u8..=3 {
            let mut skb = pool.alloc(16).unwrap();
            skb.put(1)[0] = tag;
            queue.queue_tail(skb);
        }
        for tag in 1u8..=3 {
            let skb = queue.dequeue().unwrap();
            assert_eq!(skb.payload()[0], tag);
            skb.free();
        }
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn queue_head_prepends() {
        let pool = Pool::new(2);
        let queue = SkbQueue::new(2);
        let mut first = pool.alloc(16).unwrap();
        first.put(1)[0] = 1;
        queue.queue_tail(first);
        let mut urgent = pool.alloc(16).unwrap();
        urgent.put(1)[0] = 2;
        queue.queue_head(urgent);

        let skb = queue.dequeue().unwrap();
        assert_eq!(skb.payload()[0], 2);
        skb.free();
        queue.purge();
    }

    #[test]
    fn prio_dequeue_prefers_lower_class() {
        let pool = Pool::new(4);
        let queue = PrioQueue::new(4);

        for (class, tag) in [(20u8, 1u8), (5, 2), (20, 3), (5, 4)] {
            let mut skb = pool.alloc(16).unwrap();
            skb.priority = Priority::new(class, 0);
            skb.put(1)[0] = tag;
            queue.enqueue(skb);
        }

        // Class 5 first, in insertion order; then class 20.
        let order: Vec<u8> = core::iter::from_fn(|| {
            queue.dequeue().map(|skb| {
                let tag = skb.payload()[0];
                skb.free();
                tag
            })
        })
        .collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn purge_frees_to_pool() {
        let pool = Pool::new(2);
        let queue = PrioQueue::new(2);
        queue.enqueue(pool.alloc(16).unwrap());
        queue.enqueue(pool.alloc(16).unwrap());
        assert_eq!(pool.free_count(), 0);
        queue.purge();
        assert_eq!(pool.free_count(), 2);
        assert!(queue.is_empty());
    }
}
