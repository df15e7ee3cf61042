/*! Deterministic packet buffers.

An [`Rtskb`] is a pre-allocated packet descriptor: a fixed buffer plus a
payload window described by the offsets `data ≤ tail ≤ end`. Buffers are
owned by [`Pool`]s, bounded FIFOs filled at configuration time; the send
and receive paths only ever move existing buffers, never allocate.

A buffer crosses from one pool to another exclusively through
[`Rtskb::acquire`], which swaps in a compensation buffer from the target
pool so both pools keep their quota. This is what lets a NIC pool survive
an arbitrarily slow consumer: the consumer pays with its own buffers.
*/

mod queue;
pub use self::queue::{PrioQueue, SkbQueue, QUEUE_MAX_PRIO, QUEUE_MIN_PRIO};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::DEFAULT_MAX_RTSKB_SIZE;
use crate::device::DeviceRef;
use crate::sys::RtLock;
use crate::time::Instant;
use crate::wire::checksum;
use crate::wire::EthernetProtocol;
use crate::{Error, Result};

/// Number of live pools, for the buffer statistics view.
static POOL_COUNT: AtomicUsize = AtomicUsize::new(0);
static POOL_COUNT_MAX: AtomicUsize = AtomicUsize::new(0);
/// Number of buffers across all pools, and its high-water mark.
static RTSKB_AMOUNT: AtomicUsize = AtomicUsize::new(0);
static RTSKB_AMOUNT_MAX: AtomicUsize = AtomicUsize::new(0);

fn count_up(counter: &AtomicUsize, max: &AtomicUsize, n: usize) {
    let now = counter.fetch_add(n, Ordering::Relaxed) + n;
    max.fetch_max(now, Ordering::Relaxed);
}

/// Snapshot of the global buffer statistics.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub pools: usize,
    pub pools_max: usize,
    pub rtskbs: usize,
    pub rtskbs_max: usize,
}

pub fn pool_stats() -> PoolStats {
    PoolStats {
        pools: POOL_COUNT.load(Ordering::Relaxed),
        pools_max: POOL_COUNT_MAX.load(Ordering::Relaxed),
        rtskbs: RTSKB_AMOUNT.load(Ordering::Relaxed),
        rtskbs_max: RTSKB_AMOUNT_MAX.load(Ordering::Relaxed),
    }
}

/// Transmit priority: a queueing class (0 is most urgent) plus a channel
/// word a media-access discipline may map to one of its transmit slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority(u32);

impl Priority {
    /// Default class of socket transmissions.
    pub const SOCK_DEF: Priority = Priority::new(16, Self::RT_CHANNEL);
    /// Class used for datagrams forwarded between devices.
    pub const ROUTER_FORWARD: Priority = Priority::new(16, Self::RT_CHANNEL);
    /// Class of ICMP echo replies.
    pub const ICMP_REPLY: Priority = Priority::new(1, Self::RT_CHANNEL);

    /// Channel of real-time transmissions (the discipline's default slot).
    pub const RT_CHANNEL: u16 = 0;
    /// Channel of non-real-time transmissions.
    pub const NRT_CHANNEL: u16 = 1;

    pub const fn new(class: u8, channel: u16) -> Priority {
        Priority(((channel as u32) << 16) | (class as u32 & 0x1f))
    }

    /// Queueing class, clamped to `0..=31`.
    pub const fn class(&self) -> u8 {
        (self.0 & 0x1f) as u8
    }

    /// Discipline channel word.
    pub const fn channel(&self) -> u16 {
        (self.0 >> 16) as u16
    }
}

impl Default for Priority {
    fn default() -> Priority {
        Priority::SOCK_DEF
    }
}

/// How far checksum verification of an ingress packet has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumState {
    /// Not verified yet; `csum` holds a partial sum if nonzero.
    #[default]
    None,
    /// Verified (or verification is pointless, e.g. no UDP checksum).
    Unnecessary,
}

/// Destination class of an ingress frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketType {
    #[default]
    Host,
    Broadcast,
    Multicast,
    OtherHost,
    Outgoing,
}

/// A real-time socket buffer.
pub struct Rtskb {
    /// Next buffer of a fragment chain. A chain is freed as a whole and
    /// delivered to a socket as a whole.
    pub next: Option<Box<Rtskb>>,

    /// The pool this buffer currently belongs to and returns to on free.
    pool: Pool,

    pub priority: Priority,

    /// Ingress/egress device.
    pub rtdev: Option<DeviceRef>,

    pub protocol: EthernetProtocol,
    pub pkt_type: PacketType,

    pub csum: u16,
    pub ip_summed: ChecksumState,

    /// Reception timestamp, taken when the driver queued the buffer.
    pub rx: Instant,

    buf: Box<[u8]>,
    data: usize,
    tail: usize,
    end: usize,

    /// Offset of the network-layer header inside `buf`.
    pub nh: usize,
    /// Offset of the transport-layer header inside `buf`.
    pub th: usize,
}

impl core::fmt::Debug for Rtskb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Rtskb")
            .field("len", &self.len())
            .field("data", &self.data)
            .field("tail", &self.tail)
            .field("end", &self.end)
            .field("chained", &self.next.is_some())
            .finish()
    }
}

impl Rtskb {
    fn new(pool: Pool) -> Rtskb {
        Rtskb {
            next: None,
            pool,
            priority: Priority::default(),
            rtdev: None,
            protocol: EthernetProtocol::Unknown(0),
            pkt_type: PacketType::default(),
            csum: 0,
            ip_summed: ChecksumState::None,
            rx: Instant::ZERO,
            buf: vec![0u8; DEFAULT_MAX_RTSKB_SIZE].into_boxed_slice(),
            data: 0,
            tail: 0,
            end: DEFAULT_MAX_RTSKB_SIZE,
            nh: 0,
            th: 0,
        }
    }

    /// Payload length of this buffer (not counting chained fragments).
    pub fn len(&self) -> usize {
        self.tail - self.data
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buffers in the whole chain.
    pub fn chain_count(&self) -> usize {
        let mut count = 1;
        let mut cur = self.next.as_deref();
        while let Some(skb) = cur {
            count += 1;
            cur = skb.next.as_deref();
        }
        count
    }

    /// Total payload length of the whole chain.
    pub fn chain_len(&self) -> usize {
        let mut len = self.len();
        let mut cur = self.next.as_deref();
        while let Some(skb) = cur {
            len += skb.len();
            cur = skb.next.as_deref();
        }
        len
    }

    /// The current payload window.
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.data..self.tail]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.data..self.tail]
    }

    /// Headroom left in front of the payload.
    pub fn headroom(&self) -> usize {
        self.data
    }

    /// Tailroom left behind the payload.
    pub fn tailroom(&self) -> usize {
        self.end - self.tail
    }

    /// Move the empty payload window forward to leave `len` octets of
    /// headroom.
    pub fn reserve(&mut self, len: usize) {
        debug_assert!(self.data == self.tail, "reserve on non-empty buffer");
        debug_assert!(self.tail + len <= self.end);
        self.data += len;
        self.tail += len;
    }

    /// Extend the payload at the tail by `len` octets and return the new
    /// region. Overruns are programming errors; in release builds the
    /// window is clamped and the caller sees a short slice.
    pub fn put(&mut self, len: usize) -> &mut [u8] {
        debug_assert!(self.tail + len <= self.end, "rtskb put over buffer end");
        let start = self.tail;
        self.tail = (self.tail + len).min(self.end);
        &mut self.buf[start..self.tail]
    }

    /// Extend the payload at the head by `len` octets.
    pub fn push(&mut self, len: usize) -> &mut [u8] {
        debug_assert!(self.data >= len, "rtskb push under buffer start");
        self.data = self.data.saturating_sub(len);
        &mut self.buf[self.data..self.tail]
    }

    /// Shrink the payload at the head by `len` octets. Returns `None` if
    /// the payload is shorter than that.
    pub fn pull(&mut self, len: usize) -> Option<&[u8]> {
        if len > self.len() {
            return None;
        }
        self.data += len;
        Some(&self.buf[self.data..self.tail])
    }

    /// Cut the payload down to `len` octets; longer payloads only.
    pub fn trim(&mut self, len: usize) {
        if self.len() > len {
            self.tail = self.data + len;
        }
    }

    /// Zero-fill the payload up to `len` octets total, for minimum frame
    /// sizes. Fails if the window cannot hold `len`.
    pub fn pad_to(&mut self, len: usize) -> Result<()> {
        if len > self.end - self.data {
            return Err(Error::MsgTooLarge);
        }
        while self.len() < len {
            let missing = len - self.len();
            let region = self.put(missing);
            region.fill(0);
        }
        Ok(())
    }

    /// Offset of `data` from the buffer start; header offsets (`nh`, `th`)
    /// are expressed on the same scale.
    pub fn data_offset(&self) -> usize {
        self.data
    }

    /// Rewind the payload window so it starts at buffer offset `offset`,
    /// keeping the current tail.
    pub fn reset_data(&mut self, offset: usize) {
        debug_assert!(offset <= self.tail);
        self.data = offset.min(self.tail);
    }

    /// A view of the buffer starting at absolute offset `offset` and
    /// running to the current tail; used to re-read an already pulled
    /// header.
    pub fn from_offset(&self, offset: usize) -> &[u8] {
        &self.buf[offset..self.tail]
    }

    /// Mutable variant of [`Self::from_offset`], for patching an already
    /// pulled header in place.
    pub fn from_offset_mut(&mut self, offset: usize) -> &mut [u8] {
        &mut self.buf[offset..self.tail]
    }

    /// Fold a checksum over the payload window into the running `csum`.
    pub fn checksum_payload(&self) -> u16 {
        checksum::data(self.payload())
    }

    /// Transfer this buffer into `target`: one compensation buffer moves
    /// from `target` back to the current pool, and the buffer is rebound
    /// to `target`. The only legal way to move a live buffer across pools.
    pub fn acquire(&mut self, target: &Pool) -> Result<()> {
        let comp = {
            let mut queue = target.inner.queue.lock();
            queue.pop_front().ok_or(Error::OutOfCompensation)?
        };
        self.pool.give_back(comp);
        self.pool = target.clone();
        Ok(())
    }

    /// Return the whole chain, each buffer to the pool it currently
    /// belongs to.
    pub fn free(self: Box<Self>) {
        let mut cur = Some(self);
        while let Some(mut skb) = cur {
            cur = skb.next.take();
            let pool = skb.pool.clone();
            pool.give_back(skb);
        }
    }

    /// Append `frag` to the end of this chain.
    pub fn chain(&mut self, frag: Box<Rtskb>) {
        let mut tail = self;
        while tail.next.is_some() {
            tail = tail.next.as_mut().unwrap();
        }
        tail.next = Some(frag);
    }

    fn recycle(&mut self) {
        self.next = None;
        self.priority = Priority::default();
        self.rtdev = None;
        self.protocol = EthernetProtocol::Unknown(0);
        self.pkt_type = PacketType::default();
        self.csum = 0;
        self.ip_summed = ChecksumState::None;
        self.rx = Instant::ZERO;
        self.data = 0;
        self.tail = 0;
        self.end = self.buf.len();
        self.nh = 0;
        self.th = 0;
    }
}

struct PoolInner {
    queue: RtLock<VecDeque<Box<Rtskb>>>,
    /// Buffers this pool owns in total (free + in flight).
    capacity: AtomicUsize,
}

/// A bounded FIFO of free buffers. Cloning yields another handle to the
/// same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl core::fmt::Debug for Pool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pool")
            .field("free", &self.free_count())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Pool {
    /// Create a pool and fill it with `initial` buffers. Only called from
    /// configuration context; this is the one place buffer memory is
    /// allocated.
    pub fn new(initial: usize) -> Pool {
        let pool = Pool {
            inner: Arc::new(PoolInner {
                queue: RtLock::new(VecDeque::with_capacity(initial.max(1))),
                capacity: AtomicUsize::new(0),
            }),
        };
        count_up(&POOL_COUNT, &POOL_COUNT_MAX, 1);
        pool.extend(initial);
        pool
    }

    /// Add `n` fresh buffers to the pool. Returns the number actually
    /// added.
    pub fn extend(&self, n: usize) -> usize {
        let mut queue = self.inner.queue.lock();
        queue.reserve(n);
        for _ in 0..n {
            queue.push_back(Box::new(Rtskb::new(self.clone())));
        }
        drop(queue);
        self.inner.capacity.fetch_add(n, Ordering::Relaxed);
        count_up(&RTSKB_AMOUNT, &RTSKB_AMOUNT_MAX, n);
        n
    }

    /// Remove up to `n` free buffers from the pool. Returns the number
    /// actually removed; buffers in flight cannot be shrunk away.
    pub fn shrink(&self, n: usize) -> usize {
        let mut removed = 0;
        let mut queue = self.inner.queue.lock();
        for _ in 0..n {
            if queue.pop_front().is_none() {
                break;
            }
            removed += 1;
        }
        drop(queue);
        self.inner.capacity.fetch_sub(removed, Ordering::Relaxed);
        RTSKB_AMOUNT.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    /// Take one buffer and open a payload window of `size` octets at the
    /// buffer start. O(1), no allocation.
    pub fn alloc(&self, size: usize) -> Result<Box<Rtskb>> {
        if size > DEFAULT_MAX_RTSKB_SIZE {
            return Err(Error::MsgTooLarge);
        }
        let mut skb = {
            let mut queue = self.inner.queue.lock();
            queue.pop_front().ok_or(Error::OutOfBuffers)?
        };
        skb.recycle();
        skb.end = size;
        skb.pool = self.clone();
        Ok(skb)
    }

    fn give_back(&self, mut skb: Box<Rtskb>) {
        skb.recycle();
        skb.pool = self.clone();
        self.inner.queue.lock().push_back(skb);
    }

    /// Free buffers currently in the pool.
    pub fn free_count(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Total buffers owned by this pool.
    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::Relaxed)
    }

    /// True once every buffer has come home.
    pub fn is_full(&self) -> bool {
        self.free_count() == self.capacity()
    }

    /// Tear the pool down. The pool must be full: a release with buffers
    /// still in flight is a quota-accounting error.
    pub fn release(&self) {
        debug_assert!(self.is_full(), "pool released with buffers in flight");
        let n = {
            let mut queue = self.inner.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        self.inner.capacity.fetch_sub(n, Ordering::Relaxed);
        RTSKB_AMOUNT.fetch_sub(n, Ordering::Relaxed);
        POOL_COUNT.fetch_sub(1, Ordering::Relaxed);
    }

    /// Two handles to the same pool?
    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_restores_pool() {
        let pool = Pool::new(4);
        assert_eq!(pool.free_count(), 4);

        let skb = pool.alloc(128).unwrap();
        assert_eq!(pool.free_count(), 3);
        skb.free();
        assert_eq!(pool.free_count(), 4);
        assert!(pool.is_full());
    }

    #[test]
    fn alloc_exhaustion() {
        let pool = Pool::new(1);
        let skb = pool.alloc(64).unwrap();
        assert_eq!(pool.alloc(64).unwrap_err(), Error::OutOfBuffers);
        skb.free();
        assert!(pool.alloc(64).is_ok());
    }

    #[test]
    fn oversized_alloc_rejected() {
        let pool = Pool::new(1);
        assert_eq!(
            pool.alloc(DEFAULT_MAX_RTSKB_SIZE + 1).unwrap_err(),
            Error::MsgTooLarge
        );
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn acquire_preserves_both_quotas() {
        let p = Pool::new(2);
        let q = Pool::new(3);

        let mut skb = p.alloc(64).unwrap();
        assert_eq!((p.free_count(), q.free_count()), (1, 3));

        skb.acquire(&q).unwrap();
        // Compensation moved into P; the live buffer now belongs to Q.
        assert_eq!((p.free_count(), q.free_count()), (2, 2));

        skb.free();
        assert_eq!((p.free_count(), q.free_count()), (2, 3));
        assert!(p.is_full() && q.is_full());
    }

    #[test]
    fn acquire_fails_on_empty_target() {
        let p = Pool::new(1);
        let q = Pool::new(0);
        let mut skb = p.alloc(64).unwrap();
        assert_eq!(skb.acquire(&q).unwrap_err(), Error::OutOfCompensation);
        skb.free();
        assert!(p.is_full());
    }

    #[test]
    fn window_arithmetic() {
        let pool = Pool::new(1);
        let mut skb = pool.alloc(100).unwrap();
        skb.reserve(14);
        assert_eq!(skb.headroom(), 14);
        assert_eq!(skb.len(), 0);

        skb.put(20).fill(0xaa);
        assert_eq!(skb.len(), 20);
        assert_eq!(skb.tailroom(), 100 - 14 - 20);

        skb.push(14);
        assert_eq!(skb.len(), 34);
        assert_eq!(skb.headroom(), 0);

        assert!(skb.pull(14).is_some());
        assert_eq!(skb.len(), 20);
        assert!(skb.pull(21).is_none());

        skb.trim(8);
        assert_eq!(skb.len(), 8);
        skb.trim(100);
        assert_eq!(skb.len(), 8);

        skb.free();
    }

    #[test]
    fn pad_to_zero_fills() {
        let pool = Pool::new(1);
        let mut skb = pool.alloc(64).unwrap();
        skb.put(2).copy_from_slice(&[0xff, 0xff]);
        skb.pad_to(6).unwrap();
        assert_eq!(skb.payload(), &[0xff, 0xff, 0, 0, 0, 0]);
        assert!(skb.pad_to(65).is_err());
        skb.free();
    }

    #[test]
    fn chain_free_returns_every_fragment() {
        let p = Pool::new(2);
        let q = Pool::new(1);

        let mut head = p.alloc(64).unwrap();
        let frag = q.alloc(64).unwrap();
        head.chain(frag);
        assert_eq!((p.free_count(), q.free_count()), (1, 0));

        head.free();
        assert_eq!((p.free_count(), q.free_count()), (2, 1));
    }

    #[test]
    fn chain_len_sums_fragments() {
        let pool = Pool::new(3);
        let mut head = pool.alloc(64).unwrap();
        head.put(10);
        let mut frag = pool.alloc(64).unwrap();
        frag.put(7);
        head.chain(frag);
        assert_eq!(head.chain_len(), 17);
        head.free();
    }

    #[test]
    fn extend_and_shrink_are_symmetric() {
        let pool = Pool::new(2);
        assert_eq!(pool.extend(3), 3);
        assert_eq!(pool.capacity(), 5);
        assert_eq!(pool.shrink(4), 4);
        assert_eq!(pool.capacity(), 1);
        // Cannot shrink below what is free.
        let skb = pool.alloc(64).unwrap();
        assert_eq!(pool.shrink(1), 0);
        skb.free();
    }
}
