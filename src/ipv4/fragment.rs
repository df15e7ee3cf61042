/*! IP defragmentation collectors.

A small fixed array of reassembly records. Fragments must arrive in
order (a schedule-managed link does not reorder); an out-of-order
fragment discards the whole chain. Every collector access advances a
tick counter, and any record untouched for [`GARBAGE_COLLECT_LIMIT`]
ticks is reclaimed before a new record is allocated — under normal
conditions the garbage collection never fires.

Each fragment is acquired into the destination socket's pool as it is
chained, so reassembly consumes only the receiving socket's budget.
*/

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::ProtocolKind;
use crate::config::{COLLECTOR_COUNT, GARBAGE_COLLECT_LIMIT};
use crate::rtskb::Rtskb;
use crate::socket::{udp, SocketRef};
use crate::stack::Stack;
use crate::sys::RtLock;
use crate::wire::{Ipv4FragKey, Ipv4Packet, IPV4_HEADER_LEN};

struct Collector {
    key: Ipv4FragKey,
    chain: Box<Rtskb>,
    /// Transport octets accumulated so far; the expected offset of the
    /// next fragment.
    buf_size: usize,
    sock: SocketRef,
    last_accessed: u32,
}

struct Inner {
    counter: u32,
    slots: [Option<Collector>; COLLECTOR_COUNT],
}

/// The defragmentation state of one stack instance.
pub struct Collectors {
    inner: RtLock<Inner>,
}

impl Collectors {
    pub fn new() -> Collectors {
        Collectors {
            inner: RtLock::new(Inner {
                counter: 0,
                slots: core::array::from_fn(|_| None),
            }),
        }
    }

    /// Number of reassemblies in flight.
    pub fn active(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    fn tick(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.counter += 1;
        inner.counter
    }

    fn drop_counted(skb: Box<Rtskb>) {
        if let Some(dev) = skb.rtdev.as_ref() {
            dev.stats
                .rx_dropped
                .fetch_add(skb.chain_count() as u64, Ordering::Relaxed);
        }
        skb.free();
    }

    /// Feed one fragment in. Returns the complete chain once the last
    /// fragment arrived, `None` while the datagram is still partial or
    /// was discarded.
    pub(crate) fn defrag(
        &self,
        stack: &Arc<Stack>,
        skb: Box<Rtskb>,
        key: Ipv4FragKey,
        offset: u16,
        more_frags: bool,
        kind: ProtocolKind,
    ) -> Option<Box<Rtskb>> {
        let tick = self.tick();
        if offset == 0 {
            self.first_fragment(stack, skb, key, kind, tick);
            None
        } else {
            self.add_fragment(skb, key, offset, more_frags, tick)
        }
    }

    fn first_fragment(
        &self,
        stack: &Arc<Stack>,
        mut skb: Box<Rtskb>,
        key: Ipv4FragKey,
        kind: ProtocolKind,
        tick: u32,
    ) {
        let sock = match kind {
            ProtocolKind::Udp => match udp::dest_socket(stack, &skb) {
                Some(sock) => sock,
                None => {
                    Self::drop_counted(skb);
                    return;
                }
            },
            ProtocolKind::Icmp => stack.icmp.reply_socket(),
        };
        if sock.core.is_closed() || skb.acquire(&sock.core.pool).is_err() {
            net_debug!("defrag: compensation pool empty, fragment dropped");
            Self::drop_counted(skb);
            return;
        }

        // Reclaim abandoned collectors, then take a free slot. Freeing
        // happens after the table lock is gone.
        let mut garbage: heapless::Vec<Box<Rtskb>, COLLECTOR_COUNT> = heapless::Vec::new();
        let installed = {
            let mut inner = self.inner.lock();
            for slot in inner.slots.iter_mut() {
                let stale = slot
                    .as_ref()
                    .is_some_and(|c| tick.wrapping_sub(c.last_accessed) > GARBAGE_COLLECT_LIMIT);
                if stale {
                    let collector = slot.take().expect("stale slot occupied");
                    let _ = garbage.push(collector.chain);
                    net_debug!("defrag: reclaimed abandoned reassembly");
                }
            }

            let buf_size = skb.len();
            match inner.slots.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => {
                    *slot = Some(Collector {
                        key,
                        chain: skb,
                        buf_size,
                        sock,
                        last_accessed: tick,
                    });
                    None
                }
                None => Some(skb),
            }
        };

        for chain in garbage {
            chain.free();
        }
        if let Some(skb) = installed {
            net_debug!("defrag: no collector available, fragment dropped");
            Self::drop_counted(skb);
        }
    }

    fn add_fragment(
        &self,
        mut skb: Box<Rtskb>,
        key: Ipv4FragKey,
        offset: u16,
        more_frags: bool,
        tick: u32,
    ) -> Option<Box<Rtskb>> {
        // Pull the matching collector out so no table lock is held while
        // pools are touched.
        let taken = {
            let mut inner = self.inner.lock();
            let position = inner
                .slots
                .iter()
                .position(|slot| slot.as_ref().is_some_and(|c| c.key == key));
            position.map(|i| inner.slots[i].take().expect("matched slot occupied"))
        };
        let Some(mut collector) = taken else {
            net_debug!("defrag: fragment without reassembly, dropped");
            Self::drop_counted(skb);
            return None;
        };

        if skb.acquire(&collector.sock.core.pool).is_err() {
            net_debug!("defrag: compensation pool empty, chain dropped");
            Self::drop_counted(skb);
            Self::drop_counted(collector.chain);
            return None;
        }

        if usize::from(offset) != collector.buf_size {
            net_debug!("defrag: unordered fragment, chain dropped");
            collector.chain.chain(skb);
            Self::drop_counted(collector.chain);
            return None;
        }

        collector.buf_size += skb.len();
        collector.chain.chain(skb);
        collector.last_accessed = tick;

        if more_frags {
            let closed = collector.sock.core.is_closed();
            if closed {
                collector.chain.free();
                return None;
            }
            let mut inner = self.inner.lock();
            let slot = inner
                .slots
                .iter_mut()
                .find(|slot| slot.is_none())
                .expect("slot vacated above");
            *slot = Some(collector);
            None
        } else {
            // Completion: patch the head's total length so the chain
            // reads as one datagram.
            let head = &mut collector.chain;
            let nh = head.nh;
            let total = collector.buf_size + IPV4_HEADER_LEN;
            let mut packet = Ipv4Packet::new_unchecked(head.from_offset_mut(nh));
            packet.set_total_len(total as u16);
            Some(collector.chain)
        }
    }

    /// Discard every reassembly headed for `sock`; part of socket close.
    pub(crate) fn invalidate_socket(&self, sock: &SocketRef) {
        let mut chains: heapless::Vec<Box<Rtskb>, COLLECTOR_COUNT> = heapless::Vec::new();
        {
            let mut inner = self.inner.lock();
            for slot in inner.slots.iter_mut() {
                let matches = slot
                    .as_ref()
                    .is_some_and(|c| Arc::ptr_eq(&c.sock, sock));
                if matches {
                    let collector = slot.take().expect("matched slot occupied");
                    let _ = chains.push(collector.chain);
                }
            }
        }
        for chain in chains {
            chain.free();
        }
    }
}

impl Default for Collectors {
    fn default() -> Self {
        Collectors::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_active_initially() {
        let collectors = Collectors::new();
        assert_eq!(collectors.active(), 0);
    }
}
