/*! IPv4 ingress, transport dispatch and the bounded protocol registry.

The receive side validates the header, applies the input routing rule,
reassembles fragments, and hands complete datagrams to the registered
transport handler, acquiring each buffer into the destination socket's
pool on the way. The send side lives in [`output`].
*/

pub mod arp;
pub mod fragment;
pub mod icmp;
pub mod output;
pub mod route;

pub use self::fragment::Collectors;
pub use self::route::{DestRoute, HostRouteRow, NetRouteRow, Routes};

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::rtskb::{Priority, Rtskb};
use crate::socket::udp;
use crate::stack::Stack;
use crate::sys::RtLock;
use crate::wire::{EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Packet};
use crate::{Error, Result};

/// Slots in the transport-protocol registry.
pub const MAX_INET_PROTOCOLS: usize = 32;

/// The transports this stack can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Udp,
    Icmp,
}

impl ProtocolKind {
    pub fn number(&self) -> IpProtocol {
        match self {
            ProtocolKind::Udp => IpProtocol::Udp,
            ProtocolKind::Icmp => IpProtocol::Icmp,
        }
    }
}

/// Bounded table keyed by IP protocol number.
///
/// Mutation happens only while the stack manager is not dispatching
/// (stack start/stop); each number has at most one handler.
pub struct ProtocolRegistry {
    slots: RtLock<[Option<ProtocolKind>; MAX_INET_PROTOCOLS]>,
}

fn protocol_hash(protocol: IpProtocol) -> usize {
    (u8::from(protocol) as usize) & (MAX_INET_PROTOCOLS - 1)
}

impl ProtocolRegistry {
    pub fn new() -> ProtocolRegistry {
        ProtocolRegistry {
            slots: RtLock::new([None; MAX_INET_PROTOCOLS]),
        }
    }

    pub fn add(&self, kind: ProtocolKind) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = &mut slots[protocol_hash(kind.number())];
        match slot {
            Some(existing) if *existing != kind => Err(Error::AlreadyExists),
            _ => {
                *slot = Some(kind);
                Ok(())
            }
        }
    }

    pub fn del(&self, kind: ProtocolKind) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = &mut slots[protocol_hash(kind.number())];
        match slot {
            Some(existing) if *existing == kind => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::NotFound),
        }
    }

    pub fn lookup(&self, protocol: IpProtocol) -> Option<ProtocolKind> {
        let slots = self.slots.lock();
        slots[protocol_hash(protocol)].filter(|kind| kind.number() == protocol)
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        ProtocolRegistry::new()
    }
}

/// IPv4 ingress. The payload window starts at the IP header.
pub(crate) fn ip_rcv(stack: &Arc<Stack>, mut skb: Box<Rtskb>) {
    let Some(dev) = skb.rtdev.clone() else {
        skb.free();
        return;
    };

    let (daddr, header_len, frag) = {
        let data = skb.payload();
        let packet = Ipv4Packet::new_unchecked(data);
        if data.len() < crate::wire::IPV4_HEADER_LEN
            || packet.version() != 4
            || usize::from(packet.header_len()) < crate::wire::IPV4_HEADER_LEN
            || usize::from(packet.total_len()) < usize::from(packet.header_len())
            || data.len() < usize::from(packet.total_len())
            || !packet.verify_checksum()
        {
            net_debug!("ipv4: malformed header, dropped");
            dev.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            skb.free();
            return;
        }
        (
            packet.dst_addr(),
            usize::from(packet.header_len()),
            (packet.more_frags(), packet.frag_offset()),
        )
    };

    // Cut off link-layer padding.
    let total_len = {
        let packet = Ipv4Packet::new_unchecked(skb.payload());
        usize::from(packet.total_len())
    };
    skb.trim(total_len);
    skb.nh = skb.data_offset();

    if !route::route_input(&dev, daddr) {
        if stack.forwarding() {
            route_forward(stack, skb, daddr);
        } else {
            net_debug!("ipv4: {} not for us, dropped", daddr);
            skb.free();
        }
        return;
    }

    let (key, protocol) = {
        let packet = Ipv4Packet::new_unchecked(skb.payload());
        (packet.frag_key(), packet.next_header())
    };

    skb.pull(header_len);
    skb.th = skb.data_offset();

    let kind = stack.protocols.lookup(protocol);

    let (more_frags, frag_offset) = frag;
    if more_frags || frag_offset != 0 {
        let Some(kind) = kind else {
            dev.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            skb.free();
            return;
        };
        if let Some(chain) = stack
            .collectors
            .defrag(stack, skb, key, frag_offset, more_frags, kind)
        {
            deliver_chain(stack, chain, kind);
        }
        return;
    }

    match kind {
        Some(kind) => deliver_local(stack, skb, kind),
        None => {
            net_debug!("ipv4: no handler for {}, dropped", protocol);
            dev.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            skb.free();
        }
    }
}

/// Deliver one complete, unfragmented datagram: resolve the socket,
/// acquire the buffer into its pool, enqueue and wake.
fn deliver_local(stack: &Arc<Stack>, mut skb: Box<Rtskb>, kind: ProtocolKind) {
    let dev = skb.rtdev.clone();

    match kind {
        ProtocolKind::Udp => {
            if !udp::checksum_ok(&skb) {
                net_debug!("udp: bad checksum, dropped");
                if let Some(dev) = dev.as_ref() {
                    dev.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
                }
                skb.free();
                return;
            }
            let Some(sock) = udp::dest_socket(stack, &skb) else {
                net_debug!("udp: no socket bound, dropped");
                if let Some(dev) = dev.as_ref() {
                    dev.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
                }
                skb.free();
                return;
            };
            if skb.acquire(&sock.core.pool).is_err() {
                if let Some(dev) = dev.as_ref() {
                    dev.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
                }
                skb.free();
                return;
            }
            udp::rcv(&sock, skb);
        }
        ProtocolKind::Icmp => {
            let sock = stack.icmp.reply_socket();
            if skb.acquire(&sock.core.pool).is_err() {
                if let Some(dev) = dev.as_ref() {
                    dev.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
                }
                skb.free();
                return;
            }
            icmp::rcv(stack, skb);
        }
    }
}

/// Deliver a reassembled chain; the fragments were already acquired into
/// the destination socket's pool by the collector.
fn deliver_chain(stack: &Arc<Stack>, skb: Box<Rtskb>, kind: ProtocolKind) {
    match kind {
        ProtocolKind::Udp => {
            let Some(sock) = udp::dest_socket(stack, &skb) else {
                skb.free();
                return;
            };
            udp::rcv(&sock, skb);
        }
        ProtocolKind::Icmp => icmp::rcv(stack, skb),
    }
}

/// Forward a datagram that is not addressed to us. Runs only when the
/// stack was configured as a router.
fn route_forward(stack: &Arc<Stack>, mut skb: Box<Rtskb>, daddr: crate::wire::Ipv4Address) {
    if skb.acquire(&stack.global_pool).is_err() {
        net_debug!("ipv4: router overloaded, dropped");
        skb.free();
        return;
    }
    let Ok(dest) = stack.routes.output(daddr) else {
        net_debug!("ipv4: cannot forward to {}", daddr);
        skb.free();
        return;
    };

    skb.priority = Priority::ROUTER_FORWARD;

    // The link-layer header sits untouched in the headroom; rewrite it
    // for the egress hop.
    skb.push(EthernetFrame::<&[u8]>::header_len());
    {
        let mut frame = EthernetFrame::new_unchecked(skb.payload_mut());
        EthernetRepr {
            src_addr: dest.rtdev.hw_addr,
            dst_addr: dest.dev_addr,
            ethertype: EthernetProtocol::Ipv4,
        }
        .emit(&mut frame);
    }
    skb.rtdev = Some(dest.rtdev.clone());
    let _ = dest.rtdev.xmit(skb);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_add_lookup_del() {
        let registry = ProtocolRegistry::new();
        registry.add(ProtocolKind::Udp).unwrap();
        registry.add(ProtocolKind::Icmp).unwrap();
        assert_eq!(registry.lookup(IpProtocol::Udp), Some(ProtocolKind::Udp));
        assert_eq!(registry.lookup(IpProtocol::Icmp), Some(ProtocolKind::Icmp));
        assert_eq!(registry.lookup(IpProtocol::Unknown(200)), None);

        registry.del(ProtocolKind::Udp).unwrap();
        assert_eq!(registry.lookup(IpProtocol::Udp), None);
        assert_eq!(registry.del(ProtocolKind::Udp).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn registry_add_is_idempotent() {
        let registry = ProtocolRegistry::new();
        registry.add(ProtocolKind::Udp).unwrap();
        registry.add(ProtocolKind::Udp).unwrap();
        assert_eq!(registry.lookup(IpProtocol::Udp), Some(ProtocolKind::Udp));
    }
}
