//! UDP sockets: port registry with automatic assignment, bind/connect
//! semantics, fragmenting send path and chain-delivering receive path.

use std::sync::Arc;

use super::{MsgFlags, RecvMsg, SocketInner, SocketKind, SocketRef};
use crate::config::{ModuleConfig, RT_UDP_SOCKETS_MAX};
use crate::ipv4::output;
use crate::rtskb::Rtskb;
use crate::stack::Stack;
use crate::sys::RtLock;
use crate::wire::{
    checksum, Endpoint, IpProtocol, Ipv4Packet, Ipv4Address, UdpPacket, IPV4_HEADER_LEN,
    UDP_HEADER_LEN,
};
use crate::{Error, Result};

/// Family state of an UDP socket.
pub struct UdpState {
    inet: RtLock<InetState>,
}

struct InetState {
    connected: bool,
    saddr: Ipv4Address,
    sport: u16,
    daddr: Ipv4Address,
    dport: u16,
    reg_index: Option<usize>,
}

impl UdpState {
    fn new(reg_index: usize, sport: u16) -> UdpState {
        UdpState {
            inet: RtLock::new(InetState {
                connected: false,
                saddr: Ipv4Address::UNSPECIFIED,
                sport,
                daddr: Ipv4Address::UNSPECIFIED,
                dport: 0,
                reg_index: Some(reg_index),
            }),
        }
    }

    pub fn local_endpoint(&self) -> Endpoint {
        let inet = self.inet.lock();
        Endpoint::new(inet.saddr, inet.sport)
    }
}

struct PortEntry {
    sport: u16,
    saddr: Ipv4Address,
    sock: SocketRef,
}

struct PortInner {
    bitmap: [u32; RT_UDP_SOCKETS_MAX / 32],
    entries: Vec<Option<PortEntry>>,
    free: usize,
}

/// The bounded UDP port registry.
///
/// Invariant: bit `k` of the bitmap is set iff `entries[k]` holds a live
/// socket. Slot `k` owns the automatically assigned port
/// `auto_port_start + k`; the whole automatic range is fenced off from
/// explicit binds.
pub struct PortRegistry {
    inner: RtLock<PortInner>,
    limit: usize,
    auto_port_start: u16,
    auto_port_mask: u16,
}

impl PortRegistry {
    pub fn new(config: &ModuleConfig) -> PortRegistry {
        PortRegistry {
            inner: RtLock::new(PortInner {
                bitmap: [0; RT_UDP_SOCKETS_MAX / 32],
                entries: (0..config.udp_sockets).map(|_| None).collect(),
                free: config.udp_sockets,
            }),
            limit: config.udp_sockets,
            auto_port_start: config.auto_port_start,
            auto_port_mask: config.auto_port_mask,
        }
    }

    pub fn auto_port_start(&self) -> u16 {
        self.auto_port_start
    }

    /// True if `port` lies inside the reserved automatic range.
    pub fn in_auto_range(&self, port: u16) -> bool {
        (port & self.auto_port_mask) == self.auto_port_start
    }

    /// Claim the first free slot; the socket is attached right after its
    /// construction.
    fn claim(&self) -> Result<(usize, u16)> {
        let mut inner = self.inner.lock();
        if inner.free == 0 {
            return Err(Error::Again);
        }
        let index = (0..self.limit)
            .find(|&k| inner.bitmap[k / 32] & (1 << (k % 32)) == 0)
            .expect("free count positive");
        inner.bitmap[index / 32] |= 1 << (index % 32);
        inner.free -= 1;
        let sport = self.auto_port_start + index as u16;
        Ok((index, sport))
    }

    fn attach(&self, index: usize, sport: u16, sock: &SocketRef) {
        self.inner.lock().entries[index] = Some(PortEntry {
            sport,
            saddr: Ipv4Address::UNSPECIFIED,
            sock: sock.clone(),
        });
    }

    fn update(&self, index: usize, sport: u16, saddr: Ipv4Address) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries[index].as_mut() {
            entry.sport = sport;
            entry.saddr = saddr;
        }
    }

    fn unregister(&self, index: usize) {
        let mut inner = self.inner.lock();
        inner.bitmap[index / 32] &= !(1 << (index % 32));
        inner.entries[index] = None;
        inner.free += 1;
    }

    /// Find the socket addressed by `(daddr, dport)`.
    pub(crate) fn lookup(&self, daddr: Ipv4Address, dport: u16) -> Option<SocketRef> {
        let inner = self.inner.lock();
        for k in 0..self.limit {
            if inner.bitmap[k / 32] & (1 << (k % 32)) == 0 {
                continue;
            }
            let Some(entry) = inner.entries[k].as_ref() else {
                continue;
            };
            if entry.sport == dport
                && (entry.saddr.is_unspecified() || entry.saddr == daddr)
            {
                return Some(entry.sock.clone());
            }
        }
        None
    }

    /// (bound slots, capacity) for the snapshot views.
    pub fn usage(&self) -> (usize, usize) {
        (self.limit - self.inner.lock().free, self.limit)
    }
}

/// Create and register an UDP socket.
pub(crate) fn socket(stack: &Arc<Stack>) -> Result<SocketRef> {
    let (index, sport) = stack.ports.claim()?;
    let sock = SocketInner::new(
        stack.config.socket_rtskbs,
        SocketKind::Udp(UdpState::new(index, sport)),
    );
    stack.ports.attach(index, sport, &sock);
    Ok(sock)
}

fn udp_state(sock: &SocketInner) -> &UdpState {
    match &sock.kind {
        SocketKind::Udp(state) => state,
        _ => unreachable!("UDP operation on non-UDP socket"),
    }
}

pub(crate) fn bind(
    stack: &Arc<Stack>,
    sock: &SocketRef,
    addr: Ipv4Address,
    port: u16,
) -> Result<()> {
    if port != 0 && stack.ports.in_auto_range(port) {
        return Err(Error::InvalidInput);
    }

    let state = udp_state(sock);
    let mut inet = state.inet.lock();
    let index = inet.reg_index.ok_or(Error::NotSocket)?;
    if inet.connected {
        return Err(Error::InvalidInput);
    }

    inet.saddr = addr;
    if port != 0 {
        inet.sport = port;
    }
    let (sport, saddr) = (inet.sport, inet.saddr);
    drop(inet);

    stack.ports.update(index, sport, saddr);
    Ok(())
}

pub(crate) fn connect(
    stack: &Arc<Stack>,
    sock: &SocketRef,
    addr: Ipv4Address,
    port: u16,
) -> Result<()> {
    let state = udp_state(sock);
    let mut inet = state.inet.lock();
    let index = inet.reg_index.ok_or(Error::NotSocket)?;

    if addr.is_unspecified() {
        // Reset the association and the automatically assigned port.
        inet.saddr = Ipv4Address::UNSPECIFIED;
        inet.sport = stack.ports.auto_port_start() + index as u16;
        inet.daddr = Ipv4Address::UNSPECIFIED;
        inet.dport = 0;
        inet.connected = false;
        let (sport, saddr) = (inet.sport, inet.saddr);
        drop(inet);
        stack.ports.update(index, sport, saddr);
    } else {
        if inet.connected {
            return Err(Error::InvalidInput);
        }
        inet.connected = true;
        inet.daddr = addr;
        inet.dport = port;
    }
    Ok(())
}

pub(crate) fn close(stack: &Stack, sock: &SocketRef) {
    let state = udp_state(sock);
    let index = {
        let mut inet = state.inet.lock();
        inet.connected = false;
        inet.reg_index.take()
    };
    if let Some(index) = index {
        stack.ports.unregister(index);
    }

    // Half-assembled datagrams headed for this socket go with it.
    stack.collectors.invalidate_socket(sock);
}

pub(crate) fn sendmsg(
    stack: &Arc<Stack>,
    sock: &SocketRef,
    buf: &[u8],
    to: Option<Endpoint>,
    _flags: MsgFlags,
) -> Result<usize> {
    if buf.len() > 0xFFFF - IPV4_HEADER_LEN - UDP_HEADER_LEN {
        return Err(Error::MsgTooLarge);
    }

    let state = udp_state(sock);
    let (saddr, sport, daddr, dport) = {
        let inet = state.inet.lock();
        match to {
            Some(to) => (inet.saddr, inet.sport, to.addr, to.port),
            None => {
                if !inet.connected {
                    return Err(Error::NotConnected);
                }
                (inet.saddr, inet.sport, inet.daddr, inet.dport)
            }
        }
    };
    if daddr.is_unspecified() && dport == 0 {
        return Err(Error::InvalidInput);
    }

    let route = stack.routes.output(daddr)?;
    if !saddr.is_unspecified() && saddr != route.rtdev.local_ip() {
        return Err(Error::HostUnreachable);
    }
    let src = route.rtdev.local_ip();

    let ulen = UDP_HEADER_LEN + buf.len();

    // RFC 768 checksum over pseudo header, UDP header and payload.
    let mut header = [0u8; UDP_HEADER_LEN];
    {
        let mut udp = UdpPacket::new_unchecked(&mut header[..]);
        udp.set_src_port(sport);
        udp.set_dst_port(dport);
        udp.set_len(ulen as u16);
        udp.set_checksum(0);
    }
    let sum = checksum::combine(&[
        checksum::pseudo_header(&src, &daddr, IpProtocol::Udp, ulen as u32),
        checksum::data(&header),
        checksum::data(buf),
    ]);
    let csum = match !sum {
        0 => 0xffff,
        folded => folded,
    };
    UdpPacket::new_unchecked(&mut header[..]).set_checksum(csum);

    let priority = sock.core.priority();
    output::build_xmit(
        &sock.core.pool,
        priority,
        &route,
        src,
        IpProtocol::Udp,
        ulen,
        &mut |offset, out| {
            // The virtual datagram is the header followed by the payload.
            let mut at = offset;
            let mut filled = 0;
            if at < UDP_HEADER_LEN {
                let take = (UDP_HEADER_LEN - at).min(out.len());
                out[..take].copy_from_slice(&header[at..at + take]);
                filled = take;
                at += take;
            }
            if filled < out.len() {
                let data_at = at - UDP_HEADER_LEN;
                let remaining = out.len() - filled;
                out[filled..].copy_from_slice(&buf[data_at..data_at + remaining]);
            }
        },
    )?;

    Ok(buf.len())
}

pub(crate) fn recvmsg(sock: &SocketRef, buf: &mut [u8], flags: MsgFlags) -> Result<RecvMsg> {
    sock.core.wait_pending(flags)?;
    let Some(mut skb) = sock.core.incoming.dequeue() else {
        return Err(Error::WouldBlock);
    };

    // The head buffer starts at the UDP header; the IP header is still
    // reachable behind it for the source address.
    let (src, data_len) = {
        let udp = UdpPacket::new_unchecked(skb.payload());
        let ip = Ipv4Packet::new_unchecked(skb.from_offset(skb.nh));
        let data_len = (udp.len() as usize).saturating_sub(UDP_HEADER_LEN);
        (Endpoint::new(ip.src_addr(), udp.src_port()), data_len)
    };

    skb.pull(UDP_HEADER_LEN);

    let mut remaining = data_len;
    let mut copied = 0;
    let mut truncated = false;
    let mut cur: Option<&mut Rtskb> = Some(&mut skb);
    while let Some(frag) = cur {
        frag.trim(remaining);
        let mut block = frag.len();
        remaining -= block;

        if copied + block > buf.len() {
            block = buf.len() - copied;
            truncated = true;
            buf[copied..copied + block].copy_from_slice(&frag.payload()[..block]);
            copied += block;
            break;
        }
        buf[copied..copied + block].copy_from_slice(&frag.payload()[..block]);
        copied += block;

        cur = frag.next.as_deref_mut();
    }
    if remaining > 0 {
        truncated = true;
    }

    if flags.contains(MsgFlags::PEEK) {
        skb.push(UDP_HEADER_LEN);
        sock.core.incoming.queue_head(skb);
        sock.core.pending.signal();
    } else {
        skb.free();
    }

    Ok(RecvMsg {
        len: copied,
        from: src,
        truncated,
    })
}

/// Resolve the destination socket of an ingress datagram whose payload
/// window starts at the UDP header. First fragments carry only part of
/// the datagram, so only the header itself must be present.
pub(crate) fn dest_socket(stack: &Stack, skb: &Rtskb) -> Option<SocketRef> {
    if skb.payload().len() < UDP_HEADER_LEN {
        return None;
    }
    let udp = UdpPacket::new_unchecked(skb.payload());
    let ip = Ipv4Packet::new_unchecked(skb.from_offset(skb.nh));
    let mut daddr = ip.dst_addr();

    // Broadcasts are delivered to sockets bound to the local address.
    if let Some(dev) = skb.rtdev.as_ref() {
        if daddr == dev.broadcast_ip() {
            daddr = dev.local_ip();
        }
    }

    stack.ports.lookup(daddr, udp.dst_port())
}

/// Verify the checksum of a complete, unfragmented datagram.
pub(crate) fn checksum_ok(skb: &Rtskb) -> bool {
    let Ok(udp) = UdpPacket::new_checked(skb.payload()) else {
        return false;
    };
    let ip = Ipv4Packet::new_unchecked(skb.from_offset(skb.nh));
    udp.verify_checksum(&ip.src_addr(), &ip.dst_addr())
}

/// Deliver a datagram (or a complete fragment chain) to its socket.
pub(crate) fn rcv(sock: &SocketRef, skb: Box<Rtskb>) {
    sock.core.incoming.queue_tail(skb);
    sock.core.pending.signal();
    sock.core.notify();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;
    use crate::socket::SocketKind;

    fn registry() -> PortRegistry {
        PortRegistry::new(&ModuleConfig {
            udp_sockets: 8,
            auto_port_mask: !7,
            ..ModuleConfig::default()
        })
    }

    fn dummy_sock() -> SocketRef {
        SocketInner::new(0, SocketKind::Icmp)
    }

    fn register(registry: &PortRegistry) -> (usize, u16) {
        let slot = registry.claim().unwrap();
        registry.attach(slot.0, slot.1, &dummy_sock());
        slot
    }

    #[test]
    fn auto_assignment_uses_slot_index() {
        let registry = registry();
        assert_eq!(register(&registry), (0, 1024));
        assert_eq!(register(&registry), (1, 1025));
    }

    #[test]
    fn exhaustion_and_reuse() {
        let registry = registry();
        let mut slots = Vec::new();
        for _ in 0..8 {
            slots.push(register(&registry));
        }
        assert_eq!(registry.claim().unwrap_err(), Error::Again);

        registry.unregister(slots[3].0);
        assert_eq!(register(&registry), (3, 1027));
    }

    #[test]
    fn lookup_honours_bound_address() {
        let registry = registry();
        let (index, sport) = register(&registry);

        // Unspecified source address matches any destination.
        assert!(registry.lookup(Ipv4Address::new(10, 0, 0, 1), sport).is_some());

        registry.update(index, sport, Ipv4Address::new(10, 0, 0, 1));
        assert!(registry.lookup(Ipv4Address::new(10, 0, 0, 1), sport).is_some());
        assert!(registry.lookup(Ipv4Address::new(10, 0, 0, 2), sport).is_none());
        assert!(registry.lookup(Ipv4Address::new(10, 0, 0, 1), sport + 1).is_none());
    }

    #[test]
    fn bitmap_mirrors_registry() {
        let registry = registry();
        let (index, _) = register(&registry);
        assert_eq!(registry.usage(), (1, 8));
        registry.unregister(index);
        assert_eq!(registry.usage(), (0, 8));
    }
}
