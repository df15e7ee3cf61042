//! Packet-family sockets: raw link-layer send and receive through the
//! packet-type registry.

use std::sync::{Arc, Weak};

use super::{LinkEndpoint, LinkRecv, MsgFlags, SocketInner, SocketKind, SocketRef};
use crate::stack::{PacketTypeHandler, Stack};
use crate::sys::RtLock;
use crate::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr};
use crate::{Error, Result};

/// Family state of a packet socket.
pub struct PacketState {
    bound: RtLock<Option<Bind>>,
}

struct Bind {
    protocol: EthernetProtocol,
    ifindex: usize,
    pack_id: usize,
}

impl PacketState {
    fn new() -> PacketState {
        PacketState {
            bound: RtLock::new(None),
        }
    }
}

/// Packet-type registry entry delivering into one socket.
struct SocketHandler {
    sock: Weak<SocketInner>,
    ifindex: usize,
}

impl PacketTypeHandler for SocketHandler {
    fn rcv(&self, mut skb: Box<crate::rtskb::Rtskb>, _stack: &Arc<Stack>) {
        let Some(sock) = self.sock.upgrade() else {
            skb.free();
            return;
        };
        if sock.core.is_closed() {
            skb.free();
            return;
        }
        if self.ifindex != 0
            && skb
                .rtdev
                .as_ref()
                .map_or(true, |dev| dev.ifindex() != self.ifindex)
        {
            skb.free();
            return;
        }
        if let Err(err) = skb.acquire(&sock.core.pool) {
            net_debug!("packet socket delivery failed: {}", err);
            if let Some(dev) = skb.rtdev.as_ref() {
                dev.stats
                    .rx_dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            skb.free();
            return;
        }
        sock.core.incoming.queue_tail(skb);
        sock.core.pending.signal();
        sock.core.notify();
    }
}

/// Create a packet socket; with a nonzero protocol it is receive-bound
/// immediately.
pub(crate) fn socket(stack: &Arc<Stack>, protocol: Option<EthernetProtocol>) -> Result<SocketRef> {
    let sock = SocketInner::new(
        stack.config.socket_rtskbs,
        SocketKind::Packet(PacketState::new()),
    );
    if let Some(protocol) = protocol {
        bind(stack, &sock, protocol, 0)?;
    }
    Ok(sock)
}

fn packet_state(sock: &SocketInner) -> &PacketState {
    match &sock.kind {
        SocketKind::Packet(state) => state,
        _ => unreachable!("packet operation on non-packet socket"),
    }
}

pub(crate) fn bind(
    stack: &Arc<Stack>,
    sock: &SocketRef,
    protocol: EthernetProtocol,
    ifindex: usize,
) -> Result<()> {
    let state = packet_state(sock);

    let handler = Arc::new(SocketHandler {
        sock: Arc::downgrade(sock),
        ifindex,
    });
    let pack_id = stack.packet_types.add_pack(protocol, handler)?;

    let old = {
        let mut bound = state.bound.lock();
        bound.replace(Bind {
            protocol,
            ifindex,
            pack_id,
        })
    };
    if let Some(old) = old {
        let _ = stack.packet_types.remove_pack(old.pack_id);
    }
    Ok(())
}

pub(crate) fn close(stack: &Stack, sock: &SocketRef) {
    let state = packet_state(sock);
    if let Some(bound) = state.bound.lock().take() {
        let _ = stack.packet_types.remove_pack(bound.pack_id);
    }
}

pub(crate) fn sendmsg(
    stack: &Arc<Stack>,
    sock: &SocketRef,
    buf: &[u8],
    to: LinkEndpoint,
) -> Result<usize> {
    let state = packet_state(sock);
    let ifindex = match state.bound.lock().as_ref() {
        Some(bound) if bound.ifindex != 0 => bound.ifindex,
        _ => return Err(Error::NotConnected),
    };
    let dev = stack.devices.get_by_index(ifindex).ok_or(Error::NetDown)?;

    let frame_len = EthernetFrame::<&[u8]>::buffer_len(buf.len());
    if frame_len > dev.effective_mtu() + EthernetFrame::<&[u8]>::header_len() {
        return Err(Error::MsgTooLarge);
    }

    let mut skb = sock.core.pool.alloc(frame_len)?;
    skb.priority = sock.core.priority();
    {
        let region = skb.put(frame_len);
        let mut frame = EthernetFrame::new_unchecked(&mut *region);
        EthernetRepr {
            src_addr: dev.hw_addr,
            dst_addr: to.addr,
            ethertype: to.protocol,
        }
        .emit(&mut frame);
        frame.payload_mut()[..buf.len()].copy_from_slice(buf);
    }
    skb.rtdev = Some(dev.clone());
    dev.xmit(skb)?;
    Ok(buf.len())
}

pub(crate) fn recvmsg(sock: &SocketRef, buf: &mut [u8], flags: MsgFlags) -> Result<LinkRecv> {
    sock.core.wait_pending(flags)?;
    let Some(skb) = sock.core.incoming.dequeue() else {
        return Err(Error::WouldBlock);
    };

    // Packet sockets see the whole frame from the link-layer header on.
    let frame = EthernetFrame::new_unchecked(skb.payload());
    let from = LinkEndpoint {
        addr: frame.src_addr(),
        protocol: frame.ethertype(),
    };
    let ifindex = skb.rtdev.as_ref().map_or(0, |dev| dev.ifindex());

    let len = skb.len().min(buf.len());
    buf[..len].copy_from_slice(&skb.payload()[..len]);
    let truncated = len < skb.len();

    if flags.contains(MsgFlags::PEEK) {
        sock.core.incoming.queue_head(skb);
        sock.core.pending.signal();
    } else {
        skb.free();
    }

    Ok(LinkRecv {
        len,
        from,
        ifindex,
        truncated,
    })
}

pub(crate) fn getsockname(
    stack: &Stack,
    state: &PacketState,
) -> Result<(usize, EthernetAddress, EthernetProtocol)> {
    let bound = state.bound.lock();
    let Some(bound) = bound.as_ref() else {
        return Ok((0, EthernetAddress::default(), EthernetProtocol::Unknown(0)));
    };
    let addr = stack
        .devices
        .get_by_index(bound.ifindex)
        .map(|dev| dev.hw_addr)
        .unwrap_or_default();
    Ok((bound.ifindex, addr, bound.protocol))
}
