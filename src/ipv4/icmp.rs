//! ICMP: echo requests are answered from one process-wide reply socket
//! whose pool was sized at stack start, so no request ever allocates.

use std::sync::Arc;

use super::output;
use crate::config::ICMP_REPLY_POOL_SIZE;
use crate::rtskb::{Priority, Rtskb};
use crate::socket::{SocketInner, SocketKind, SocketRef};
use crate::stack::Stack;
use crate::wire::{
    checksum, Icmpv4Message, Icmpv4Packet, IpProtocol, Ipv4Packet, ICMPV4_HEADER_LEN,
};

const NR_ICMP_TYPES: usize = 18;

#[derive(Clone, Copy)]
enum Action {
    Echo,
    Discard,
}

struct Control {
    action: Action,
    /// Classed as an error message; never answered.
    error: bool,
}

const fn discard(error: bool) -> Control {
    Control {
        action: Action::Discard,
        error,
    }
}

/// Static type table, indexed directly by the message type.
static CONTROLS: [Control; NR_ICMP_TYPES + 1] = [
    // echo reply (0)
    discard(false),
    discard(true),
    discard(true),
    // destination unreachable (3)
    discard(true),
    // source quench (4)
    discard(true),
    // redirect (5)
    discard(true),
    discard(true),
    discard(true),
    // echo request (8)
    Control {
        action: Action::Echo,
        error: false,
    },
    discard(true),
    discard(true),
    // time exceeded (11)
    discard(true),
    // parameter problem (12)
    discard(true),
    // timestamp (13)
    discard(false),
    // timestamp reply (14)
    discard(false),
    // info request (15)
    discard(false),
    // info reply (16)
    discard(false),
    // address mask request (17)
    discard(false),
    // address mask reply (18)
    discard(false),
];

/// The process-wide reply state.
pub struct Icmp {
    reply_socket: SocketRef,
}

impl Icmp {
    pub fn new() -> Icmp {
        let sock = SocketInner::new(ICMP_REPLY_POOL_SIZE, SocketKind::Icmp);
        sock.core.param.lock().priority = Priority::ICMP_REPLY;
        Icmp { reply_socket: sock }
    }

    /// The static reply socket; all fields but the pool are constant, so
    /// concurrent use needs no further locking.
    pub(crate) fn reply_socket(&self) -> SocketRef {
        self.reply_socket.clone()
    }

    pub(crate) fn shutdown(&self) {
        while !self.reply_socket.core.pool.is_full() {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        self.reply_socket.core.pool.release();
    }
}

impl Default for Icmp {
    fn default() -> Self {
        Icmp::new()
    }
}

/// Handle one ICMP message; the payload window starts at the ICMP
/// header. The buffer was acquired into the reply socket's pool.
pub(crate) fn rcv(stack: &Arc<Stack>, skb: Box<Rtskb>) {
    if skb.len() < ICMPV4_HEADER_LEN {
        net_debug!("icmp: truncated message, dropped");
        skb.free();
        return;
    }
    if checksum::data(skb.payload()) != !0 {
        net_debug!("icmp: bad checksum, dropped");
        skb.free();
        return;
    }

    let packet = Icmpv4Packet::new_unchecked(skb.payload());
    let msg_type = u8::from(packet.msg_type()) as usize;
    if msg_type > NR_ICMP_TYPES {
        net_debug!("icmp: unknown type {}, dropped", msg_type);
        skb.free();
        return;
    }

    match CONTROLS[msg_type].action {
        Action::Echo => echo_reply(stack, &skb),
        Action::Discard => {
            if CONTROLS[msg_type].error {
                net_trace!("icmp: error message discarded");
            }
        }
    }
    skb.free();
}

/// Answer an echo request: same identifier, sequence number and data,
/// sent back to the requester out of the reply pool.
fn echo_reply(stack: &Arc<Stack>, skb: &Rtskb) {
    let request = Icmpv4Packet::new_unchecked(skb.payload());
    let requester = Ipv4Packet::new_unchecked(skb.from_offset(skb.nh)).src_addr();

    let Ok(route) = stack.routes.output(requester) else {
        net_debug!("icmp: no route back to {}", requester);
        return;
    };

    let mut header = [0u8; ICMPV4_HEADER_LEN];
    {
        let mut reply = Icmpv4Packet::new_unchecked(&mut header[..]);
        reply.set_msg_type(Icmpv4Message::EchoReply);
        reply.set_msg_code(0);
        reply.set_checksum(0);
        reply.set_echo_ident(request.echo_ident());
        reply.set_echo_seq_no(request.echo_seq_no());
    }
    let data = &skb.payload()[ICMPV4_HEADER_LEN..];
    let csum = !checksum::combine(&[checksum::data(&header), checksum::data(data)]);
    Icmpv4Packet::new_unchecked(&mut header[..]).set_checksum(csum);

    let reply_sock = stack.icmp.reply_socket();
    let total_len = ICMPV4_HEADER_LEN + data.len();
    let src = route.rtdev.local_ip();
    let result = output::build_xmit(
        &reply_sock.core.pool,
        reply_sock.core.priority(),
        &route,
        src,
        IpProtocol::Icmp,
        total_len,
        &mut |offset, out| {
            let mut at = offset;
            let mut filled = 0;
            if at < ICMPV4_HEADER_LEN {
                let take = (ICMPV4_HEADER_LEN - at).min(out.len());
                out[..take].copy_from_slice(&header[at..at + take]);
                filled = take;
                at += take;
            }
            if filled < out.len() {
                let data_at = at - ICMPV4_HEADER_LEN;
                let remaining = out.len() - filled;
                out[filled..].copy_from_slice(&data[data_at..data_at + remaining]);
            }
        },
    );
    if let Err(err) = result {
        net_debug!("icmp: echo reply failed: {}", err);
    }
}
