//! The IP output builder: the single allocation-bearing path on the send
//! side. Every fragment is drawn from the sending socket's pool, framed,
//! checksummed and handed to the egress device in order.

use std::sync::atomic::{AtomicU16, Ordering};

use super::route::DestRoute;
use crate::rtskb::{Pool, Priority};
use crate::wire::{
    EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Address, Ipv4Packet,
    IPV4_HEADER_LEN,
};
use crate::{Error, Result};

const DEFAULT_TTL: u8 = 255;

static IP_IDENT: AtomicU16 = AtomicU16::new(0x1000);

fn next_ident() -> u16 {
    IP_IDENT.fetch_add(1, Ordering::Relaxed)
}

/// Emit one datagram of `total_len` transport octets towards `route`,
/// fragmenting at the egress MTU. `fill(offset, out)` produces the
/// transport bytes at `offset` of the datagram.
///
/// Fragments are transmitted as they are built; if the pool runs dry or
/// the device rejects a fragment, the datagram is abandoned there and
/// the error reported to the caller.
pub(crate) fn build_xmit(
    pool: &Pool,
    priority: Priority,
    route: &DestRoute,
    src: Ipv4Address,
    protocol: IpProtocol,
    total_len: usize,
    fill: &mut dyn FnMut(usize, &mut [u8]),
) -> Result<()> {
    let dev = &route.rtdev;
    if !dev.is_up() {
        return Err(Error::NetDown);
    }

    let mtu = dev.effective_mtu();
    if mtu <= IPV4_HEADER_LEN {
        return Err(Error::MsgTooLarge);
    }
    // All fragments but the last carry a multiple of eight octets.
    let max_fragment = (mtu - IPV4_HEADER_LEN) & !7;
    if max_fragment == 0 {
        return Err(Error::MsgTooLarge);
    }

    let eth_hlen = EthernetFrame::<&[u8]>::header_len();
    let ident = next_ident();
    let mut offset = 0;

    loop {
        let chunk = max_fragment.min(total_len - offset);
        let more = offset + chunk < total_len;

        let mut skb = pool.alloc(eth_hlen + IPV4_HEADER_LEN + chunk)?;
        skb.priority = priority;
        {
            let region = skb.put(eth_hlen + IPV4_HEADER_LEN + chunk);

            let mut frame = EthernetFrame::new_unchecked(&mut *region);
            EthernetRepr {
                src_addr: dev.hw_addr,
                dst_addr: route.dev_addr,
                ethertype: EthernetProtocol::Ipv4,
            }
            .emit(&mut frame);

            let mut packet = Ipv4Packet::new_unchecked(&mut region[eth_hlen..]);
            packet.set_version(4);
            packet.set_header_len(IPV4_HEADER_LEN as u8);
            packet.set_dscp_ecn(0);
            packet.set_total_len((IPV4_HEADER_LEN + chunk) as u16);
            packet.set_ident(ident);
            packet.set_flags_and_frag_offset(more, offset as u16);
            packet.set_hop_limit(DEFAULT_TTL);
            packet.set_next_header(protocol);
            packet.set_src_addr(src);
            packet.set_dst_addr(route.ip);
            packet.fill_checksum();

            fill(offset, &mut region[eth_hlen + IPV4_HEADER_LEN..]);
        }
        skb.rtdev = Some(dev.clone());

        dev.xmit(skb)?;

        offset += chunk;
        if !more {
            return Ok(());
        }
    }
}
