//! Address resolution.
//!
//! ARP owns no cache of its own: replies and requests addressed to us
//! are learned straight into the host route table, and `solicit` is the
//! route-solicit operation of the management surface.

use std::sync::Arc;

use crate::device::DeviceRef;
use crate::rtskb::Rtskb;
use crate::stack::Stack;
use crate::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Ipv4Address,
};
use crate::Result;

/// Handle one ARP packet; the payload window starts at the ARP header.
pub(crate) fn rcv(stack: &Arc<Stack>, skb: Box<Rtskb>) {
    let Some(dev) = skb.rtdev.clone() else {
        skb.free();
        return;
    };

    let repr = match ArpPacket::new_checked(skb.payload()).and_then(|p| ArpRepr::parse(&p)) {
        Ok(repr) => repr,
        Err(_) => {
            net_debug!("arp: malformed packet, dropped");
            skb.free();
            return;
        }
    };

    // Only packets about us are interesting; everything they tell us
    // about the sender goes into the host table.
    if repr.target_protocol_addr == dev.local_ip() && !repr.source_protocol_addr.is_unspecified() {
        if stack
            .routes
            .add_host(repr.source_protocol_addr, repr.source_hardware_addr, &dev)
            .is_err()
        {
            net_debug!("arp: host route table full");
        }

        if repr.operation == ArpOperation::Request {
            let _ = send(
                stack,
                &dev,
                ArpOperation::Reply,
                repr.source_hardware_addr,
                repr.source_hardware_addr,
                repr.source_protocol_addr,
            );
        }
    }

    skb.free();
}

/// Broadcast a request for `target`; the answer installs the host route.
pub fn solicit(stack: &Arc<Stack>, dev: &DeviceRef, target: Ipv4Address) -> Result<()> {
    send(
        stack,
        dev,
        ArpOperation::Request,
        EthernetAddress::BROADCAST,
        EthernetAddress::BROADCAST,
        target,
    )
}

fn send(
    stack: &Arc<Stack>,
    dev: &DeviceRef,
    operation: ArpOperation,
    dst_addr: EthernetAddress,
    target_hardware_addr: EthernetAddress,
    target_protocol_addr: Ipv4Address,
) -> Result<()> {
    let eth_hlen = EthernetFrame::<&[u8]>::header_len();
    let repr = ArpRepr {
        operation,
        source_hardware_addr: dev.hw_addr,
        source_protocol_addr: dev.local_ip(),
        target_hardware_addr,
        target_protocol_addr,
    };

    let mut skb = stack.global_pool.alloc(eth_hlen + repr.buffer_len())?;
    {
        let region = skb.put(eth_hlen + repr.buffer_len());
        let mut frame = EthernetFrame::new_unchecked(&mut *region);
        EthernetRepr {
            src_addr: dev.hw_addr,
            dst_addr,
            ethertype: EthernetProtocol::Arp,
        }
        .emit(&mut frame);
        repr.emit(&mut ArpPacket::new_unchecked(frame.payload_mut()));
    }
    skb.rtdev = Some(dev.clone());
    dev.xmit(skb)
}
