//! End-to-end exercises over software devices: loopback datagrams,
//! fragmentation, routing, the TDMA schedule and socket-table limits.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;

use super::Stack;
use crate::config::ModuleConfig;
use crate::device::{Device, DeviceFlags, DeviceRef, Driver, Loopback, TxResult};
use crate::mgmt::{self, CoreRequest};
use crate::rtmac::tdma::{Tdma, TdmaFlags};
use crate::rtmac::MacDiscipline;
use crate::rtskb::Rtskb;
use crate::socket::{CallContext, MsgFlags};
use crate::wire::{
    Endpoint, EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol,
    Ipv4Address, Ipv4Packet, UdpPacket, IPV4_HEADER_LEN,
};
use crate::{Error, Result};

const RECV_TIMEOUT_NS: i64 = 2_000_000_000;

fn loopback(name: &str, mtu: usize) -> DeviceRef {
    Device::new_ethernet(
        name,
        EthernetAddress([0x02, 0, 0, 0, 0, 0x01]),
        mtu,
        DeviceFlags::LOOPBACK,
        Box::new(Loopback::new()),
    )
}

/// Records every transmitted frame instead of sending it anywhere.
struct SinkDriver {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Driver for SinkDriver {
    fn open(&mut self, _dev: &DeviceRef) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self, _dev: &DeviceRef) -> Result<()> {
        Ok(())
    }

    fn hard_start_xmit(&mut self, skb: Box<Rtskb>, _dev: &DeviceRef) -> TxResult {
        self.sent.lock().unwrap().push(skb.payload().to_vec());
        skb.free();
        Ok(())
    }
}

/// One end of a point-to-point link: frames transmitted here appear on
/// the peer's receive queue.
struct PairDriver {
    peer: Arc<Mutex<Weak<Device>>>,
}

impl Driver for PairDriver {
    fn open(&mut self, _dev: &DeviceRef) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self, _dev: &DeviceRef) -> Result<()> {
        Ok(())
    }

    fn hard_start_xmit(&mut self, skb: Box<Rtskb>, _dev: &DeviceRef) -> TxResult {
        match self.peer.lock().unwrap().upgrade() {
            Some(peer) => {
                peer.stats.count_rx(skb.len());
                peer.netif_rx(skb);
                peer.rx_mark();
                Ok(())
            }
            None => Err((Error::NetDown, skb)),
        }
    }
}

fn wired_pair(stack: &Arc<Stack>) -> (DeviceRef, DeviceRef) {
    let a_peer = Arc::new(Mutex::new(Weak::new()));
    let b_peer = Arc::new(Mutex::new(Weak::new()));
    let a = Device::new_ethernet(
        "rteth0",
        EthernetAddress([0x02, 0, 0, 0, 0, 0xa]),
        1500,
        DeviceFlags::empty(),
        Box::new(PairDriver {
            peer: a_peer.clone(),
        }),
    );
    let b = Device::new_ethernet(
        "rteth1",
        EthernetAddress([0x02, 0, 0, 0, 0, 0xb]),
        1500,
        DeviceFlags::empty(),
        Box::new(PairDriver {
            peer: b_peer.clone(),
        }),
    );
    *a_peer.lock().unwrap() = Arc::downgrade(&b);
    *b_peer.lock().unwrap() = Arc::downgrade(&a);
    stack.register_device(&a).unwrap();
    stack.register_device(&b).unwrap();
    (a, b)
}

#[test]
fn loopback_udp_echo() {
    let stack = Stack::new(ModuleConfig::default());
    let dev = loopback("rtlo", 1500);
    stack.register_device(&dev).unwrap();
    stack
        .ifup(
            "rtlo",
            Ipv4Address::new(127, 0, 0, 1),
            Ipv4Address::new(255, 0, 0, 0),
        )
        .unwrap();

    let a = stack.socket_udp().unwrap();
    a.bind(Ipv4Address::new(127, 0, 0, 1), 35000).unwrap();
    a.connect(Ipv4Address::new(127, 0, 0, 1), 35001).unwrap();

    let b = stack.socket_udp().unwrap();
    b.bind(Ipv4Address::new(127, 0, 0, 1), 35001).unwrap();
    b.set_timeout(RECV_TIMEOUT_NS);

    assert_eq!(a.sendmsg(b"PING", None, MsgFlags::empty()).unwrap(), 4);

    let mut buf = [0u8; 16];
    let recv = b.recvmsg(&mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(recv.len, 4);
    assert_eq!(&buf[..4], b"PING");
    assert_eq!(recv.from, Endpoint::new(Ipv4Address::new(127, 0, 0, 1), 35000));
    assert!(!recv.truncated);

    drop(a);
    drop(b);
    stack.ifdown("rtlo").unwrap();
    stack.unregister_device(&dev).unwrap();
    stack.shutdown();
}

#[test]
fn fragmented_udp_roundtrip() {
    let stack = Stack::new(ModuleConfig::default());
    let dev = loopback("rtlo", 576);
    stack.register_device(&dev).unwrap();
    stack
        .ifup(
            "rtlo",
            Ipv4Address::new(127, 0, 0, 1),
            Ipv4Address::new(255, 0, 0, 0),
        )
        .unwrap();

    let a = stack.socket_udp().unwrap();
    a.bind(Ipv4Address::new(127, 0, 0, 1), 35000).unwrap();
    let b = stack.socket_udp().unwrap();
    b.bind(Ipv4Address::new(127, 0, 0, 1), 35001).unwrap();
    b.set_timeout(RECV_TIMEOUT_NS);
    // Headroom for two datagrams in flight; also exercises the pool
    // configuration path, which real-time callers are barred from.
    a.extend_pool(CallContext::Nrt, 16).unwrap();
    b.extend_pool(CallContext::Nrt, 16).unwrap();
    assert_eq!(
        a.extend_pool(CallContext::Rt, 1).unwrap_err(),
        Error::AccessDenied
    );

    let payload: Vec<u8> = (0..2048u32).map(|i| (i * 7 + 3) as u8).collect();
    let sent = a
        .sendmsg(
            &payload,
            Some(Endpoint::new(Ipv4Address::new(127, 0, 0, 1), 35001)),
            MsgFlags::empty(),
        )
        .unwrap();
    assert_eq!(sent, 2048);

    let mut buf = vec![0u8; 2048];
    let recv = b.recvmsg(&mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(recv.len, 2048);
    assert_eq!(buf, payload);
    assert!(!recv.truncated);

    // Reassembly state is gone once the datagram completed.
    assert_eq!(stack.collectors.active(), 0);

    // A shorter buffer cuts the datagram and reports it.
    a.sendmsg(
        &payload,
        Some(Endpoint::new(Ipv4Address::new(127, 0, 0, 1), 35001)),
        MsgFlags::empty(),
    )
    .unwrap();
    let mut short = vec![0u8; 1000];
    let recv = b.recvmsg(&mut short, MsgFlags::empty()).unwrap();
    assert_eq!(recv.len, 1000);
    assert!(recv.truncated);
    assert_eq!(short[..], payload[..1000]);

    drop(a);
    drop(b);
    stack.ifdown("rtlo").unwrap();
    stack.unregister_device(&dev).unwrap();
    stack.shutdown();
}

/// Build one raw UDP-fragment frame for direct injection.
fn frag_frame(
    dev: &DeviceRef,
    ident: u16,
    frag_offset: u16,
    more: bool,
    payload: &[u8],
) -> Vec<u8> {
    let eth_hlen = EthernetFrame::<&[u8]>::header_len();
    let mut bytes = vec![0u8; eth_hlen + IPV4_HEADER_LEN + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut bytes[..]);
    EthernetRepr {
        src_addr: EthernetAddress([0x02, 0, 0, 0, 0, 0x77]),
        dst_addr: dev.hw_addr,
        ethertype: EthernetProtocol::Ipv4,
    }
    .emit(&mut frame);

    let mut packet = Ipv4Packet::new_unchecked(&mut bytes[eth_hlen..]);
    packet.set_version(4);
    packet.set_header_len(IPV4_HEADER_LEN as u8);
    packet.set_dscp_ecn(0);
    packet.set_total_len((IPV4_HEADER_LEN + payload.len()) as u16);
    packet.set_ident(ident);
    packet.set_flags_and_frag_offset(more, frag_offset);
    packet.set_hop_limit(255);
    packet.set_next_header(IpProtocol::Udp);
    packet.set_src_addr(Ipv4Address::new(127, 0, 0, 1));
    packet.set_dst_addr(Ipv4Address::new(127, 0, 0, 1));
    packet.fill_checksum();
    packet.payload_mut().copy_from_slice(payload);
    bytes
}

fn inject(stack: &Arc<Stack>, dev: &DeviceRef, bytes: &[u8]) {
    let mut skb = stack.global_pool.alloc(bytes.len()).unwrap();
    skb.put(bytes.len()).copy_from_slice(bytes);
    dev.netif_rx(skb);
    dev.rx_mark();
}

#[test]
fn out_of_order_fragment_drops_chain() {
    let stack = Stack::new(ModuleConfig::default());
    stack.global_pool.extend(8);
    let dev = loopback("rtlo", 576);
    stack.register_device(&dev).unwrap();
    stack
        .ifup(
            "rtlo",
            Ipv4Address::new(127, 0, 0, 1),
            Ipv4Address::new(255, 0, 0, 0),
        )
        .unwrap();

    let b = stack.socket_udp().unwrap();
    b.bind(Ipv4Address::new(127, 0, 0, 1), 35001).unwrap();

    // First fragment: a valid UDP header claiming a 1104-byte datagram.
    let mut first = vec![0u8; 552];
    {
        let mut udp = UdpPacket::new_unchecked(&mut first[..]);
        udp.set_src_port(35000);
        udp.set_dst_port(35001);
        udp.set_len(1112);
        udp.set_checksum(0);
    }
    inject(&stack, &dev, &frag_frame(&dev, 0x42, 0, true, &first));
    // The middle fragment never arrives; the closing fragment lands at
    // the wrong offset and takes the whole chain with it.
    inject(
        &stack,
        &dev,
        &frag_frame(&dev, 0x42, 1104, false, &[0u8; 8]),
    );

    std::thread::sleep(StdDuration::from_millis(200));

    let mut buf = [0u8; 64];
    assert_eq!(
        b.recvmsg(&mut buf, MsgFlags::DONTWAIT).unwrap_err(),
        Error::WouldBlock
    );
    // Both fragments of the aborted datagram are on the books.
    assert_eq!(dev.stats.rx_dropped.load(Ordering::Relaxed), 2);
    assert_eq!(stack.collectors.active(), 0);

    drop(b);
    stack.ifdown("rtlo").unwrap();
    stack.unregister_device(&dev).unwrap();
    stack.shutdown();
}

#[test]
fn host_route_add_then_send() {
    let stack = Stack::new(ModuleConfig::default());
    let sent = Arc::new(Mutex::new(Vec::new()));
    let dev = Device::new_ethernet(
        "rteth0",
        EthernetAddress([0x02, 0, 0, 0, 0, 0x01]),
        1500,
        DeviceFlags::empty(),
        Box::new(SinkDriver { sent: sent.clone() }),
    );
    stack.register_device(&dev).unwrap();
    stack
        .ifup(
            "rteth0",
            Ipv4Address::new(192, 168, 0, 1),
            Ipv4Address::new(255, 255, 255, 0),
        )
        .unwrap();

    let peer_mac = EthernetAddress([0x02, 0, 0, 0, 0, 0x02]);
    mgmt::core_ioctl(
        &stack,
        CoreRequest::HostRouteAdd {
            ip: Ipv4Address::new(192, 168, 0, 2),
            hw_addr: peer_mac,
            ifname: "rteth0".into(),
        },
    )
    .unwrap();

    let sock = stack.socket_udp().unwrap();
    sock.sendmsg(
        b"hello",
        Some(Endpoint::new(Ipv4Address::new(192, 168, 0, 2), 4000)),
        MsgFlags::empty(),
    )
    .unwrap();

    {
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let frame = EthernetFrame::new_unchecked(&sent[0][..]);
        assert_eq!(frame.dst_addr(), peer_mac);
        assert_eq!(frame.ethertype(), EthernetProtocol::Ipv4);
    }

    mgmt::core_ioctl(
        &stack,
        CoreRequest::HostRouteDelete {
            ip: Ipv4Address::new(192, 168, 0, 2),
        },
    )
    .unwrap();
    assert_eq!(
        sock.sendmsg(
            b"hello",
            Some(Endpoint::new(Ipv4Address::new(192, 168, 0, 2), 4000)),
            MsgFlags::empty(),
        )
        .unwrap_err(),
        Error::HostUnreachable
    );

    drop(sock);
    stack.ifdown("rteth0").unwrap();
    stack.unregister_device(&dev).unwrap();
    stack.shutdown();
}

#[test]
fn icmp_echo_request_gets_replied() {
    let stack = Stack::new(ModuleConfig::default());
    let sent = Arc::new(Mutex::new(Vec::new()));
    let dev = Device::new_ethernet(
        "rteth0",
        EthernetAddress([0x02, 0, 0, 0, 0, 0x01]),
        1500,
        DeviceFlags::empty(),
        Box::new(SinkDriver { sent: sent.clone() }),
    );
    stack.register_device(&dev).unwrap();
    stack
        .ifup(
            "rteth0",
            Ipv4Address::new(192, 168, 0, 1),
            Ipv4Address::new(255, 255, 255, 0),
        )
        .unwrap();

    let requester_ip = Ipv4Address::new(192, 168, 0, 9);
    let requester_mac = EthernetAddress([0x02, 0, 0, 0, 0, 0x09]);
    stack.routes.add_host(requester_ip, requester_mac, &dev).unwrap();

    // Hand-built echo request towards our address.
    let echo = crate::wire::Icmpv4Repr::EchoRequest {
        ident: 7,
        seq_no: 1,
        data: b"abcd",
    };
    let eth_hlen = EthernetFrame::<&[u8]>::header_len();
    let mut bytes = vec![0u8; eth_hlen + IPV4_HEADER_LEN + echo.buffer_len()];
    EthernetRepr {
        src_addr: requester_mac,
        dst_addr: dev.hw_addr,
        ethertype: EthernetProtocol::Ipv4,
    }
    .emit(&mut EthernetFrame::new_unchecked(&mut bytes[..]));
    {
        let mut packet = Ipv4Packet::new_unchecked(&mut bytes[eth_hlen..]);
        crate::wire::Ipv4Repr {
            src_addr: requester_ip,
            dst_addr: Ipv4Address::new(192, 168, 0, 1),
            next_header: IpProtocol::Icmp,
            payload_len: echo.buffer_len(),
            hop_limit: 64,
        }
        .emit(&mut packet);
        echo.emit(&mut crate::wire::Icmpv4Packet::new_unchecked(
            packet.payload_mut(),
        ));
    }
    inject(&stack, &dev, &bytes);

    std::thread::sleep(StdDuration::from_millis(200));

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let frame = EthernetFrame::new_unchecked(&sent[0][..]);
    assert_eq!(frame.dst_addr(), requester_mac);
    let reply_ip = Ipv4Packet::new_unchecked(frame.payload());
    assert_eq!(reply_ip.dst_addr(), requester_ip);
    assert_eq!(reply_ip.next_header(), IpProtocol::Icmp);
    let reply = crate::wire::Icmpv4Packet::new_unchecked(reply_ip.payload());
    assert_eq!(
        reply.msg_type(),
        crate::wire::Icmpv4Message::EchoReply
    );
    assert_eq!(reply.echo_ident(), 7);
    assert_eq!(reply.data(), b"abcd");
    drop(sent);

    // The static reply pool is back at quota.
    assert!(stack.icmp.reply_socket().core.pool.is_full());

    stack.ifdown("rteth0").unwrap();
    stack.unregister_device(&dev).unwrap();
    stack.shutdown();
}

#[test]
fn tdma_master_with_one_slave() {
    let stack = Stack::new(ModuleConfig::default());
    let (master_dev, slave_dev) = wired_pair(&stack);
    stack
        .ifup(
            "rteth0",
            Ipv4Address::new(10, 0, 0, 1),
            Ipv4Address::new(255, 255, 255, 0),
        )
        .unwrap();
    stack
        .ifup(
            "rteth1",
            Ipv4Address::new(10, 0, 0, 2),
            Ipv4Address::new(255, 255, 255, 0),
        )
        .unwrap();

    let cycle_ns: u64 = 20_000_000;
    let master = Tdma::attach(&master_dev).unwrap();
    master.set_master(cycle_ns, 0, 7, 4).unwrap();
    master.set_slot(1, 2_000_000, 1, 0, 1500).unwrap();

    let slave = Tdma::attach(&slave_dev).unwrap();
    slave.set_slave(7).unwrap();
    slave.set_slot(0, 10_000_000, 1, 0, 1500).unwrap();

    // The slave locks on within a couple of cycles.
    slave
        .wait_on_sync(Some(crate::time::Duration::from_millis(500)))
        .unwrap();
    assert!(slave.flags().contains(TdmaFlags::CALIBRATED));

    // Address the master station through the slave's port.
    mgmt::core_ioctl(
        &stack,
        CoreRequest::HostRouteAdd {
            ip: Ipv4Address::new(10, 0, 0, 1),
            hw_addr: master_dev.hw_addr,
            ifname: "rteth1".into(),
        },
    )
    .unwrap();

    let b = stack.socket_udp().unwrap();
    b.bind(Ipv4Address::new(10, 0, 0, 1), 35001).unwrap();
    b.set_timeout(RECV_TIMEOUT_NS);

    let a = stack.socket_udp().unwrap();
    a.bind(Ipv4Address::new(10, 0, 0, 2), 35000).unwrap();

    let sent_at = crate::time::Instant::now();
    a.sendmsg(
        b"SLOT",
        Some(Endpoint::new(Ipv4Address::new(10, 0, 0, 1), 35001)),
        MsgFlags::empty(),
    )
    .unwrap();

    let mut buf = [0u8; 16];
    let recv = b.recvmsg(&mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(recv.len, 4);
    assert_eq!(&buf[..4], b"SLOT");

    // The datagram left in a scheduled slot, not immediately: delivery
    // happens at a cycle boundary plus the slot offset.
    let elapsed = crate::time::Instant::now() - sent_at;
    assert!(elapsed as u64 <= 5 * cycle_ns, "elapsed {elapsed}ns");

    drop(a);
    drop(b);
    master.detach(&master_dev).unwrap();
    slave.detach(&slave_dev).unwrap();
    stack.ifdown("rteth0").unwrap();
    stack.ifdown("rteth1").unwrap();
    stack.unregister_device(&master_dev).unwrap();
    stack.unregister_device(&slave_dev).unwrap();
    stack.shutdown();
}

#[test]
fn packet_socket_raw_roundtrip() {
    let stack = Stack::new(ModuleConfig::default());
    let dev = loopback("rtlo", 1500);
    stack.register_device(&dev).unwrap();
    stack
        .ifup(
            "rtlo",
            Ipv4Address::new(127, 0, 0, 1),
            Ipv4Address::new(255, 0, 0, 0),
        )
        .unwrap();

    let proto = EthernetProtocol::Unknown(0x88b5);
    let sock = stack.socket_packet(None).unwrap();
    sock.bind_link(proto, dev.ifindex()).unwrap();
    sock.set_timeout(RECV_TIMEOUT_NS);

    let (ifindex, hw_addr, bound_proto) = sock.link_name().unwrap();
    assert_eq!(ifindex, dev.ifindex());
    assert_eq!(hw_addr, dev.hw_addr);
    assert_eq!(bound_proto, proto);

    sock.send_link(
        b"raw payload",
        crate::socket::LinkEndpoint {
            addr: dev.hw_addr,
            protocol: proto,
        },
    )
    .unwrap();

    let mut buf = [0u8; 64];
    let recv = sock.recv_link(&mut buf, MsgFlags::empty()).unwrap();
    // Raw sockets see the whole frame, link-layer header included.
    let eth_hlen = EthernetFrame::<&[u8]>::header_len();
    assert_eq!(recv.len, eth_hlen + 11);
    assert_eq!(&buf[eth_hlen..recv.len], b"raw payload");
    assert_eq!(recv.from.protocol, proto);
    assert_eq!(recv.ifindex, dev.ifindex());

    drop(sock);
    stack.ifdown("rtlo").unwrap();
    stack.unregister_device(&dev).unwrap();
    stack.shutdown();
}

#[test]
fn udp_peek_leaves_datagram_queued() {
    let stack = Stack::new(ModuleConfig::default());
    let dev = loopback("rtlo", 1500);
    stack.register_device(&dev).unwrap();
    stack
        .ifup(
            "rtlo",
            Ipv4Address::new(127, 0, 0, 1),
            Ipv4Address::new(255, 0, 0, 0),
        )
        .unwrap();

    let a = stack.socket_udp().unwrap();
    let b = stack.socket_udp().unwrap();
    b.bind(Ipv4Address::new(127, 0, 0, 1), 35001).unwrap();
    b.set_timeout(RECV_TIMEOUT_NS);

    a.sendmsg(
        b"DATA",
        Some(Endpoint::new(Ipv4Address::new(127, 0, 0, 1), 35001)),
        MsgFlags::empty(),
    )
    .unwrap();

    let mut buf = [0u8; 16];
    let peeked = b.recvmsg(&mut buf, MsgFlags::PEEK).unwrap();
    assert_eq!((peeked.len, &buf[..4]), (4, &b"DATA"[..]));

    // The datagram is still there for the real read.
    let recv = b.recvmsg(&mut buf, MsgFlags::empty()).unwrap();
    assert_eq!((recv.len, &buf[..4]), (4, &b"DATA"[..]));

    assert_eq!(
        b.recvmsg(&mut buf, MsgFlags::DONTWAIT).unwrap_err(),
        Error::WouldBlock
    );

    drop(a);
    drop(b);
    stack.ifdown("rtlo").unwrap();
    stack.unregister_device(&dev).unwrap();
    stack.shutdown();
}

#[test]
fn udp_socket_slot_exhaustion() {
    let config = ModuleConfig {
        udp_sockets: 8,
        auto_port_mask: !7,
        ..ModuleConfig::default()
    };
    let stack = Stack::new(config);

    let mut sockets = Vec::new();
    for _ in 0..8 {
        sockets.push(stack.socket_udp().unwrap());
    }
    assert_eq!(stack.socket_udp().unwrap_err(), Error::Again);

    let freed = sockets.remove(3);
    let freed_port = freed.local_endpoint().unwrap().port;
    freed.close();

    let next = stack.socket_udp().unwrap();
    assert_eq!(next.local_endpoint().unwrap().port, freed_port);

    drop(next);
    drop(sockets);
    stack.shutdown();
}
