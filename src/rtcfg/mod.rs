/*! Configuration-distribution plumbing, at interface level.

The full protocol is a state machine running above the sockets; this
module carries its stack-facing surface: the stage-1 frame handler
registered through the packet-type registry, the per-connection state
records a server drives, and the frame transmit path for stage-1
announcements. Stage-2 payload distribution is not part of this crate.
*/

use std::sync::{Arc, Mutex, Weak};

use crate::device::{Device, DeviceRef};
use crate::rtskb::Rtskb;
use crate::stack::{PacketTypeHandler, Stack};
use crate::time::Instant;
use crate::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, Ipv4Address, RtcfgFrameId,
    RtcfgPacket, RtcfgStage1Addrs, RtcfgStage1Repr,
};
use crate::{Error, Result};

/// Stations one server instance can manage.
pub const MAX_STATIONS: usize = 32;

/// Life cycle of one managed station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the station to appear.
    Searching,
    /// Stage-1 configuration handed out.
    Stage1,
    /// Stage-2 distribution would run here.
    Stage2,
    /// Station reported ready.
    Ready,
    /// Station timed out.
    Dead,
}

/// How a station is addressed before it has an IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    Ip(Ipv4Address),
    Mac(EthernetAddress),
}

/// Per-station connection record.
#[derive(Debug, Clone)]
pub struct Connection {
    pub addr: PeerAddr,
    pub state: ConnState,
    pub burstrate: u8,
    pub cfg_data: Vec<u8>,
    pub last_event: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    stage1_rx: u64,
    unknown_rx: u64,
}

/// One configuration-service instance, attached to one device.
pub struct Rtcfg {
    dev: Mutex<Weak<Device>>,
    connections: Mutex<Vec<Connection>>,
    counters: Mutex<Counters>,
    pack_id: Mutex<Option<usize>>,
}

impl Rtcfg {
    /// Attach the service to `dev`: its frame handler starts receiving
    /// configuration frames.
    pub fn attach(stack: &Arc<Stack>, dev: &DeviceRef) -> Result<Arc<Rtcfg>> {
        let rtcfg = Arc::new(Rtcfg {
            dev: Mutex::new(Arc::downgrade(dev)),
            connections: Mutex::new(Vec::with_capacity(MAX_STATIONS)),
            counters: Mutex::new(Counters::default()),
            pack_id: Mutex::new(None),
        });
        let handler = Arc::new(FrameHandler {
            rtcfg: Arc::downgrade(&rtcfg),
        });
        let id = stack
            .packet_types
            .add_pack(EthernetProtocol::Rtcfg, handler)?;
        *rtcfg.pack_id.lock().unwrap() = Some(id);
        Ok(rtcfg)
    }

    pub fn detach(&self, stack: &Arc<Stack>) -> Result<()> {
        if let Some(id) = self.pack_id.lock().unwrap().take() {
            stack.packet_types.remove_pack(id)?;
        }
        self.connections.lock().unwrap().clear();
        Ok(())
    }

    /// Register a station to be configured, addressed by IP.
    pub fn add_peer_ip(&self, addr: Ipv4Address, burstrate: u8, cfg_data: &[u8]) -> Result<()> {
        self.add_peer(PeerAddr::Ip(addr), burstrate, cfg_data)
    }

    /// Register a station addressed by hardware address.
    pub fn add_peer_mac(
        &self,
        addr: EthernetAddress,
        burstrate: u8,
        cfg_data: &[u8],
    ) -> Result<()> {
        self.add_peer(PeerAddr::Mac(addr), burstrate, cfg_data)
    }

    fn add_peer(&self, addr: PeerAddr, burstrate: u8, cfg_data: &[u8]) -> Result<()> {
        let mut connections = self.connections.lock().unwrap();
        if connections.len() >= MAX_STATIONS {
            return Err(Error::Again);
        }
        if connections.iter().any(|c| c.addr == addr) {
            return Err(Error::AlreadyExists);
        }
        connections.push(Connection {
            addr,
            state: ConnState::Searching,
            burstrate,
            cfg_data: cfg_data.to_vec(),
            last_event: Instant::now(),
        });
        Ok(())
    }

    /// Broadcast the stage-1 announcement for every station still in
    /// `Searching`, advancing it to `Stage1`.
    pub fn announce(&self, stack: &Arc<Stack>, server_ip: Ipv4Address) -> Result<()> {
        let dev = self.dev.lock().unwrap().upgrade().ok_or(Error::NetDown)?;
        let mut connections = self.connections.lock().unwrap();
        for conn in connections.iter_mut() {
            if conn.state != ConnState::Searching {
                continue;
            }
            let addrs = match conn.addr {
                PeerAddr::Ip(client) => Some(RtcfgStage1Addrs {
                    client,
                    server: server_ip,
                }),
                PeerAddr::Mac(_) => None,
            };
            let repr = RtcfgStage1Repr {
                addrs,
                burstrate: conn.burstrate,
                cfg_data: &conn.cfg_data,
            };
            send_frame(stack, &dev, EthernetAddress::BROADCAST, &repr)?;
            conn.state = ConnState::Stage1;
            conn.last_event = Instant::now();
        }
        Ok(())
    }

    /// Mark a station ready (normally driven by its ready frame).
    pub fn station_ready(&self, addr: PeerAddr) -> Result<()> {
        let mut connections = self.connections.lock().unwrap();
        let conn = connections
            .iter_mut()
            .find(|c| c.addr == addr)
            .ok_or(Error::NotFound)?;
        conn.state = ConnState::Ready;
        conn.last_event = Instant::now();
        Ok(())
    }

    /// Snapshot of the station list.
    pub fn stations(&self) -> Vec<Connection> {
        self.connections.lock().unwrap().clone()
    }

    /// `(stage-1 frames seen, unknown frames seen)`.
    pub fn frame_counts(&self) -> (u64, u64) {
        let counters = self.counters.lock().unwrap();
        (counters.stage1_rx, counters.unknown_rx)
    }

    fn handle_frame(&self, skb: &Rtskb) {
        let Ok(packet) = RtcfgPacket::new_checked(skb.payload()) else {
            return;
        };
        match packet.frame_id() {
            RtcfgFrameId::Stage1Cfg => {
                let Ok(repr) = RtcfgStage1Repr::parse(&packet) else {
                    self.counters.lock().unwrap().unknown_rx += 1;
                    return;
                };
                self.counters.lock().unwrap().stage1_rx += 1;

                // A client hearing its own address learns the server.
                if let Some(addrs) = repr.addrs {
                    let mut connections = self.connections.lock().unwrap();
                    if let Some(conn) = connections
                        .iter_mut()
                        .find(|c| c.addr == PeerAddr::Ip(addrs.client))
                    {
                        conn.state = ConnState::Stage1;
                        conn.burstrate = conn.burstrate.min(repr.burstrate);
                        conn.last_event = Instant::now();
                    }
                }
            }
            _ => {
                self.counters.lock().unwrap().unknown_rx += 1;
            }
        }
    }
}

struct FrameHandler {
    rtcfg: Weak<Rtcfg>,
}

impl PacketTypeHandler for FrameHandler {
    fn rcv(&self, mut skb: Box<Rtskb>, _stack: &Arc<Stack>) {
        if let Some(rtcfg) = self.rtcfg.upgrade() {
            skb.pull(EthernetFrame::<&[u8]>::header_len());
            rtcfg.handle_frame(&skb);
        }
        skb.free();
    }
}

fn send_frame(
    stack: &Arc<Stack>,
    dev: &DeviceRef,
    dst_addr: EthernetAddress,
    repr: &RtcfgStage1Repr<'_>,
) -> Result<()> {
    let eth_hlen = EthernetFrame::<&[u8]>::header_len();
    let mut skb = stack.global_pool.alloc(eth_hlen + repr.buffer_len())?;
    {
        let region = skb.put(eth_hlen + repr.buffer_len());
        let mut frame = EthernetFrame::new_unchecked(&mut *region);
        EthernetRepr {
            src_addr: dev.hw_addr,
            dst_addr,
            ethertype: EthernetProtocol::Rtcfg,
        }
        .emit(&mut frame);
        repr.emit(&mut RtcfgPacket::new_unchecked(frame.payload_mut()));
    }
    skb.rtdev = Some(dev.clone());
    dev.xmit(skb)
}
