/*! The management request surface.

The character-device and CLI layers are external; their commands arrive
here as typed requests keyed by service class, with the same semantics
the ioctl numbers carry: interface up/down and addressing, host and
network route editing, address solicitation, TDMA role and slot
configuration, and configuration-service control. All requests run in
non-real-time context.
*/

use std::sync::Arc;

use crate::ipv4::arp;
use crate::rtcfg::Rtcfg;
use crate::rtmac::tdma::Tdma;
use crate::rtmac::MacDiscipline;
use crate::stack::Stack;
use crate::wire::{EthernetAddress, Ipv4Address};
use crate::{Error, Result};

/// Core stack requests.
#[derive(Debug, Clone)]
pub enum CoreRequest {
    IfUp {
        ifname: String,
        local_ip: Ipv4Address,
        netmask: Ipv4Address,
    },
    IfDown {
        ifname: String,
    },
    HostRouteAdd {
        ip: Ipv4Address,
        hw_addr: EthernetAddress,
        ifname: String,
    },
    HostRouteDelete {
        ip: Ipv4Address,
    },
    HostRouteSolicit {
        ifname: String,
        ip: Ipv4Address,
    },
    NetRouteAdd {
        net: Ipv4Address,
        mask: Ipv4Address,
        gateway: Ipv4Address,
    },
    NetRouteDelete {
        net: Ipv4Address,
        mask: Ipv4Address,
    },
}

/// TDMA discipline requests.
#[derive(Debug, Clone)]
pub enum TdmaRequest {
    Attach {
        ifname: String,
    },
    Detach {
        ifname: String,
    },
    Master {
        ifname: String,
        cycle_period_ns: u64,
        backup_sync_offset_ns: u64,
        max_slot_id: usize,
        max_cal_requests: usize,
    },
    Slave {
        ifname: String,
        max_slot_id: usize,
    },
    SetSlot {
        ifname: String,
        id: usize,
        offset_ns: u64,
        period: u64,
        phasing: u64,
        mtu: usize,
    },
    RemoveSlot {
        ifname: String,
        id: usize,
    },
}

/// Configuration-service requests.
#[derive(Debug, Clone)]
pub enum RtcfgRequest {
    AddPeerIp {
        ip: Ipv4Address,
        burstrate: u8,
        cfg_data: Vec<u8>,
    },
    AddPeerMac {
        hw_addr: EthernetAddress,
        burstrate: u8,
        cfg_data: Vec<u8>,
    },
    Announce {
        server_ip: Ipv4Address,
    },
}

/// Execute a core request against `stack`.
pub fn core_ioctl(stack: &Arc<Stack>, request: CoreRequest) -> Result<()> {
    match request {
        CoreRequest::IfUp {
            ifname,
            local_ip,
            netmask,
        } => stack.ifup(&ifname, local_ip, netmask),
        CoreRequest::IfDown { ifname } => stack.ifdown(&ifname),
        CoreRequest::HostRouteAdd {
            ip,
            hw_addr,
            ifname,
        } => {
            let dev = stack.devices.get_by_name(&ifname).ok_or(Error::NotFound)?;
            if !dev.is_up() {
                return Err(Error::NetDown);
            }
            stack.routes.add_host(ip, hw_addr, &dev)
        }
        CoreRequest::HostRouteDelete { ip } => stack.routes.del_host(ip),
        CoreRequest::HostRouteSolicit { ifname, ip } => {
            let dev = stack.devices.get_by_name(&ifname).ok_or(Error::NotFound)?;
            arp::solicit(stack, &dev, ip)
        }
        CoreRequest::NetRouteAdd { net, mask, gateway } => {
            stack.routes.add_net(net, mask, gateway)
        }
        CoreRequest::NetRouteDelete { net, mask } => stack.routes.del_net(net, mask),
    }
}

/// The TDMA instance attached to a named device, if any.
fn tdma_of(stack: &Arc<Stack>, ifname: &str) -> Result<(crate::device::DeviceRef, Arc<Tdma>)> {
    let dev = stack.devices.get_by_name(ifname).ok_or(Error::NotFound)?;
    let disc = dev.mac_discipline().ok_or(Error::NotFound)?;
    let tdma = disc
        .as_any()
        .downcast::<Tdma>()
        .map_err(|_| Error::Unsupported)?;
    Ok((dev, tdma))
}

/// Execute a TDMA request against `stack`.
pub fn tdma_ioctl(stack: &Arc<Stack>, request: TdmaRequest) -> Result<()> {
    match request {
        TdmaRequest::Attach { ifname } => {
            let dev = stack.devices.get_by_name(&ifname).ok_or(Error::NotFound)?;
            Tdma::attach(&dev)?;
            Ok(())
        }
        TdmaRequest::Detach { ifname } => {
            let (dev, tdma) = tdma_of(stack, &ifname)?;
            tdma.detach(&dev)
        }
        TdmaRequest::Master {
            ifname,
            cycle_period_ns,
            backup_sync_offset_ns,
            max_slot_id,
            max_cal_requests,
        } => {
            let (_, tdma) = tdma_of(stack, &ifname)?;
            tdma.set_master(
                cycle_period_ns,
                backup_sync_offset_ns,
                max_slot_id,
                max_cal_requests,
            )
        }
        TdmaRequest::Slave { ifname, max_slot_id } => {
            let (_, tdma) = tdma_of(stack, &ifname)?;
            tdma.set_slave(max_slot_id)
        }
        TdmaRequest::SetSlot {
            ifname,
            id,
            offset_ns,
            period,
            phasing,
            mtu,
        } => {
            let (_, tdma) = tdma_of(stack, &ifname)?;
            tdma.set_slot(id, offset_ns, period, phasing, mtu)
        }
        TdmaRequest::RemoveSlot { ifname, id } => {
            let (_, tdma) = tdma_of(stack, &ifname)?;
            tdma.remove_slot(id)
        }
    }
}

/// Execute a configuration-service request.
pub fn rtcfg_ioctl(stack: &Arc<Stack>, rtcfg: &Arc<Rtcfg>, request: RtcfgRequest) -> Result<()> {
    match request {
        RtcfgRequest::AddPeerIp {
            ip,
            burstrate,
            cfg_data,
        } => rtcfg.add_peer_ip(ip, burstrate, &cfg_data),
        RtcfgRequest::AddPeerMac {
            hw_addr,
            burstrate,
            cfg_data,
        } => rtcfg.add_peer_mac(hw_addr, burstrate, &cfg_data),
        RtcfgRequest::Announce { server_ip } => rtcfg.announce(stack, server_ip),
    }
}
