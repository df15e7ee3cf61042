/*! The stack instance and its manager task.

A [`Stack`] owns every process-wide table: devices, routes, the UDP port
registry, the defragmentation collectors, the protocol and packet-type
registries, the global pool and the ICMP reply state. All of it is built
at creation and torn down at shutdown; nothing initialises lazily.

The manager is a single real-time task. Drivers enqueue received buffers
onto their device and signal its event; the task drains the per-device
FIFOs and dispatches each frame: packet-type registry first (raw
sockets, configuration frames), then the built-in ARP, IPv4 and
discipline paths. It never blocks on non-real-time primitives and never
allocates.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crate::config::{ModuleConfig, DEFAULT_GLOBAL_RTSKBS, MAX_PACKET_TYPES};
use crate::device::{DeviceRef, DeviceTable};
use crate::ipv4::icmp::Icmp;
use crate::ipv4::{arp, ip_rcv, Collectors, ProtocolKind, ProtocolRegistry, Routes};
use crate::rtskb::{PacketType, Pool, Rtskb};
use crate::socket::udp::PortRegistry;
use crate::socket::{packet, udp, Socket};
use crate::sys::{spawn_task, RtEvent, RtLock, WaitOutcome};
use crate::time::Duration;
use crate::wire::{EthernetFrame, EthernetProtocol, Ipv4Address};
use crate::{Error, Result};

/// Handler invoked for frames of a registered link-layer protocol.
pub trait PacketTypeHandler: Send + Sync {
    /// Consume one frame; the payload window starts at the link-layer
    /// header.
    fn rcv(&self, skb: Box<Rtskb>, stack: &Arc<Stack>);
}

struct PacketTypeEntry {
    protocol: EthernetProtocol,
    handler: Arc<dyn PacketTypeHandler>,
}

/// Bounded registry of link-layer protocol handlers.
pub struct PacketTypeRegistry {
    slots: RtLock<[Option<PacketTypeEntry>; MAX_PACKET_TYPES]>,
}

impl PacketTypeRegistry {
    fn new() -> PacketTypeRegistry {
        PacketTypeRegistry {
            slots: RtLock::new(core::array::from_fn(|_| None)),
        }
    }

    /// Register a handler; returns its id for removal.
    pub fn add_pack(
        &self,
        protocol: EthernetProtocol,
        handler: Arc<dyn PacketTypeHandler>,
    ) -> Result<usize> {
        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(Error::Again)?;
        slots[index] = Some(PacketTypeEntry { protocol, handler });
        Ok(index)
    }

    pub fn remove_pack(&self, id: usize) -> Result<()> {
        let mut slots = self.slots.lock();
        if id >= MAX_PACKET_TYPES || slots[id].is_none() {
            return Err(Error::NotFound);
        }
        slots[id] = None;
        Ok(())
    }

    /// Hand the frame to the first matching handler. Returns the frame
    /// back when nobody claimed it.
    fn deliver(&self, stack: &Arc<Stack>, skb: Box<Rtskb>) -> Option<Box<Rtskb>> {
        let handler = {
            let slots = self.slots.lock();
            slots
                .iter()
                .flatten()
                .find(|entry| entry.protocol == skb.protocol)
                .map(|entry| entry.handler.clone())
        };
        match handler {
            Some(handler) => {
                handler.rcv(skb, stack);
                None
            }
            None => Some(skb),
        }
    }

    /// Registered protocols, for the snapshot views.
    pub fn protocols(&self) -> Vec<EthernetProtocol> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .map(|entry| entry.protocol)
            .collect()
    }
}

/// One instance of the real-time network stack.
pub struct Stack {
    /// Back-reference for handing out owned handles (sockets keep their
    /// stack alive).
    self_ref: RtLock<Weak<Stack>>,

    pub config: ModuleConfig,
    pub devices: DeviceTable,
    pub routes: Routes,
    pub ports: PortRegistry,
    pub collectors: Collectors,
    pub protocols: ProtocolRegistry,
    pub packet_types: PacketTypeRegistry,
    pub global_pool: Pool,
    pub icmp: Icmp,
    forwarding: AtomicBool,
    manager_event: Arc<RtEvent>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl Stack {
    /// Build the stack and start its manager task.
    pub fn new(config: ModuleConfig) -> Arc<Stack> {
        let config = config.sanitized();
        let stack = Arc::new(Stack {
            self_ref: RtLock::new(Weak::new()),
            routes: Routes::new(config.net_hash_key_shift),
            ports: PortRegistry::new(&config),
            collectors: Collectors::new(),
            protocols: ProtocolRegistry::new(),
            packet_types: PacketTypeRegistry::new(),
            devices: DeviceTable::new(),
            global_pool: Pool::new(DEFAULT_GLOBAL_RTSKBS),
            icmp: Icmp::new(),
            forwarding: AtomicBool::new(false),
            manager_event: Arc::new(RtEvent::new()),
            manager: Mutex::new(None),
            config,
        });
        *stack.self_ref.lock() = Arc::downgrade(&stack);

        stack
            .protocols
            .add(ProtocolKind::Udp)
            .expect("fresh registry");
        stack
            .protocols
            .add(ProtocolKind::Icmp)
            .expect("fresh registry");

        let weak = Arc::downgrade(&stack);
        let event = stack.manager_event.clone();
        *stack.manager.lock().unwrap() = Some(spawn_task("rtnet-stack-mgr", move || {
            manager_loop(weak, event)
        }));

        stack
    }

    /// Stop the manager task. Devices and sockets must be gone first.
    pub fn shutdown(&self) {
        self.manager_event.close();
        if let Some(handle) = self.manager.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.icmp.shutdown();
    }

    pub fn forwarding(&self) -> bool {
        self.forwarding.load(Ordering::Relaxed)
    }

    /// Turn IP forwarding between devices on or off.
    pub fn set_forwarding(&self, on: bool) {
        self.forwarding.store(on, Ordering::Relaxed);
    }

    /// Shared handle to this stack instance.
    fn handle(&self) -> Arc<Stack> {
        self.self_ref
            .lock()
            .upgrade()
            .expect("stack still referenced")
    }

    /// Install a device into the table; it contributes its share of
    /// buffers to the global pool.
    pub fn register_device(&self, dev: &DeviceRef) -> Result<usize> {
        let index = self.devices.register(dev, &self.manager_event)?;
        let added = self.global_pool.extend(self.config.device_rtskbs);
        dev.set_add_quota(added);
        Ok(index)
    }

    /// Take a device down, flush its routes, wait out its references and
    /// withdraw its global-pool contribution.
    pub fn unregister_device(&self, dev: &DeviceRef) -> Result<()> {
        if dev.is_up() {
            self.ifdown(&dev.name())?;
        }
        self.devices.unregister(dev)?;
        self.global_pool.shrink(dev.add_quota());
        Ok(())
    }

    /// Bring an interface up with the given addresses and publish its
    /// local host route.
    pub fn ifup(&self, name: &str, local_ip: Ipv4Address, netmask: Ipv4Address) -> Result<()> {
        let dev = self.devices.get_by_name(name).ok_or(Error::NotFound)?;
        let broadcast = Ipv4Address::from(u32::from(local_ip) | !u32::from(netmask));
        dev.set_addresses(local_ip, broadcast);
        dev.open()?;
        self.routes.add_host(local_ip, dev.hw_addr, &dev)?;
        Ok(())
    }

    /// Take an interface down and sweep its routes.
    pub fn ifdown(&self, name: &str) -> Result<()> {
        let dev = self.devices.get_by_name(name).ok_or(Error::NotFound)?;
        dev.close()?;
        self.routes.del_all_host(&dev);
        dev.rx_queue.purge();
        Ok(())
    }

    /// Create an UDP socket with an automatically assigned port.
    pub fn socket_udp(&self) -> Result<Socket> {
        let stack = self.handle();
        let inner = udp::socket(&stack)?;
        Ok(Socket::from_parts(stack, inner))
    }

    /// Create a packet socket, optionally bound to a protocol already.
    pub fn socket_packet(&self, protocol: Option<EthernetProtocol>) -> Result<Socket> {
        let stack = self.handle();
        let inner = packet::socket(&stack, protocol)?;
        Ok(Socket::from_parts(stack, inner))
    }

    /// Broadcast an address solicitation on the device that routes to
    /// `target`'s network.
    pub fn route_solicit(&self, ifname: &str, target: Ipv4Address) -> Result<()> {
        let dev = self.devices.get_by_name(ifname).ok_or(Error::NotFound)?;
        arp::solicit(&self.handle(), &dev, target)
    }
}

fn manager_loop(stack: Weak<Stack>, event: Arc<RtEvent>) {
    loop {
        match event.wait(Some(Duration::from_millis(100))) {
            WaitOutcome::Closed => return,
            WaitOutcome::Signaled | WaitOutcome::TimedOut => {}
        }
        let Some(stack) = stack.upgrade() else {
            return;
        };
        // Walk the bounded table by index; the drain itself must not
        // allocate.
        for index in 1..=crate::config::MAX_RT_DEVICES {
            let Some(dev) = stack.devices.get_by_index(index) else {
                continue;
            };
            while let Some(skb) = dev.rx_queue.dequeue() {
                process_frame(&stack, skb);
            }
        }
    }
}

/// Classify and dispatch one received frame.
fn process_frame(stack: &Arc<Stack>, mut skb: Box<Rtskb>) {
    let Some(dev) = skb.rtdev.clone() else {
        skb.free();
        return;
    };

    let eth_hlen = EthernetFrame::<&[u8]>::header_len();
    let Ok(frame) = EthernetFrame::new_checked(skb.payload()) else {
        dev.stats.rx_errors.fetch_add(1, Ordering::Relaxed);
        skb.free();
        return;
    };

    let dst = frame.dst_addr();
    skb.protocol = frame.ethertype();
    skb.pkt_type = if dst.is_broadcast() {
        PacketType::Broadcast
    } else if dst.is_multicast() {
        PacketType::Multicast
    } else if dst == dev.hw_addr {
        PacketType::Host
    } else {
        PacketType::OtherHost
    };

    if skb.pkt_type == PacketType::OtherHost
        && !dev.flags().contains(crate::device::DeviceFlags::PROMISC)
    {
        skb.free();
        return;
    }

    // Raw packet sockets and registered services see the frame first,
    // with the payload window still at the link-layer header.
    let Some(mut skb) = stack.packet_types.deliver(stack, skb) else {
        return;
    };

    match skb.protocol {
        EthernetProtocol::Ipv4 => {
            skb.pull(eth_hlen);
            ip_rcv(stack, skb);
        }
        EthernetProtocol::Arp => {
            skb.pull(eth_hlen);
            arp::rcv(stack, skb);
        }
        EthernetProtocol::Rtmac => match dev.mac_discipline() {
            Some(disc) => {
                skb.pull(eth_hlen);
                disc.packet_rx(skb, &dev);
            }
            None => skb.free(),
        },
        _ => {
            net_trace!("stack: unhandled frame type {}", skb.protocol);
            skb.free();
        }
    }
}

#[cfg(test)]
mod scenarios;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceFlags, Loopback};
    use crate::wire::EthernetAddress;

    fn loopback_dev() -> DeviceRef {
        Device::new_ethernet(
            "rtlo",
            EthernetAddress([0x02, 0, 0, 0, 0, 0x10]),
            1500,
            DeviceFlags::LOOPBACK,
            Box::new(Loopback::new()),
        )
    }

    #[test]
    fn register_contributes_to_global_pool() {
        let stack = Stack::new(ModuleConfig::default());
        let dev = loopback_dev();
        let before = stack.global_pool.capacity();
        stack.register_device(&dev).unwrap();
        assert_eq!(
            stack.global_pool.capacity(),
            before + stack.config.device_rtskbs
        );

        stack.unregister_device(&dev).unwrap();
        assert_eq!(stack.global_pool.capacity(), before);
        stack.shutdown();
    }

    #[test]
    fn ifup_publishes_local_route() {
        let stack = Stack::new(ModuleConfig::default());
        let dev = loopback_dev();
        stack.register_device(&dev).unwrap();
        stack
            .ifup(
                "rtlo",
                Ipv4Address::new(127, 0, 0, 1),
                Ipv4Address::new(255, 0, 0, 0),
            )
            .unwrap();

        let route = stack.routes.output(Ipv4Address::new(127, 0, 0, 1)).unwrap();
        assert_eq!(route.dev_addr, dev.hw_addr);
        assert!(dev.is_up());

        stack.ifdown("rtlo").unwrap();
        assert!(stack
            .routes
            .output(Ipv4Address::new(127, 0, 0, 1))
            .is_err());
        stack.unregister_device(&dev).unwrap();
        stack.shutdown();
    }

    #[test]
    fn packet_type_registry_bounds() {
        struct Sink;
        impl PacketTypeHandler for Sink {
            fn rcv(&self, skb: Box<Rtskb>, _stack: &Arc<Stack>) {
                skb.free();
            }
        }

        let registry = PacketTypeRegistry::new();
        let mut ids = Vec::new();
        for _ in 0..MAX_PACKET_TYPES {
            ids.push(
                registry
                    .add_pack(EthernetProtocol::Rtcfg, Arc::new(Sink))
                    .unwrap(),
            );
        }
        assert_eq!(
            registry
                .add_pack(EthernetProtocol::Rtcfg, Arc::new(Sink))
                .unwrap_err(),
            Error::Again
        );
        registry.remove_pack(ids[0]).unwrap();
        assert_eq!(registry.remove_pack(ids[0]).unwrap_err(), Error::NotFound);
        assert!(registry
            .add_pack(EthernetProtocol::Rtcfg, Arc::new(Sink))
            .is_ok());
    }
}
