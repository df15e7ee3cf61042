/*! Bounded network-device registry.

Devices live in a fixed table indexed by `ifindex` 1..=[`MAX_RT_DEVICES`].
A device is shared through [`DeviceRef`] handles; unregistration succeeds
only once every outside handle is gone, the same quiesce-before-free rule
sockets apply to their pools. Drivers sit behind the per-device transmit
lock, and an attached media-access discipline interposes on every
real-time transmission.
*/

mod loopback;
pub use self::loopback::Loopback;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::config::MAX_RT_DEVICES;
use crate::rtmac::MacDiscipline;
use crate::rtskb::{Rtskb, SkbQueue};
use crate::sys::{RtEvent, RtLock};
use crate::time::Instant;
use crate::wire::{EthernetAddress, Ipv4Address};
use crate::{Error, Result};

bitflags::bitflags! {
    /// Interface state and capability flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        const UP        = 1 << 0;
        const BROADCAST = 1 << 1;
        const LOOPBACK  = 1 << 2;
        const RUNNING   = 1 << 3;
        const NOARP     = 1 << 4;
        const PROMISC   = 1 << 5;
    }
}

/// Shared handle to a registered device.
pub type DeviceRef = Arc<Device>;

/// Driver transmit outcome: on failure the buffer comes back so the
/// device layer can free and account it.
pub type TxResult = core::result::Result<(), (Error, Box<Rtskb>)>;

/// The operations a NIC driver provides.
///
/// `hard_start_xmit` runs under the device transmit lock; a driver never
/// sees two concurrent transmissions.
pub trait Driver: Send {
    fn open(&mut self, dev: &DeviceRef) -> Result<()>;
    fn stop(&mut self, dev: &DeviceRef) -> Result<()>;
    fn hard_start_xmit(&mut self, skb: Box<Rtskb>, dev: &DeviceRef) -> TxResult;
}

/// Netdev-style transmission/reception counters.
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub rx_packets: AtomicU64,
    pub tx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub tx_dropped: AtomicU64,
    pub rx_errors: AtomicU64,
    pub tx_errors: AtomicU64,
}

impl DeviceStats {
    pub fn count_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn count_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

struct IpConfig {
    local_ip: Ipv4Address,
    broadcast_ip: Ipv4Address,
}

/// A registered network device.
pub struct Device {
    /// Back-reference handed to drivers and receive buffers.
    self_ref: Weak<Device>,

    name: RtLock<String>,
    ifindex: RtLock<usize>,

    pub hw_addr: EthernetAddress,
    pub broadcast_addr: EthernetAddress,
    pub mtu: usize,

    flags: RtLock<DeviceFlags>,
    ip: RtLock<IpConfig>,

    /// Serialises every call into the driver's transmit path.
    xmit_lock: Mutex<Box<dyn Driver>>,

    /// Attached media-access discipline, if any.
    mac: RtLock<Option<Arc<dyn MacDiscipline>>>,

    /// Ingress FIFO drained by the stack manager.
    pub rx_queue: SkbQueue,
    /// The stack manager's wake-up, installed at registration.
    stack_event: RtLock<Weak<RtEvent>>,

    pub stats: DeviceStats,

    /// Global-pool buffers this device contributed at registration.
    add_quota: RtLock<usize>,
}

impl Device {
    /// Build an Ethernet-class device around `driver`. The device is not
    /// yet registered and not up.
    pub fn new_ethernet(
        name: &str,
        hw_addr: EthernetAddress,
        mtu: usize,
        flags: DeviceFlags,
        driver: Box<dyn Driver>,
    ) -> DeviceRef {
        Arc::new_cyclic(|self_ref| Device {
            self_ref: self_ref.clone(),
            name: RtLock::new(name.to_owned()),
            ifindex: RtLock::new(0),
            hw_addr,
            broadcast_addr: EthernetAddress::BROADCAST,
            mtu,
            flags: RtLock::new(flags | DeviceFlags::BROADCAST),
            ip: RtLock::new(IpConfig {
                local_ip: Ipv4Address::UNSPECIFIED,
                broadcast_ip: Ipv4Address::BROADCAST,
            }),
            xmit_lock: Mutex::new(driver),
            mac: RtLock::new(None),
            rx_queue: SkbQueue::new(64),
            stack_event: RtLock::new(Weak::new()),
            stats: DeviceStats::default(),
            add_quota: RtLock::new(0),
        })
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn ifindex(&self) -> usize {
        *self.ifindex.lock()
    }

    pub fn flags(&self) -> DeviceFlags {
        *self.flags.lock()
    }

    pub fn is_up(&self) -> bool {
        self.flags().contains(DeviceFlags::UP)
    }

    pub fn local_ip(&self) -> Ipv4Address {
        self.ip.lock().local_ip
    }

    pub fn broadcast_ip(&self) -> Ipv4Address {
        self.ip.lock().broadcast_ip
    }

    pub fn set_addresses(&self, local_ip: Ipv4Address, broadcast_ip: Ipv4Address) {
        let mut ip = self.ip.lock();
        ip.local_ip = local_ip;
        ip.broadcast_ip = broadcast_ip;
    }

    /// Shared handle to this device.
    fn handle(&self) -> DeviceRef {
        self.self_ref.upgrade().expect("device still referenced")
    }

    /// Bring the interface up: driver first, flags after.
    pub fn open(&self) -> Result<()> {
        if self.is_up() {
            return Ok(());
        }
        let dev = self.handle();
        self.xmit_lock.lock().unwrap().open(&dev)?;
        *self.flags.lock() |= DeviceFlags::UP | DeviceFlags::RUNNING;
        Ok(())
    }

    /// Take the interface down.
    pub fn close(&self) -> Result<()> {
        if !self.is_up() {
            return Ok(());
        }
        let dev = self.handle();
        self.xmit_lock.lock().unwrap().stop(&dev)?;
        *self.flags.lock() &= !(DeviceFlags::UP | DeviceFlags::RUNNING);
        Ok(())
    }

    /// Attach a media-access discipline; transmissions now go through it.
    pub fn attach_mac(&self, disc: Arc<dyn MacDiscipline>) -> Result<()> {
        let mut mac = self.mac.lock();
        if mac.is_some() {
            return Err(Error::AlreadyExists);
        }
        *mac = Some(disc);
        Ok(())
    }

    pub fn detach_mac(&self) -> Result<Arc<dyn MacDiscipline>> {
        self.mac.lock().take().ok_or(Error::NotFound)
    }

    pub fn mac_discipline(&self) -> Option<Arc<dyn MacDiscipline>> {
        self.mac.lock().clone()
    }

    /// MTU towards the IP layer: the discipline may advertise a smaller
    /// one than the hardware.
    pub fn effective_mtu(&self) -> usize {
        match self.mac_discipline() {
            Some(disc) => disc.get_mtu(self.mtu).min(self.mtu),
            None => self.mtu,
        }
    }

    /// Transmit through the driver, bypassing any discipline. The
    /// discipline's worker uses this for its scheduled transmissions.
    pub fn hard_xmit(&self, skb: Box<Rtskb>) -> Result<()> {
        if !self.is_up() {
            self.stats.tx_dropped.fetch_add(1, Ordering::Relaxed);
            skb.free();
            return Err(Error::NetDown);
        }
        let bytes = skb.len();
        let dev = self.handle();
        let mut driver = self.xmit_lock.lock().unwrap();
        match driver.hard_start_xmit(skb, &dev) {
            Ok(()) => {
                self.stats.count_tx(bytes);
                Ok(())
            }
            Err((err, skb)) => {
                self.stats.tx_errors.fetch_add(1, Ordering::Relaxed);
                skb.free();
                Err(err)
            }
        }
    }

    /// Transmit a real-time frame: through the attached discipline when
    /// present, else straight to the driver.
    pub fn xmit(&self, skb: Box<Rtskb>) -> Result<()> {
        match self.mac_discipline() {
            Some(disc) => disc.rt_packet_tx(skb, &self.handle()),
            None => self.hard_xmit(skb),
        }
    }

    /// Transmit on behalf of the non-real-time stack; the discipline may
    /// route it into its non-real-time slot.
    pub fn nrt_xmit(&self, skb: Box<Rtskb>) -> Result<()> {
        match self.mac_discipline() {
            Some(disc) => disc.nrt_packet_tx(skb, &self.handle()),
            None => self.hard_xmit(skb),
        }
    }

    /// Driver receive entry: queue the frame and wake the stack manager.
    pub fn netif_rx(&self, mut skb: Box<Rtskb>) {
        skb.rx = Instant::now();
        skb.rtdev = Some(self.handle());
        self.rx_queue.queue_tail(skb);
    }

    /// Signal the stack manager after a batch of [`Self::netif_rx`] calls.
    pub fn rx_mark(&self) {
        if let Some(event) = self.stack_event.lock().upgrade() {
            event.signal();
        }
    }

    /// Remember how many buffers this device contributed to the global
    /// pool, so unregistration can take them back out.
    pub fn set_add_quota(&self, n: usize) {
        *self.add_quota.lock() = n;
    }

    pub fn add_quota(&self) -> usize {
        *self.add_quota.lock()
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("ifindex", &self.ifindex())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Notification hooks run at device registration and unregistration
/// (capture attach, configuration services).
pub trait RegisterHook: Send + Sync {
    fn device_registered(&self, dev: &DeviceRef);
    fn device_unregistered(&self, dev: &DeviceRef);
}

/// The fixed device table.
pub struct DeviceTable {
    slots: RtLock<[Option<DeviceRef>; MAX_RT_DEVICES]>,
    hooks: Mutex<Vec<Arc<dyn RegisterHook>>>,
    /// Serialises register/unregister against each other.
    nrt_lock: Mutex<()>,
}

impl DeviceTable {
    pub fn new() -> DeviceTable {
        DeviceTable {
            slots: RtLock::new(core::array::from_fn(|_| None)),
            hooks: Mutex::new(Vec::new()),
            nrt_lock: Mutex::new(()),
        }
    }

    /// Install `dev` into the first free slot. A `%d` in its name expands
    /// to the slot index. Fails on duplicate names and on a full table.
    pub fn register(&self, dev: &DeviceRef, stack_event: &Arc<RtEvent>) -> Result<usize> {
        let _guard = self.nrt_lock.lock().unwrap();

        let mut slots = self.slots.lock();
        let name = dev.name();
        for other in slots.iter().flatten() {
            if other.name() == name && !name.contains("%d") {
                return Err(Error::AlreadyExists);
            }
        }
        let index = slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(Error::Again)?;

        if name.contains("%d") {
            *dev.name.lock() = name.replace("%d", &index.to_string());
        }
        *dev.ifindex.lock() = index + 1;
        *dev.stack_event.lock() = Arc::downgrade(stack_event);
        slots[index] = Some(dev.clone());
        drop(slots);

        for hook in self.hooks.lock().unwrap().iter() {
            hook.device_registered(dev);
        }

        Ok(index + 1)
    }

    /// Remove `dev` from the table, then wait until every outside handle
    /// is gone. Sleeping wait, non-real-time callers only.
    pub fn unregister(&self, dev: &DeviceRef) -> Result<()> {
        let _guard = self.nrt_lock.lock().unwrap();

        let removed = {
            let mut slots = self.slots.lock();
            let index = dev.ifindex().checked_sub(1).ok_or(Error::NotFound)?;
            let matches = slots[index]
                .as_ref()
                .is_some_and(|entry| Arc::ptr_eq(entry, dev));
            if !matches {
                return Err(Error::NotFound);
            }
            slots[index].take().expect("slot checked above")
        };

        for hook in self.hooks.lock().unwrap().iter() {
            hook.device_unregistered(&removed);
        }

        // `removed` plus the caller's handle account for two references.
        while Arc::strong_count(&removed) > 2 {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        *removed.ifindex.lock() = 0;
        Ok(())
    }

    pub fn get_by_index(&self, ifindex: usize) -> Option<DeviceRef> {
        if ifindex == 0 || ifindex > MAX_RT_DEVICES {
            return None;
        }
        self.slots.lock()[ifindex - 1].clone()
    }

    pub fn get_by_name(&self, name: &str) -> Option<DeviceRef> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .find(|dev| dev.name() == name)
            .cloned()
    }

    pub fn get_by_hwaddr(&self, addr: EthernetAddress) -> Option<DeviceRef> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .find(|dev| dev.hw_addr == addr)
            .cloned()
    }

    pub fn get_loopback(&self) -> Option<DeviceRef> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .find(|dev| dev.flags().contains(DeviceFlags::LOOPBACK))
            .cloned()
    }

    /// Snapshot of all registered devices.
    pub fn iter(&self) -> Vec<DeviceRef> {
        self.slots.lock().iter().flatten().cloned().collect()
    }

    pub fn add_register_hook(&self, hook: Arc<dyn RegisterHook>) {
        self.hooks.lock().unwrap().push(hook);
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        DeviceTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtskb::Pool;

    fn test_device(name: &str) -> DeviceRef {
        Device::new_ethernet(
            name,
            EthernetAddress([0x02, 0, 0, 0, 0, 1]),
            1500,
            DeviceFlags::empty(),
            Box::new(Loopback::new()),
        )
    }

    #[test]
    fn register_assigns_first_free_index() {
        let table = DeviceTable::new();
        let event = Arc::new(RtEvent::new());
        let a = test_device("rteth%d");
        let b = test_device("rteth%d");
        assert_eq!(table.register(&a, &event).unwrap(), 1);
        assert_eq!(table.register(&b, &event).unwrap(), 2);
        assert_eq!(a.name(), "rteth0");
        assert_eq!(b.name(), "rteth1");

        table.unregister(&a).unwrap();
        let c = test_device("rteth%d");
        assert_eq!(table.register(&c, &event).unwrap(), 1);
    }

    #[test]
    fn duplicate_name_rejected() {
        let table = DeviceTable::new();
        let event = Arc::new(RtEvent::new());
        table.register(&test_device("lo"), &event).unwrap();
        assert_eq!(
            table.register(&test_device("lo"), &event).unwrap_err(),
            Error::AlreadyExists
        );
    }

    #[test]
    fn lookup_by_name_index_hwaddr() {
        let table = DeviceTable::new();
        let event = Arc::new(RtEvent::new());
        let dev = test_device("rteth0");
        table.register(&dev, &event).unwrap();

        assert!(Arc::ptr_eq(&table.get_by_name("rteth0").unwrap(), &dev));
        assert!(Arc::ptr_eq(&table.get_by_index(1).unwrap(), &dev));
        assert!(Arc::ptr_eq(
            &table.get_by_hwaddr(dev.hw_addr).unwrap(),
            &dev
        ));
        assert!(table.get_by_index(0).is_none());
        assert!(table.get_by_name("rteth9").is_none());
    }

    #[test]
    fn unregister_removes_slot() {
        let table = DeviceTable::new();
        let event = Arc::new(RtEvent::new());
        let dev = test_device("rteth0");
        table.register(&dev, &event).unwrap();
        table.unregister(&dev).unwrap();
        assert!(table.get_by_name("rteth0").is_none());
        assert_eq!(table.unregister(&dev).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn xmit_on_down_device_fails() {
        let dev = test_device("rteth0");
        let pool = Pool::new(1);
        let skb = pool.alloc(64).unwrap();
        assert_eq!(dev.xmit(skb).unwrap_err(), Error::NetDown);
        assert_eq!(dev.stats.tx_dropped.load(Ordering::Relaxed), 1);
        assert!(pool.is_full());
    }
}
