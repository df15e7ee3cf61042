/*! Host and network routing.

Two bounded hash tables resolve a destination IP into `(MAC, device)`:
explicit host routes first, then optional network routes whose gateway is
itself resolved through the host table. Entries come from pre-allocated
arenas with free lists; nothing is allocated after construction.

The host table doubles as the ARP cache: address resolution learns host
routes, and the `arp` view is an alias of `host_route`.
*/

use crate::config::{
    HOST_HASH_KEY_MASK, HOST_HASH_TBL_SIZE, HOST_ROUTES, NET_HASH_KEY_MASK, NET_HASH_TBL_SIZE,
    NET_ROUTES,
};
use crate::device::DeviceRef;
use crate::sys::RtLock;
use crate::wire::{EthernetAddress, Ipv4Address};
use crate::{Error, Result};

/// The resolved output route used by the send path.
#[derive(Debug, Clone)]
pub struct DestRoute {
    pub ip: Ipv4Address,
    pub dev_addr: EthernetAddress,
    pub rtdev: DeviceRef,
}

#[derive(Debug)]
struct HostEntry {
    ip: Ipv4Address,
    dev_addr: EthernetAddress,
    rtdev: DeviceRef,
    next: Option<usize>,
}

struct HostTable {
    entries: [Option<HostEntry>; HOST_ROUTES],
    free: Option<usize>,
    free_links: [Option<usize>; HOST_ROUTES],
    buckets: [Option<usize>; HOST_HASH_TBL_SIZE],
    allocated: usize,
}

impl HostTable {
    fn new() -> HostTable {
        let mut free_links = [None; HOST_ROUTES];
        for (i, link) in free_links.iter_mut().enumerate().take(HOST_ROUTES - 1) {
            *link = Some(i + 1);
        }
        HostTable {
            entries: core::array::from_fn(|_| None),
            free: Some(0),
            free_links,
            buckets: [None; HOST_HASH_TBL_SIZE],
            allocated: 0,
        }
    }

    fn alloc(&mut self) -> Option<usize> {
        let index = self.free?;
        self.free = self.free_links[index];
        self.allocated += 1;
        Some(index)
    }

    fn release(&mut self, index: usize) {
        self.entries[index] = None;
        self.free_links[index] = self.free;
        self.free = Some(index);
        self.allocated -= 1;
    }
}

#[derive(Debug)]
struct NetEntry {
    net: Ipv4Address,
    mask: Ipv4Address,
    gw: Ipv4Address,
    next: Option<usize>,
}

struct NetTable {
    entries: [Option<NetEntry>; NET_ROUTES],
    free: Option<usize>,
    free_links: [Option<usize>; NET_ROUTES],
    /// The extra bucket holds networks whose mask cannot feed the hash.
    buckets: [Option<usize>; NET_HASH_TBL_SIZE + 1],
    allocated: usize,
}

impl NetTable {
    fn new() -> NetTable {
        let mut free_links = [None; NET_ROUTES];
        for (i, link) in free_links.iter_mut().enumerate().take(NET_ROUTES - 1) {
            *link = Some(i + 1);
        }
        NetTable {
            entries: core::array::from_fn(|_| None),
            free: Some(0),
            free_links,
            buckets: [None; NET_HASH_TBL_SIZE + 1],
            allocated: 0,
        }
    }

    fn alloc(&mut self) -> Option<usize> {
        let index = self.free?;
        self.free = self.free_links[index];
        self.allocated += 1;
        Some(index)
    }

    fn release(&mut self, index: usize) {
        self.entries[index] = None;
        self.free_links[index] = self.free;
        self.free = Some(index);
        self.allocated -= 1;
    }
}

fn host_key(addr: Ipv4Address) -> usize {
    (u32::from(addr) & HOST_HASH_KEY_MASK) as usize
}

/// A row of the host-route snapshot view.
#[derive(Debug, Clone)]
pub struct HostRouteRow {
    pub key: usize,
    pub ip: Ipv4Address,
    pub dev_addr: EthernetAddress,
    pub device: String,
}

/// A row of the network-route snapshot view.
#[derive(Debug, Clone)]
pub struct NetRouteRow {
    /// `None` marks the unhashed overflow bucket.
    pub key: Option<usize>,
    pub net: Ipv4Address,
    pub mask: Ipv4Address,
    pub gateway: Ipv4Address,
}

/// The routing tables of one stack instance.
pub struct Routes {
    host: RtLock<HostTable>,
    net: RtLock<NetTable>,
    net_hash_key_shift: u32,
}

impl Routes {
    pub fn new(net_hash_key_shift: u32) -> Routes {
        Routes {
            host: RtLock::new(HostTable::new()),
            net: RtLock::new(NetTable::new()),
            net_hash_key_shift,
        }
    }

    fn net_key(&self, addr: Ipv4Address, mask: Ipv4Address) -> usize {
        let shifted_mask = NET_HASH_KEY_MASK << self.net_hash_key_shift;
        if (u32::from(mask) & shifted_mask) == shifted_mask {
            ((u32::from(addr) >> self.net_hash_key_shift) & NET_HASH_KEY_MASK) as usize
        } else {
            NET_HASH_TBL_SIZE
        }
    }

    /// Add or update a host route. An existing entry for `addr` has its
    /// MAC and device replaced in place.
    pub fn add_host(
        &self,
        addr: Ipv4Address,
        dev_addr: EthernetAddress,
        rtdev: &DeviceRef,
    ) -> Result<()> {
        let key = host_key(addr);
        let mut table = self.host.lock();

        let mut cursor = table.buckets[key];
        while let Some(index) = cursor {
            let entry = table.entries[index].as_mut().expect("linked entry");
            if entry.ip == addr {
                entry.dev_addr = dev_addr;
                entry.rtdev = rtdev.clone();
                return Ok(());
            }
            cursor = entry.next;
        }

        let index = table.alloc().ok_or(Error::Again)?;
        let head = table.buckets[key];
        table.entries[index] = Some(HostEntry {
            ip: addr,
            dev_addr,
            rtdev: rtdev.clone(),
            next: head,
        });
        table.buckets[key] = Some(index);
        Ok(())
    }

    /// Delete the host route for `addr`.
    pub fn del_host(&self, addr: Ipv4Address) -> Result<()> {
        let key = host_key(addr);
        let mut table = self.host.lock();

        let mut prev: Option<usize> = None;
        let mut cursor = table.buckets[key];
        while let Some(index) = cursor {
            let entry = table.entries[index].as_ref().expect("linked entry");
            let next = entry.next;
            if entry.ip == addr {
                match prev {
                    None => table.buckets[key] = next,
                    Some(prev) => {
                        table.entries[prev].as_mut().expect("linked entry").next = next
                    }
                }
                table.release(index);
                return Ok(());
            }
            prev = Some(index);
            cursor = next;
        }
        Err(Error::NotFound)
    }

    /// Delete every host route through `rtdev`, including the local one.
    pub fn del_all_host(&self, rtdev: &DeviceRef) {
        let mut table = self.host.lock();
        for key in 0..HOST_HASH_TBL_SIZE {
            let mut prev: Option<usize> = None;
            let mut cursor = table.buckets[key];
            while let Some(index) = cursor {
                let entry = table.entries[index].as_ref().expect("linked entry");
                let next = entry.next;
                if DeviceRef::ptr_eq(&entry.rtdev, rtdev) {
                    match prev {
                        None => table.buckets[key] = next,
                        Some(prev) => {
                            table.entries[prev].as_mut().expect("linked entry").next = next
                        }
                    }
                    table.release(index);
                } else {
                    prev = Some(index);
                }
                cursor = next;
            }
        }
    }

    fn host_lookup(&self, daddr: Ipv4Address, out_ip: Ipv4Address) -> Option<DestRoute> {
        let table = self.host.lock();
        let mut cursor = table.buckets[host_key(daddr)];
        while let Some(index) = cursor {
            let entry = table.entries[index].as_ref().expect("linked entry");
            if entry.ip == daddr {
                return Some(DestRoute {
                    ip: out_ip,
                    dev_addr: entry.dev_addr,
                    rtdev: entry.rtdev.clone(),
                });
            }
            cursor = entry.next;
        }
        None
    }

    fn net_lookup(&self, daddr: Ipv4Address) -> Option<Ipv4Address> {
        let table = self.net.lock();
        let hashed = ((u32::from(daddr) >> self.net_hash_key_shift) & NET_HASH_KEY_MASK) as usize;
        for key in [hashed, NET_HASH_TBL_SIZE] {
            let mut cursor = table.buckets[key];
            while let Some(index) = cursor {
                let entry = table.entries[index].as_ref().expect("linked entry");
                if u32::from(entry.net) == (u32::from(daddr) & u32::from(entry.mask)) {
                    return Some(entry.gw);
                }
                cursor = entry.next;
            }
        }
        None
    }

    /// Resolve an output route for `daddr`.
    ///
    /// Order: host table; on miss, network table exactly once, replacing
    /// the lookup target with the gateway. The single restart bounds the
    /// work even with a misconfigured gateway chain.
    pub fn output(&self, daddr: Ipv4Address) -> Result<DestRoute> {
        if let Some(route) = self.host_lookup(daddr, daddr) {
            return Ok(route);
        }

        if let Some(gw) = self.net_lookup(daddr) {
            if let Some(route) = self.host_lookup(gw, daddr) {
                return Ok(route);
            }
        }

        net_debug!("route: host {} unreachable", daddr);
        Err(Error::HostUnreachable)
    }

    /// Add or update a network route. The network address is masked down
    /// before insertion.
    pub fn add_net(&self, addr: Ipv4Address, mask: Ipv4Address, gw: Ipv4Address) -> Result<()> {
        let addr = Ipv4Address::from(u32::from(addr) & u32::from(mask));
        let key = self.net_key(addr, mask);
        let mut table = self.net.lock();

        let mut cursor = table.buckets[key];
        while let Some(index) = cursor {
            let entry = table.entries[index].as_mut().expect("linked entry");
            if entry.net == addr && entry.mask == mask {
                entry.gw = gw;
                return Ok(());
            }
            cursor = entry.next;
        }

        let index = table.alloc().ok_or(Error::Again)?;
        let head = table.buckets[key];
        table.entries[index] = Some(NetEntry {
            net: addr,
            mask,
            gw,
            next: head,
        });
        table.buckets[key] = Some(index);
        Ok(())
    }

    /// Delete the network route for `(addr & mask, mask)`.
    pub fn del_net(&self, addr: Ipv4Address, mask: Ipv4Address) -> Result<()> {
        let addr = Ipv4Address::from(u32::from(addr) & u32::from(mask));
        let key = self.net_key(addr, mask);
        let mut table = self.net.lock();

        let mut prev: Option<usize> = None;
        let mut cursor = table.buckets[key];
        while let Some(index) = cursor {
            let entry = table.entries[index].as_ref().expect("linked entry");
            let next = entry.next;
            if entry.net == addr && entry.mask == mask {
                match prev {
                    None => table.buckets[key] = next,
                    Some(prev) => {
                        table.entries[prev].as_mut().expect("linked entry").next = next
                    }
                }
                table.release(index);
                return Ok(());
            }
            prev = Some(index);
            cursor = next;
        }
        Err(Error::NotFound)
    }

    /// Number of allocated host and network routes.
    pub fn allocated(&self) -> (usize, usize) {
        (self.host.lock().allocated, self.net.lock().allocated)
    }

    /// Copy the host table row by row; each row is captured under the
    /// lock, the whole listing is not atomic.
    pub fn host_rows(&self) -> Vec<HostRouteRow> {
        let mut rows = Vec::new();
        for key in 0..HOST_HASH_TBL_SIZE {
            let mut at = 0;
            loop {
                let table = self.host.lock();
                let mut cursor = table.buckets[key];
                for _ in 0..at {
                    cursor = cursor.and_then(|i| table.entries[i].as_ref().unwrap().next);
                }
                let Some(index) = cursor else { break };
                let entry = table.entries[index].as_ref().unwrap();
                let row = HostRouteRow {
                    key,
                    ip: entry.ip,
                    dev_addr: entry.dev_addr,
                    device: entry.rtdev.name(),
                };
                drop(table);
                rows.push(row);
                at += 1;
            }
        }
        rows
    }

    /// Copy the network table row by row.
    pub fn net_rows(&self) -> Vec<NetRouteRow> {
        let mut rows = Vec::new();
        for key in 0..=NET_HASH_TBL_SIZE {
            let mut at = 0;
            loop {
                let table = self.net.lock();
                let mut cursor = table.buckets[key];
                for _ in 0..at {
                    cursor = cursor.and_then(|i| table.entries[i].as_ref().unwrap().next);
                }
                let Some(index) = cursor else { break };
                let entry = table.entries[index].as_ref().unwrap();
                let row = NetRouteRow {
                    key: (key < NET_HASH_TBL_SIZE).then_some(key),
                    net: entry.net,
                    mask: entry.mask,
                    gateway: entry.gw,
                };
                drop(table);
                rows.push(row);
                at += 1;
            }
        }
        rows
    }
}

/// Accept an ingress packet when it is addressed to the receiving device
/// (unicast, broadcast, or any address on a loopback device).
pub fn route_input(rtdev: &DeviceRef, daddr: Ipv4Address) -> bool {
    daddr == rtdev.local_ip()
        || daddr == rtdev.broadcast_ip()
        || daddr.is_broadcast()
        || rtdev
            .flags()
            .contains(crate::device::DeviceFlags::LOOPBACK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_NET_HASH_KEY_SHIFT;
    use crate::device::{Device, DeviceFlags, Loopback};

    fn dev(name: &str) -> DeviceRef {
        Device::new_ethernet(
            name,
            EthernetAddress([0x02, 0, 0, 0, 0, 9]),
            1500,
            DeviceFlags::empty(),
            Box::new(Loopback::new()),
        )
    }

    fn routes() -> Routes {
        Routes::new(DEFAULT_NET_HASH_KEY_SHIFT)
    }

    #[test]
    fn host_add_lookup_delete() {
        let routes = routes();
        let dev = dev("rteth0");
        let ip = Ipv4Address::new(192, 168, 0, 2);
        let mac = EthernetAddress([0x02, 0, 0, 0, 0, 2]);

        routes.add_host(ip, mac, &dev).unwrap();
        let route = routes.output(ip).unwrap();
        assert_eq!(route.dev_addr, mac);
        assert_eq!(route.ip, ip);

        routes.del_host(ip).unwrap();
        assert_eq!(routes.output(ip).unwrap_err(), Error::HostUnreachable);
        assert_eq!(routes.del_host(ip).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn host_add_updates_in_place() {
        let routes = routes();
        let dev = dev("rteth0");
        let ip = Ipv4Address::new(192, 168, 0, 2);
        routes
            .add_host(ip, EthernetAddress([2, 0, 0, 0, 0, 2]), &dev)
            .unwrap();
        routes
            .add_host(ip, EthernetAddress([2, 0, 0, 0, 0, 3]), &dev)
            .unwrap();
        assert_eq!(routes.allocated().0, 1);
        assert_eq!(
            routes.output(ip).unwrap().dev_addr,
            EthernetAddress([2, 0, 0, 0, 0, 3])
        );
    }

    #[test]
    fn colliding_keys_share_bucket() {
        let routes = routes();
        let dev = dev("rteth0");
        // .2 and 1.2 collide: the key is the low 6 bits of the address.
        let a = Ipv4Address::new(192, 168, 0, 2);
        let b = Ipv4Address::new(192, 168, 1, 2);
        routes
            .add_host(a, EthernetAddress([2, 0, 0, 0, 0, 0xa]), &dev)
            .unwrap();
        routes
            .add_host(b, EthernetAddress([2, 0, 0, 0, 0, 0xb]), &dev)
            .unwrap();
        assert_eq!(
            routes.output(a).unwrap().dev_addr,
            EthernetAddress([2, 0, 0, 0, 0, 0xa])
        );
        assert_eq!(
            routes.output(b).unwrap().dev_addr,
            EthernetAddress([2, 0, 0, 0, 0, 0xb])
        );
    }

    #[test]
    fn device_sweep_removes_only_its_routes() {
        let routes = routes();
        let left = dev("rteth0");
        let right = dev("rteth1");
        routes
            .add_host(
                Ipv4Address::new(10, 0, 0, 1),
                EthernetAddress([2, 0, 0, 0, 0, 1]),
                &left,
            )
            .unwrap();
        routes
            .add_host(
                Ipv4Address::new(10, 0, 0, 2),
                EthernetAddress([2, 0, 0, 0, 0, 2]),
                &right,
            )
            .unwrap();

        routes.del_all_host(&left);
        assert!(routes.output(Ipv4Address::new(10, 0, 0, 1)).is_err());
        assert!(routes.output(Ipv4Address::new(10, 0, 0, 2)).is_ok());
        assert_eq!(routes.allocated().0, 1);
    }

    #[test]
    fn gateway_resolution_restarts_once() {
        let routes = routes();
        let dev = dev("rteth0");
        let gw = Ipv4Address::new(10, 0, 0, 254);
        let gw_mac = EthernetAddress([2, 0, 0, 0, 0, 0xfe]);

        routes
            .add_net(
                Ipv4Address::new(192, 168, 2, 0),
                Ipv4Address::new(255, 255, 255, 0),
                gw,
            )
            .unwrap();
        // Without a host route for the gateway the lookup must fail, not
        // recurse.
        assert_eq!(
            routes
                .output(Ipv4Address::new(192, 168, 2, 7))
                .unwrap_err(),
            Error::HostUnreachable
        );

        routes.add_host(gw, gw_mac, &dev).unwrap();
        let route = routes.output(Ipv4Address::new(192, 168, 2, 7)).unwrap();
        assert_eq!(route.dev_addr, gw_mac);
        // The datagram still goes to its final destination address.
        assert_eq!(route.ip, Ipv4Address::new(192, 168, 2, 7));
    }

    #[test]
    fn unhashable_network_lands_in_overflow() {
        let routes = routes();
        let dev = dev("rteth0");
        let gw = Ipv4Address::new(10, 0, 0, 254);
        routes
            .add_host(gw, EthernetAddress([2, 0, 0, 0, 0, 0xfe]), &dev)
            .unwrap();
        // Mask with too few bits for the hash shift.
        routes
            .add_net(
                Ipv4Address::new(172, 0, 0, 0),
                Ipv4Address::new(255, 0, 0, 0),
                gw,
            )
            .unwrap();

        let rows = routes.net_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, None);
        assert!(routes.output(Ipv4Address::new(172, 16, 5, 5)).is_ok());
    }

    #[test]
    fn table_exhaustion_reports_again() {
        let routes = routes();
        let dev = dev("rteth0");
        for i in 0..HOST_ROUTES {
            routes
                .add_host(
                    Ipv4Address::new(10, 1, (i / 256) as u8, (i % 256) as u8),
                    EthernetAddress([2, 0, 0, 0, 0, i as u8]),
                    &dev,
                )
                .unwrap();
        }
        assert_eq!(
            routes
                .add_host(
                    Ipv4Address::new(10, 2, 0, 0),
                    EthernetAddress([2, 0, 0, 0, 0, 0xff]),
                    &dev,
                )
                .unwrap_err(),
            Error::Again
        );
    }

    #[test]
    fn input_accepts_local_broadcast_loopback() {
        let dev = dev("rteth0");
        dev.set_addresses(
            Ipv4Address::new(10, 0, 0, 1),
            Ipv4Address::new(10, 0, 0, 255),
        );
        assert!(route_input(&dev, Ipv4Address::new(10, 0, 0, 1)));
        assert!(route_input(&dev, Ipv4Address::new(10, 0, 0, 255)));
        assert!(route_input(&dev, Ipv4Address::BROADCAST));
        assert!(!route_input(&dev, Ipv4Address::new(10, 0, 0, 2)));
    }
}
