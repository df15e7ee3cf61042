//! Compile-time bounds and runtime tunables of the stack.
//!
//! Every table in this crate is sized here, once, at build time; nothing is
//! grown later. The former module parameters of the kernel build live in
//! [`ModuleConfig`] and are fixed when a [`crate::stack::Stack`] is created.

/// Number of slots in the device table. `ifindex` runs from 1 to this value.
pub const MAX_RT_DEVICES: usize = 8;

/// Data buffer size of every packet buffer, in bytes.
pub const DEFAULT_MAX_RTSKB_SIZE: usize = 1544;

/// Buffers kept in the stack-global pool independent of any device.
pub const DEFAULT_GLOBAL_RTSKBS: usize = 0;

/// Additional global-pool buffers contributed per registered device.
pub const DEFAULT_DEVICE_RTSKBS: usize = 16;

/// Default size of a per-socket compensation pool.
pub const DEFAULT_SOCKET_RTSKBS: usize = 16;

/// Hard upper bound on concurrently registered UDP sockets.
pub const RT_UDP_SOCKETS_MAX: usize = 256;

/// Entries in the packet-type registry (raw sockets, ARP, RTmac, RTcfg).
pub const MAX_PACKET_TYPES: usize = 16;

/// Pre-allocated host-route entries.
pub const HOST_ROUTES: usize = 32;
/// Host-route hash buckets; must be a power of two.
pub const HOST_HASH_TBL_SIZE: usize = 64;
pub const HOST_HASH_KEY_MASK: u32 = (HOST_HASH_TBL_SIZE - 1) as u32;

/// Pre-allocated network-route entries.
pub const NET_ROUTES: usize = 16;
/// Network-route hash buckets (one extra bucket holds unhashable networks).
pub const NET_HASH_TBL_SIZE: usize = 32;
pub const NET_HASH_KEY_MASK: u32 = (NET_HASH_TBL_SIZE - 1) as u32;
pub const DEFAULT_NET_HASH_KEY_SHIFT: u32 = 8;

/// Concurrent IP reassemblies.
pub const COLLECTOR_COUNT: usize = 10;
/// Defragmentation ticks after which an untouched collector is reclaimed.
pub const GARBAGE_COLLECT_LIMIT: u32 = 50;

/// Buffers owned by the process-wide ICMP reply socket.
pub const ICMP_REPLY_POOL_SIZE: usize = 8;

/// Runtime tunables, fixed at stack creation.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// Additional global-pool rtskbs contributed per network adapter.
    pub device_rtskbs: usize,
    /// Initial size of each socket's compensation pool.
    pub socket_rtskbs: usize,
    /// Number of UDP socket slots, at most [`RT_UDP_SOCKETS_MAX`].
    pub udp_sockets: usize,
    /// Base of the automatically assigned UDP port range.
    pub auto_port_start: u16,
    /// Mask defining the reserved automatic port range.
    pub auto_port_mask: u16,
    /// Right shift applied to the destination when hashing network routes.
    pub net_hash_key_shift: u32,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        let udp_sockets = 64;
        ModuleConfig {
            device_rtskbs: DEFAULT_DEVICE_RTSKBS,
            socket_rtskbs: DEFAULT_SOCKET_RTSKBS,
            udp_sockets,
            auto_port_start: 1024,
            auto_port_mask: !(udp_sockets as u16 - 1),
            net_hash_key_shift: DEFAULT_NET_HASH_KEY_SHIFT,
        }
    }
}

impl ModuleConfig {
    /// Clamp inconsistent settings at stack creation.
    pub fn sanitized(mut self) -> Self {
        if self.udp_sockets == 0 || self.udp_sockets > RT_UDP_SOCKETS_MAX {
            self.udp_sockets = RT_UDP_SOCKETS_MAX;
        }
        if u32::from(self.auto_port_start) >= 0x10000 - self.udp_sockets as u32 {
            self.auto_port_start = 1024;
        }
        self.auto_port_start &= self.auto_port_mask;
        self
    }

    /// True if `port` falls into the reserved automatic assignment range.
    pub fn in_auto_range(&self, port: u16) -> bool {
        (port & self.auto_port_mask) == self.auto_port_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_range_reservation() {
        let cfg = ModuleConfig::default().sanitized();
        assert!(cfg.in_auto_range(1024));
        assert!(cfg.in_auto_range(1024 + cfg.udp_sockets as u16 - 1));
        assert!(!cfg.in_auto_range(1024 + cfg.udp_sockets as u16));
        assert!(!cfg.in_auto_range(35000));
    }

    #[test]
    fn sanitize_clamps_out_of_range_start() {
        let cfg = ModuleConfig {
            auto_port_start: 0xFFF0,
            ..ModuleConfig::default()
        }
        .sanitized();
        assert_eq!(cfg.auto_port_start, 1024);
    }
}
