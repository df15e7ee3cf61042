/*! Read-only snapshot views of the stack state.

Each renderer copies its rows under the owning lock and formats into any
[`fmt::Write`] sink; listings are row-consistent, not globally atomic —
the same contract the procfs files carried.
*/

use core::fmt::{self, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::rtmac::tdma::Tdma;
use crate::rtmac::tdma::TdmaFlags;
use crate::stack::Stack;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version(out: &mut impl Write) -> fmt::Result {
    writeln!(out, "RTnet-rs {}", VERSION)
}

/// `devices`: name, index, flags, addresses.
pub fn devices(stack: &Stack, out: &mut impl Write) -> fmt::Result {
    writeln!(out, "Index\tName\t\tFlags\t\tIP")?;
    for dev in stack.devices.iter() {
        writeln!(
            out,
            "{}\t{:<15} {:?}\t{}",
            dev.ifindex(),
            dev.name(),
            dev.flags(),
            dev.local_ip()
        )?;
    }
    Ok(())
}

/// `rtskb`: pool and buffer statistics.
pub fn rtskb(stack: &Stack, out: &mut impl Write) -> fmt::Result {
    let stats = crate::rtskb::pool_stats();
    writeln!(out, "Pools (current/max):\t{} / {}", stats.pools, stats.pools_max)?;
    writeln!(
        out,
        "rtskbs (current/max):\t{} / {}",
        stats.rtskbs, stats.rtskbs_max
    )?;
    writeln!(
        out,
        "Global pool (free/cap):\t{} / {}",
        stack.global_pool.free_count(),
        stack.global_pool.capacity()
    )
}

/// `stats`: netdev-style counters, one row per device.
pub fn stats(stack: &Stack, out: &mut impl Write) -> fmt::Result {
    writeln!(
        out,
        "Iface\t\trx_packets rx_bytes rx_dropped tx_packets tx_bytes tx_dropped"
    )?;
    for dev in stack.devices.iter() {
        let s = &dev.stats;
        writeln!(
            out,
            "{:<15} {} {} {} {} {} {}",
            dev.name(),
            s.rx_packets.load(Ordering::Relaxed),
            s.rx_bytes.load(Ordering::Relaxed),
            s.rx_dropped.load(Ordering::Relaxed),
            s.tx_packets.load(Ordering::Relaxed),
            s.tx_bytes.load(Ordering::Relaxed),
            s.tx_dropped.load(Ordering::Relaxed),
        )?;
    }
    Ok(())
}

/// `ipv4/route`: allocation summary of both tables.
pub fn route(stack: &Stack, out: &mut impl Write) -> fmt::Result {
    let (hosts, nets) = stack.routes.allocated();
    writeln!(
        out,
        "Host routes allocated/total:\t{}/{}",
        hosts,
        crate::config::HOST_ROUTES
    )?;
    writeln!(
        out,
        "Host hash table size:\t\t{}",
        crate::config::HOST_HASH_TBL_SIZE
    )?;
    writeln!(
        out,
        "Network routes allocated/total:\t{}/{}",
        nets,
        crate::config::NET_ROUTES
    )?;
    writeln!(
        out,
        "Network hash table size:\t{}",
        crate::config::NET_HASH_TBL_SIZE
    )?;
    writeln!(
        out,
        "IP Router:\t\t\t{}",
        if stack.forwarding() { "yes" } else { "no" }
    )
}

/// `ipv4/host_route` — also served as `ipv4/arp`: the tables are one.
pub fn host_route(stack: &Stack, out: &mut impl Write) -> fmt::Result {
    writeln!(out, "Hash\tDestination\tHW Address\t\tDevice")?;
    for row in stack.routes.host_rows() {
        writeln!(
            out,
            "{:02X}\t{:<15} {}\t{}",
            row.key, row.ip, row.dev_addr, row.device
        )?;
    }
    Ok(())
}

/// `ipv4/net_route`.
pub fn net_route(stack: &Stack, out: &mut impl Write) -> fmt::Result {
    writeln!(out, "Hash\tDestination\tMask\t\t\tGateway")?;
    for row in stack.routes.net_rows() {
        match row.key {
            Some(key) => write!(out, "{key:02X}\t")?,
            None => write!(out, "*\t")?,
        }
        writeln!(out, "{:<15} {:<15} {}", row.net, row.mask, row.gateway)?;
    }
    Ok(())
}

/// `rtcfg/<if>/station_list`: managed stations of one service instance.
pub fn rtcfg_stations(rtcfg: &crate::rtcfg::Rtcfg, out: &mut impl Write) -> fmt::Result {
    writeln!(out, "Station\t\t\tState\tBurstrate")?;
    for conn in rtcfg.stations() {
        match conn.addr {
            crate::rtcfg::PeerAddr::Ip(ip) => write!(out, "{ip:<23} ")?,
            crate::rtcfg::PeerAddr::Mac(mac) => write!(out, "{mac:<23} ")?,
        }
        writeln!(out, "{:?}\t{}", conn.state, conn.burstrate)?;
    }
    Ok(())
}

/// `tdma`: operation mode and state of one attached instance.
pub fn tdma(ifname: &str, tdma: &Arc<Tdma>, out: &mut impl Write) -> fmt::Result {
    writeln!(out, "Interface       Operation Mode  Cycle   State")?;
    let flags = tdma.flags();
    let state = if flags.contains(TdmaFlags::CALIBRATED) {
        if flags.contains(TdmaFlags::BACKUP_MASTER) && !flags.contains(TdmaFlags::BACKUP_ACTIVE) {
            "stand-by"
        } else {
            "active"
        }
    } else {
        "init"
    };
    let mode = if flags.contains(TdmaFlags::BACKUP_MASTER) {
        "Backup Master"
    } else if flags.contains(TdmaFlags::MASTER) {
        "Master"
    } else {
        "Slave"
    };
    let cycle_us = tdma.cycle_period().total_micros();
    if flags.contains(TdmaFlags::MASTER) {
        writeln!(out, "{ifname:<15} {mode:<15} {cycle_us:<7} {state}")
    } else {
        writeln!(out, "{ifname:<15} {mode:<15} -       {state}")
    }
}

/// `tdma_slots`: `id:offset:phasing/period:size` per slot.
pub fn tdma_slots(ifname: &str, tdma: &Arc<Tdma>, out: &mut impl Write) -> fmt::Result {
    writeln!(out, "Interface       Slots (id:offset:phasing/period:size)")?;
    write!(out, "{ifname:<15} ")?;
    for (id, offset, phasing, period, mtu) in tdma.slot_rows() {
        write!(
            out,
            "{}:{}:{}/{}:{}  ",
            id,
            offset.total_micros(),
            phasing + 1,
            period,
            mtu
        )?;
    }
    writeln!(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;

    #[test]
    fn renderers_produce_headers() {
        let stack = Stack::new(ModuleConfig::default());
        let mut out = String::new();
        version(&mut out).unwrap();
        devices(&stack, &mut out).unwrap();
        rtskb(&stack, &mut out).unwrap();
        stats(&stack, &mut out).unwrap();
        route(&stack, &mut out).unwrap();
        host_route(&stack, &mut out).unwrap();
        net_route(&stack, &mut out).unwrap();
        assert!(out.contains("RTnet-rs"));
        assert!(out.contains("Host routes allocated/total"));
        stack.shutdown();
    }
}
