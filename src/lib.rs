/*! Deterministic IPv4/UDP networking with time-division media access.

This crate implements a hard-real-time networking stack: pre-allocated
packet buffers ([`rtskb`]), a bounded device registry ([`device`]), hash-table
routing ([`ipv4::route`]), a single stack-manager task per [`stack::Stack`],
UDP/ICMP protocol handlers, polymorphic sockets with per-socket compensation
pools ([`socket`]), and a TDMA media-access discipline ([`rtmac`]) that
multiplexes a shared link on an explicit time schedule.

Nothing on the send or receive hot path allocates: every buffer is drawn from
a pool that was filled at configuration time, and buffers migrate between
pools only through compensated transfers that conserve each pool's quota.
*/

#[macro_use]
mod macros;

pub mod config;
pub mod time;

pub mod sys;
pub mod wire;

pub mod rtskb;

pub mod device;

pub mod ipv4;
pub mod rtcfg;
pub mod rtmac;
pub mod socket;
pub mod stack;

pub mod mgmt;
pub mod proc;

mod error;
pub use self::error::{Error, Result};
