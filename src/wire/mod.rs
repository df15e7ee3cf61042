/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*. It provides two
levels of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens through the
   `Packet` family of structures, e.g. [EthernetFrame] or [Ipv4Packet].
 * Second, in cases where the space of valid field values is much smaller
   than the space of possible field values, it provides a compact, high-level
   representation of packet data that can be parsed from and emitted into a
   sequence of octets. This happens through the `Repr` family of structs and
   enums, e.g. [ArpRepr] or [TdmaRepr].

The `Packet` family of data structures guarantees that, if the
`Packet::check_len()` method returned `Ok(())`, then no accessor or setter
method will panic. `Packet::new_checked` is a shorthand for a combination of
`Packet::new_unchecked` and `Packet::check_len`; parsing untrusted input
must go through it.

[EthernetFrame]: struct.EthernetFrame.html
[Ipv4Packet]: struct.Ipv4Packet.html
[ArpRepr]: enum.ArpRepr.html
[TdmaRepr]: enum.TdmaRepr.html
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

use core::fmt;

pub(crate) mod checksum;

mod ethernet;
pub use self::ethernet::{
    Address as EthernetAddress, EtherType as EthernetProtocol, Frame as EthernetFrame,
    Repr as EthernetRepr, HEADER_LEN as ETHERNET_HEADER_LEN,
};

mod arp;
pub use self::arp::{
    Hardware as ArpHardware, Operation as ArpOperation, Packet as ArpPacket, Repr as ArpRepr,
};

pub(crate) mod ipv4;
pub use self::ipv4::{
    Address as Ipv4Address, Key as Ipv4FragKey, Packet as Ipv4Packet, Protocol as IpProtocol,
    Repr as Ipv4Repr, HEADER_LEN as IPV4_HEADER_LEN, MIN_MTU as IPV4_MIN_MTU,
};

mod udp;
pub use self::udp::{Packet as UdpPacket, Repr as UdpRepr, HEADER_LEN as UDP_HEADER_LEN};

mod icmpv4;
pub use self::icmpv4::{
    Message as Icmpv4Message, Packet as Icmpv4Packet, Repr as Icmpv4Repr,
    HEADER_LEN as ICMPV4_HEADER_LEN,
};

mod rtmac;
pub use self::rtmac::{
    Discipline as RtmacDiscipline, Frame as RtmacFrame, TdmaFrameId, TdmaPacket, TdmaRepr,
    RTMAC_HEADER_LEN, TDMA_VERSION,
};

mod rtcfg;
pub use self::rtcfg::{
    AddrType as RtcfgAddrType, FrameId as RtcfgFrameId, Packet as RtcfgPacket,
    Stage1Addrs as RtcfgStage1Addrs, Stage1Repr as RtcfgStage1Repr,
};

/// Parsing a packet failed.
///
/// Either it is malformed, or it is not supported by this stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// An IPv4 endpoint: address plus port.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Endpoint {
    pub addr: Ipv4Address,
    pub port: u16,
}

impl Endpoint {
    pub const UNSPECIFIED: Endpoint = Endpoint::new(Ipv4Address::UNSPECIFIED, 0);

    pub const fn new(addr: Ipv4Address, port: u16) -> Endpoint {
        Endpoint { addr, port }
    }
}

impl Default for Endpoint {
    fn default() -> Endpoint {
        Endpoint::UNSPECIFIED
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}
