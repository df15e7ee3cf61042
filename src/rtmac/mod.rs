/*! Media-access-control disciplines.

A discipline attaches beneath a device and interposes on its transmit
path: [`crate::device::Device::xmit`] routes real-time frames through
[`MacDiscipline::rt_packet_tx`], and the stack manager hands every
received discipline frame (Ethernet type 0x9021) to
[`MacDiscipline::packet_rx`]. [`tdma`] is the one discipline this crate
ships.
*/

pub mod tdma;

use crate::device::DeviceRef;
use crate::rtskb::Rtskb;
use crate::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, RtmacDiscipline, RtmacFrame,
    RTMAC_HEADER_LEN,
};
use crate::Result;

/// The operations a media-access discipline provides.
pub trait MacDiscipline: Send + Sync {
    fn name(&self) -> &'static str;

    /// Concrete discipline behind the trait object, for the management
    /// surface.
    fn as_any(self: std::sync::Arc<Self>) -> std::sync::Arc<dyn core::any::Any + Send + Sync>;

    /// Take over a real-time transmission. The discipline owns the
    /// buffer from here, including on error.
    fn rt_packet_tx(&self, skb: Box<Rtskb>, dev: &DeviceRef) -> Result<()>;

    /// Take over a transmission on behalf of the non-real-time stack.
    fn nrt_packet_tx(&self, skb: Box<Rtskb>, dev: &DeviceRef) -> Result<()>;

    /// Handle a received discipline frame; the payload window starts at
    /// the discipline header.
    fn packet_rx(&self, skb: Box<Rtskb>, dev: &DeviceRef);

    /// The MTU the discipline can guarantee towards the upper layers.
    fn get_mtu(&self, hw_mtu: usize) -> usize;

    /// Detach from `dev`, tearing down the discipline state.
    fn detach(&self, dev: &DeviceRef) -> Result<()>;
}

/// Prepend Ethernet and discipline headers to a control frame under
/// construction; `skb`'s payload window must hold the discipline
/// payload.
pub(crate) fn add_header(
    dev: &DeviceRef,
    dst_addr: EthernetAddress,
    skb: &mut Rtskb,
    discipline: RtmacDiscipline,
) {
    {
        let region = skb.push(RTMAC_HEADER_LEN);
        RtmacFrame::new_unchecked(&mut *region).set_discipline(discipline);
    }
    let eth_hlen = EthernetFrame::<&[u8]>::header_len();
    let region = skb.push(eth_hlen);
    let mut frame = EthernetFrame::new_unchecked(&mut *region);
    EthernetRepr {
        src_addr: dev.hw_addr,
        dst_addr,
        ethertype: EthernetProtocol::Rtmac,
    }
    .emit(&mut frame);
}
