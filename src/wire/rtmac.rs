//! Media-access-control discipline framing.
//!
//! A discipline frame travels in an Ethernet frame of type 0x9021. Its
//! two-octet header names the discipline; the TDMA discipline (0x0001)
//! follows with a one-octet frame id, a one-octet version and a
//! frame-specific payload. The sync payload is the master's cycle start as
//! a 64-bit big-endian nanosecond counter.

use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::{Error, Result};

enum_with_unknown! {
    /// Registered media-access disciplines.
    pub enum Discipline(u16) {
        Tdma = 0x0001
    }
}

/// Length of the discipline header in front of every discipline frame.
pub const RTMAC_HEADER_LEN: usize = 2;

/// Version emitted into and required from every TDMA frame.
pub const TDMA_VERSION: u8 = 2;

enum_with_unknown! {
    /// TDMA frame id.
    pub enum TdmaFrameId(u8) {
        Sync = 0,
        CalRequest = 1,
        CalReply = 2
    }
}

/// A read/write wrapper around the discipline header.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Frame<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Frame<T> {
    pub const fn new_unchecked(buffer: T) -> Frame<T> {
        Frame { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Frame<T>> {
        let frame = Self::new_unchecked(buffer);
        frame.check_len()?;
        Ok(frame)
    }

    pub fn check_len(&self) -> Result<()> {
        if self.buffer.as_ref().len() < RTMAC_HEADER_LEN {
            Err(Error)
        } else {
            Ok(())
        }
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the discipline type field.
    #[inline]
    pub fn discipline(&self) -> Discipline {
        let data = self.buffer.as_ref();
        Discipline::from(NetworkEndian::read_u16(&data[0..2]))
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Frame<&'a T> {
    /// Return a pointer to the discipline payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.buffer.as_ref()[RTMAC_HEADER_LEN..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Frame<T> {
    /// Set the discipline type field.
    #[inline]
    pub fn set_discipline(&mut self, value: Discipline) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[0..2], value.into())
    }

    /// Return a mutable pointer to the discipline payload.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut()[RTMAC_HEADER_LEN..]
    }
}

/// A read/write wrapper around a TDMA control frame (without the
/// discipline header).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TdmaPacket<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    use crate::wire::field::*;

    pub const FRAME_ID: usize = 0;
    pub const VERSION: usize = 1;

    pub const SYNC_CYCLE_START: Field = 2..10;

    pub const CAL_TX_STAMP: Field = 2..10;

    pub const CAL_REQ_RX_STAMP: Field = 2..10;
    pub const CAL_RPL_TX_STAMP: Field = 10..18;
}

impl<T: AsRef<[u8]>> TdmaPacket<T> {
    pub const fn new_unchecked(buffer: T) -> TdmaPacket<T> {
        TdmaPacket { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<TdmaPacket<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor of the frame type indicated by the id field
    /// will panic.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < 2 {
            return Err(Error);
        }
        let need = match self.frame_id() {
            TdmaFrameId::Sync => field::SYNC_CYCLE_START.end,
            TdmaFrameId::CalRequest => field::CAL_TX_STAMP.end,
            TdmaFrameId::CalReply => field::CAL_RPL_TX_STAMP.end,
            TdmaFrameId::Unknown(_) => 2,
        };
        if len < need {
            Err(Error)
        } else {
            Ok(())
        }
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the frame id field.
    #[inline]
    pub fn frame_id(&self) -> TdmaFrameId {
        TdmaFrameId::from(self.buffer.as_ref()[field::FRAME_ID])
    }

    /// Return the version field.
    #[inline]
    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[field::VERSION]
    }

    /// Return the cycle start stamp of a sync frame, in nanoseconds.
    #[inline]
    pub fn cycle_start(&self) -> u64 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u64(&data[field::SYNC_CYCLE_START])
    }

    /// Return the transmission stamp of a calibration request.
    #[inline]
    pub fn cal_tx_stamp(&self) -> u64 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u64(&data[field::CAL_TX_STAMP])
    }

    /// Return the request-reception stamp of a calibration reply.
    #[inline]
    pub fn cal_request_rx_stamp(&self) -> u64 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u64(&data[field::CAL_REQ_RX_STAMP])
    }

    /// Return the reply-transmission stamp of a calibration reply.
    #[inline]
    pub fn cal_reply_tx_stamp(&self) -> u64 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u64(&data[field::CAL_RPL_TX_STAMP])
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> TdmaPacket<T> {
    #[inline]
    pub fn set_frame_id(&mut self, value: TdmaFrameId) {
        self.buffer.as_mut()[field::FRAME_ID] = value.into()
    }

    #[inline]
    pub fn set_version(&mut self, value: u8) {
        self.buffer.as_mut()[field::VERSION] = value
    }

    #[inline]
    pub fn set_cycle_start(&mut self, value: u64) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u64(&mut data[field::SYNC_CYCLE_START], value)
    }

    #[inline]
    pub fn set_cal_tx_stamp(&mut self, value: u64) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u64(&mut data[field::CAL_TX_STAMP], value)
    }

    #[inline]
    pub fn set_cal_request_rx_stamp(&mut self, value: u64) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u64(&mut data[field::CAL_REQ_RX_STAMP], value)
    }

    #[inline]
    pub fn set_cal_reply_tx_stamp(&mut self, value: u64) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u64(&mut data[field::CAL_RPL_TX_STAMP], value)
    }
}

/// A high-level representation of a TDMA control frame.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TdmaRepr {
    /// Cycle-start announcement, broadcast by the acting master.
    Sync { cycle_start_ns: u64 },
    /// Clock calibration request from a slave.
    CalRequest { tx_stamp_ns: u64 },
    /// Master's answer to a calibration request.
    CalReply {
        request_rx_ns: u64,
        reply_tx_ns: u64,
    },
}

impl TdmaRepr {
    /// Parse a TDMA control frame and return a high-level representation.
    pub fn parse<T: AsRef<[u8]>>(packet: &TdmaPacket<T>) -> Result<TdmaRepr> {
        packet.check_len()?;
        if packet.version() != TDMA_VERSION {
            return Err(Error);
        }
        match packet.frame_id() {
            TdmaFrameId::Sync => Ok(TdmaRepr::Sync {
                cycle_start_ns: packet.cycle_start(),
            }),
            TdmaFrameId::CalRequest => Ok(TdmaRepr::CalRequest {
                tx_stamp_ns: packet.cal_tx_stamp(),
            }),
            TdmaFrameId::CalReply => Ok(TdmaRepr::CalReply {
                request_rx_ns: packet.cal_request_rx_stamp(),
                reply_tx_ns: packet.cal_reply_tx_stamp(),
            }),
            TdmaFrameId::Unknown(_) => Err(Error),
        }
    }

    /// Return the length of a frame that will be emitted from this
    /// high-level representation, without the discipline header.
    pub const fn buffer_len(&self) -> usize {
        match self {
            TdmaRepr::Sync { .. } => field::SYNC_CYCLE_START.end,
            TdmaRepr::CalRequest { .. } => field::CAL_TX_STAMP.end,
            TdmaRepr::CalReply { .. } => field::CAL_RPL_TX_STAMP.end,
        }
    }

    /// Emit a high-level representation into a TDMA control frame.
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut TdmaPacket<T>) {
        packet.set_version(TDMA_VERSION);
        match *self {
            TdmaRepr::Sync { cycle_start_ns } => {
                packet.set_frame_id(TdmaFrameId::Sync);
                packet.set_cycle_start(cycle_start_ns);
            }
            TdmaRepr::CalRequest { tx_stamp_ns } => {
                packet.set_frame_id(TdmaFrameId::CalRequest);
                packet.set_cal_tx_stamp(tx_stamp_ns);
            }
            TdmaRepr::CalReply {
                request_rx_ns,
                reply_tx_ns,
            } => {
                packet.set_frame_id(TdmaFrameId::CalReply);
                packet.set_cal_request_rx_stamp(request_rx_ns);
                packet.set_cal_reply_tx_stamp(reply_tx_ns);
            }
        }
    }
}

impl fmt::Display for TdmaRepr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TdmaRepr::Sync { cycle_start_ns } => write!(f, "TDMA sync cycle_start={cycle_start_ns}"),
            TdmaRepr::CalRequest { tx_stamp_ns } => write!(f, "TDMA cal-req tx={tx_stamp_ns}"),
            TdmaRepr::CalReply { .. } => write!(f, "TDMA cal-rpl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_roundtrip() {
        let repr = TdmaRepr::Sync {
            cycle_start_ns: 0x0102_0304_0506_0708,
        };
        let mut bytes = vec![0u8; repr.buffer_len()];
        repr.emit(&mut TdmaPacket::new_unchecked(&mut bytes[..]));

        // Wire layout per the protocol: id, version, BE stamp.
        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[1], TDMA_VERSION);
        assert_eq!(
            &bytes[2..10],
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );

        let packet = TdmaPacket::new_checked(&bytes[..]).unwrap();
        assert_eq!(TdmaRepr::parse(&packet).unwrap(), repr);
    }

    #[test]
    fn cal_reply_roundtrip() {
        let repr = TdmaRepr::CalReply {
            request_rx_ns: 100,
            reply_tx_ns: 250,
        };
        let mut bytes = vec![0u8; repr.buffer_len()];
        repr.emit(&mut TdmaPacket::new_unchecked(&mut bytes[..]));
        let packet = TdmaPacket::new_checked(&bytes[..]).unwrap();
        assert_eq!(TdmaRepr::parse(&packet).unwrap(), repr);
    }

    #[test]
    fn version_mismatch_rejected() {
        let repr = TdmaRepr::Sync { cycle_start_ns: 1 };
        let mut bytes = vec![0u8; repr.buffer_len()];
        repr.emit(&mut TdmaPacket::new_unchecked(&mut bytes[..]));
        bytes[1] = 1;
        let packet = TdmaPacket::new_unchecked(&bytes[..]);
        assert!(TdmaRepr::parse(&packet).is_err());
    }

    #[test]
    fn discipline_header() {
        let mut bytes = [0u8; 4];
        let mut frame = Frame::new_unchecked(&mut bytes[..]);
        frame.set_discipline(Discipline::Tdma);
        let frame = Frame::new_checked(&bytes[..]).unwrap();
        assert_eq!(frame.discipline(), Discipline::Tdma);
        assert_eq!(frame.payload().len(), 2);
    }
}
