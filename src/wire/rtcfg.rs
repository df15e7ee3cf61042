//! Configuration-distribution framing, at interoperability level.
//!
//! Only the stage-1 announcement is fully decoded: it is the frame a
//! server broadcasts towards a new station and the one the stage-1 handler
//! of this stack must understand. The remaining ids are listed so frames
//! can be classified and counted.

use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Ipv4Address, Result};

enum_with_unknown! {
    /// Configuration frame id.
    pub enum FrameId(u8) {
        Stage1Cfg = 0,
        AnnounceNew = 1,
        AnnounceReply = 2,
        Stage2Cfg = 3,
        Stage2CfgFrag = 4,
        AckCfg = 5,
        Ready = 6,
        Heartbeat = 7,
        DeadStation = 8
    }
}

enum_with_unknown! {
    /// Address family used to identify the addressed station.
    pub enum AddrType(u8) {
        Mac = 0,
        Ip = 1
    }
}

/// Protocol version emitted into every frame.
pub const RTCFG_VERSION: u8 = 2;

/// A read/write wrapper around a configuration frame buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    pub const ID: usize = 0;
    pub const VERSION: usize = 1;
    pub const ADDR_TYPE: usize = 2;
    pub const ADDRS: usize = 3;
}

impl<T: AsRef<[u8]>> Packet<T> {
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure the classification fields are accessible; stage-1 payload
    /// bounds are checked during [`Stage1Repr::parse`].
    pub fn check_len(&self) -> Result<()> {
        if self.buffer.as_ref().len() < field::ADDR_TYPE + 1 {
            Err(Error)
        } else {
            Ok(())
        }
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    #[inline]
    pub fn frame_id(&self) -> FrameId {
        FrameId::from(self.buffer.as_ref()[field::ID])
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[field::VERSION]
    }

    #[inline]
    pub fn addr_type(&self) -> AddrType {
        AddrType::from(self.buffer.as_ref()[field::ADDR_TYPE])
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    #[inline]
    pub fn set_frame_id(&mut self, value: FrameId) {
        self.buffer.as_mut()[field::ID] = value.into()
    }

    #[inline]
    pub fn set_version(&mut self, value: u8) {
        self.buffer.as_mut()[field::VERSION] = value
    }

    #[inline]
    pub fn set_addr_type(&mut self, value: AddrType) {
        self.buffer.as_mut()[field::ADDR_TYPE] = value.into()
    }
}

/// A high-level representation of a stage-1 configuration announcement.
///
/// The address pair is present iff the station is addressed by IP.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Stage1Repr<'a> {
    pub addrs: Option<Stage1Addrs>,
    /// Frames per burst granted to the addressed station.
    pub burstrate: u8,
    pub cfg_data: &'a [u8],
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Stage1Addrs {
    pub client: Ipv4Address,
    pub server: Ipv4Address,
}

impl<'a> Stage1Repr<'a> {
    /// Parse a stage-1 announcement and return a high-level representation.
    pub fn parse<T: AsRef<[u8]> + ?Sized>(packet: &Packet<&'a T>) -> Result<Stage1Repr<'a>> {
        packet.check_len()?;
        if packet.frame_id() != FrameId::Stage1Cfg || packet.version() != RTCFG_VERSION {
            return Err(Error);
        }

        let data = packet.buffer.as_ref();
        let (addrs, mut at) = match packet.addr_type() {
            AddrType::Mac => (None, field::ADDRS),
            AddrType::Ip => {
                if data.len() < field::ADDRS + 8 {
                    return Err(Error);
                }
                let client = Ipv4Address::from(NetworkEndian::read_u32(
                    &data[field::ADDRS..field::ADDRS + 4],
                ));
                let server = Ipv4Address::from(NetworkEndian::read_u32(
                    &data[field::ADDRS + 4..field::ADDRS + 8],
                ));
                (Some(Stage1Addrs { client, server }), field::ADDRS + 8)
            }
            AddrType::Unknown(_) => return Err(Error),
        };

        if data.len() < at + 3 {
            return Err(Error);
        }
        let burstrate = data[at];
        at += 1;
        let cfg_len = NetworkEndian::read_u16(&data[at..at + 2]) as usize;
        at += 2;
        if data.len() < at + cfg_len {
            return Err(Error);
        }

        Ok(Stage1Repr {
            addrs,
            burstrate,
            cfg_data: &data[at..at + cfg_len],
        })
    }

    /// Return the length of a frame that will be emitted from this
    /// high-level representation.
    pub fn buffer_len(&self) -> usize {
        let addrs = if self.addrs.is_some() { 8 } else { 0 };
        field::ADDRS + addrs + 1 + 2 + self.cfg_data.len()
    }

    /// Emit a high-level representation into a configuration frame.
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        packet.set_frame_id(FrameId::Stage1Cfg);
        packet.set_version(RTCFG_VERSION);
        packet.set_addr_type(if self.addrs.is_some() {
            AddrType::Ip
        } else {
            AddrType::Mac
        });

        let data = packet.buffer.as_mut();
        let mut at = field::ADDRS;
        if let Some(addrs) = self.addrs {
            data[at..at + 4].copy_from_slice(&addrs.client.octets());
            data[at + 4..at + 8].copy_from_slice(&addrs.server.octets());
            at += 8;
        }
        data[at] = self.burstrate;
        at += 1;
        NetworkEndian::write_u16(&mut data[at..at + 2], self.cfg_data.len() as u16);
        at += 2;
        data[at..at + self.cfg_data.len()].copy_from_slice(self.cfg_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage1_ip_roundtrip() {
        let repr = Stage1Repr {
            addrs: Some(Stage1Addrs {
                client: Ipv4Address::new(10, 0, 0, 2),
                server: Ipv4Address::new(10, 0, 0, 1),
            }),
            burstrate: 4,
            cfg_data: b"ip route add",
        };
        let mut bytes = vec![0u8; repr.buffer_len()];
        repr.emit(&mut Packet::new_unchecked(&mut bytes[..]));

        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(packet.frame_id(), FrameId::Stage1Cfg);
        assert_eq!(Stage1Repr::parse(&packet).unwrap(), repr);
    }

    #[test]
    fn stage1_mac_roundtrip() {
        let repr = Stage1Repr {
            addrs: None,
            burstrate: 1,
            cfg_data: &[],
        };
        let mut bytes = vec![0u8; repr.buffer_len()];
        repr.emit(&mut Packet::new_unchecked(&mut bytes[..]));

        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(Stage1Repr::parse(&packet).unwrap(), repr);
    }

    #[test]
    fn truncated_cfg_data_rejected() {
        let repr = Stage1Repr {
            addrs: None,
            burstrate: 1,
            cfg_data: b"abcdef",
        };
        let mut bytes = vec![0u8; repr.buffer_len()];
        repr.emit(&mut Packet::new_unchecked(&mut bytes[..]));
        bytes.truncate(repr.buffer_len() - 2);
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert!(Stage1Repr::parse(&packet).is_err());
    }
}
