//! RFC 1071 internet checksum arithmetic.

use byteorder::{ByteOrder, NetworkEndian};

use super::{IpProtocol, Ipv4Address};

const fn propagate_carries(word: u32) -> u16 {
    let sum = (word >> 16) + (word & 0xffff);
    ((sum >> 16) as u16) + (sum as u16)
}

/// Compute an RFC 1071 compliant checksum (without the final complement).
pub fn data(mut data: &[u8]) -> u16 {
    let mut accum = 0;

    while data.len() >= 2 {
        accum += NetworkEndian::read_u16(data) as u32;
        data = &data[2..];
    }

    // Add the last remaining odd byte, if any.
    if let Some(&value) = data.first() {
        accum += (value as u32) << 8;
    }

    propagate_carries(accum)
}

/// Combine several RFC 1071 compliant checksums.
pub fn combine(checksums: &[u16]) -> u16 {
    let mut accum: u32 = 0;
    for &word in checksums {
        accum += word as u32;
    }
    propagate_carries(accum)
}

/// Compute an IP pseudo header checksum.
pub fn pseudo_header(
    src_addr: &Ipv4Address,
    dst_addr: &Ipv4Address,
    next_header: IpProtocol,
    length: u32,
) -> u16 {
    let mut proto_len = [0u8; 4];
    proto_len[1] = next_header.into();
    NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

    combine(&[
        data(&src_addr.octets()),
        data(&dst_addr.octets()),
        data(&proto_len[..]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_length_tail_byte() {
        // The trailing byte occupies the high half of the last word.
        assert_eq!(data(&[0x12, 0x34, 0x56]), 0x1234 + 0x5600);
    }

    #[test]
    fn carry_folding() {
        assert_eq!(combine(&[0xffff, 0x0001]), 0x0001);
        assert_eq!(data(&[0xff, 0xff, 0xff, 0xff]), 0xfffe);
    }

    #[test]
    fn pseudo_header_matches_reference() {
        // Hand-computed over 10.0.0.1 -> 10.0.0.2, UDP, length 12.
        let sum = pseudo_header(
            &Ipv4Address::new(10, 0, 0, 1),
            &Ipv4Address::new(10, 0, 0, 2),
            IpProtocol::Udp,
            12,
        );
        let expect = combine(&[0x0a00, 0x0001, 0x0a00, 0x0002, 0x0011, 0x000c]);
        assert_eq!(sum, expect);
    }
}
