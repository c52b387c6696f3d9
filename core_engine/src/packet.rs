//! Minimal IP header inspection for routing decisions.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// Destination address of a raw IPv4 or IPv6 packet.
///
/// Returns `None` for anything too short to hold the header its version
/// nibble announces, and for non-IP payloads.
pub fn destination(packet: &[u8]) -> Option<IpAddr> {
    let version = packet.first()? >> 4;
    match version {
        4 if packet.len() >= IPV4_MIN_HEADER => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= IPV6_HEADER => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Build a bare IPv4 header (no options, no payload checksum) addressed to
/// `dst`, followed by `payload`. Used by tests and tooling.
///
/// Returns `None` when the packet would not fit the 16-bit total length.
pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Option<Vec<u8>> {
    let total = u16::try_from(IPV4_MIN_HEADER + payload.len()).ok()?;
    let mut packet = Vec::with_capacity(usize::from(total));
    packet.push(0x45);
    packet.push(0);
    packet.extend_from_slice(&total.to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0x40, 0]);
    packet.push(64);
    packet.push(17);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());
    packet.extend_from_slice(payload);
    Some(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_destination() {
        let packet = ipv4_packet(
            Ipv4Addr::new(10, 8, 0, 1),
            Ipv4Addr::new(10, 8, 0, 2),
            b"ping",
        )
        .unwrap();
        assert_eq!(
            destination(&packet),
            Some(IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2)))
        );
    }

    #[test]
    fn test_ipv4_packet_length_limit() {
        let src = Ipv4Addr::new(10, 8, 0, 1);
        let dst = Ipv4Addr::new(10, 8, 0, 2);

        let largest = ipv4_packet(src, dst, &vec![0u8; 65515]).unwrap();
        assert_eq!(largest.len(), 65535);
        assert_eq!(&largest[2..4], &[0xff, 0xff]);

        assert!(ipv4_packet(src, dst, &vec![0u8; 65516]).is_none());
    }

    #[test]
    fn test_ipv6_destination() {
        let dst: Ipv6Addr = "fd00::2".parse().unwrap();
        let mut packet = vec![0u8; IPV6_HEADER];
        packet[0] = 0x60;
        packet[24..40].copy_from_slice(&dst.octets());
        assert_eq!(destination(&packet), Some(IpAddr::V6(dst)));
    }

    #[test]
    fn test_unparsable_payloads() {
        assert_eq!(destination(&[]), None);
        assert_eq!(destination(&[0x45; 10]), None);
        assert_eq!(destination(&[0x60; 39]), None);
        assert_eq!(destination(b"hello world, not an ip packet"), None);
    }
}
