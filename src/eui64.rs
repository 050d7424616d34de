//! EUI-48/EUI-64 conversions and modified-EUI-64 link-local derivation.
//!
//! These are the bit-twiddling primitives every responder leans on: turning a
//! guest MAC into the link-local address it would pick under SLAAC, and the
//! inverse (recovering a MAC from a Neighbor Discovery source address).

use std::fmt;
use std::net::Ipv6Addr;

/// An IEEE 802 48-bit hardware address.
pub type Mac = [u8; 6];

/// Errors parsing a textual MAC address.
#[derive(Debug, thiserror::Error)]
pub enum MacParseError {
    #[error("wrong number of octets in MAC address {0:?}")]
    WrongLength(String),
    #[error("invalid hex octet in MAC address {0:?}")]
    InvalidOctet(String),
}

/// Parse a colon-separated MAC address string (`"52:54:00:aa:bb:cc"`).
pub fn parse_mac(s: &str) -> Result<Mac, MacParseError> {
    let mut out = [0u8; 6];
    let mut n = 0;
    for part in s.split(':') {
        if n >= 6 {
            return Err(MacParseError::WrongLength(s.to_string()));
        }
        out[n] = u8::from_str_radix(part, 16).map_err(|_| MacParseError::InvalidOctet(s.to_string()))?;
        n += 1;
    }
    if n != 6 {
        return Err(MacParseError::WrongLength(s.to_string()));
    }
    Ok(out)
}

/// Format a MAC address the conventional colon-separated lowercase way.
pub fn format_mac(mac: &Mac) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// A thin wrapper so bindings/logs can `Display` a MAC without re-allocating
/// at every call site.
pub struct MacDisplay<'a>(pub &'a Mac);

impl fmt::Display for MacDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_mac(self.0))
    }
}

/// Expand an EUI-48 MAC into the 8-byte modified EUI-64 identifier: flip the
/// universal/local bit of the first octet and splice `ff:fe` into the middle.
pub fn mac_to_eui64(mac: &Mac) -> [u8; 8] {
    [
        mac[0] ^ 0x02,
        mac[1],
        mac[2],
        0xff,
        0xfe,
        mac[3],
        mac[4],
        mac[5],
    ]
}

/// Recover the original EUI-48 MAC from a modified EUI-64 identifier.
///
/// Inverse of [`mac_to_eui64`]: drop the spliced `ff:fe` bytes and flip the
/// U/L bit back.
pub fn eui64_to_mac(eui64: &[u8; 8]) -> Mac {
    [
        eui64[0] ^ 0x02,
        eui64[1],
        eui64[2],
        eui64[5],
        eui64[6],
        eui64[7],
    ]
}

/// Compute the modified-EUI-64 link-local address (`fe80::/64` + EUI-64(mac))
/// for a given MAC address.
pub fn make_ll64(mac: &Mac) -> Ipv6Addr {
    let eui64 = mac_to_eui64(mac);
    let mut segments = [0u16; 8];
    segments[0] = 0xfe80;
    for i in 0..4 {
        segments[4 + i] = u16::from_be_bytes([eui64[2 * i], eui64[2 * i + 1]]);
    }
    Ipv6Addr::new(
        segments[0], segments[1], segments[2], segments[3], segments[4], segments[5],
        segments[6], segments[7],
    )
}

/// Recover the MAC address embedded in a modified-EUI-64 IPv6 address, as
/// used to identify the sender of a Router Solicitation (whose source
/// address has no separate link-layer-address option).
pub fn ipv62mac(addr: &Ipv6Addr) -> Mac {
    let octets = addr.octets();
    let eui64: [u8; 8] = octets[8..16].try_into().expect("slice is 8 bytes");
    eui64_to_mac(&eui64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_roundtrip_through_text() {
        let mac = parse_mac("52:54:00:aa:bb:cc").unwrap();
        assert_eq!(mac, [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc]);
        assert_eq!(format_mac(&mac), "52:54:00:aa:bb:cc");
    }

    #[test]
    fn mac_parse_rejects_bad_length() {
        assert!(parse_mac("52:54:00").is_err());
        assert!(parse_mac("52:54:00:aa:bb:cc:dd").is_err());
    }

    #[test]
    fn eui64_roundtrip_is_injective() {
        let macs = [
            [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc],
            [0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            [0xfe, 0xff, 0xff, 0xff, 0xff, 0xff],
        ];
        for mac in macs {
            let eui64 = mac_to_eui64(&mac);
            assert_eq!(eui64[3], 0xff);
            assert_eq!(eui64[4], 0xfe);
            assert_eq!(eui64_to_mac(&eui64), mac);
        }
    }

    #[test]
    fn ipv62mac_inverts_make_ll64() {
        let mac = [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc];
        let ll = make_ll64(&mac);
        assert!(ll.segments()[0] == 0xfe80);
        assert_eq!(ipv62mac(&ll), mac);
    }

    #[test]
    fn make_ll64_matches_manual_construction() {
        // 52:54:00:aa:bb:cc -> flip U/L bit of first octet (0x52 ^ 0x02 = 0x50),
        // splice ff:fe after the third octet.
        let mac = [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc];
        let ll = make_ll64(&mac);
        assert_eq!(ll, Ipv6Addr::new(0xfe80, 0, 0, 0, 0x5054, 0x00ff, 0xfeaa, 0xbbcc));
    }
}
