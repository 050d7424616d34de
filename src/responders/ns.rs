//! Neighbor Solicitation responder (§4.7): answers an NS targeting an
//! address in the guest's subnet, or the host's own link-local address
//! (derived from `indev_mac` -- the address a guest solicits when looking
//! for its default router), with an NA.
//!
//! Unlike the RS responder, the client MAC here is not recoverable from the
//! IPv6 source address: an NS's source address is often the unspecified
//! address (during DAD) or a global address without a fixed EUI-64 relation
//! to the guest's real MAC. The only reliable source is the Source
//! Link-Layer Address option the client attaches, mirroring the original
//! daemon's behaviour.

use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, Icmpv6Message, Icmpv6Packet,
    IpProtocol, Ipv6Address, Ipv6Packet, Ipv6Repr,
};
use tracing::debug;

use crate::binding::Binding;
use crate::eui64::{Mac, make_ll64};
use crate::responders::wire::{find_source_ll_addr, icmpv6_checksum, ndp_opt, push_ll_addr_option};

const ETH_HDR: usize = 14;
const IPV6_HDR: usize = 40;
/// Fixed NS/NA header: type(1) code(1) checksum(2) reserved/flags(4) target(16).
const NA_FIXED_HDR: usize = 24;

/// Process a Neighbor Solicitation, returning the NA frame to transmit, or
/// `None` if the target doesn't belong to this binding or the request can't
/// be attributed to a MAC (§4.7 edge cases).
pub fn handle(raw_ip_packet: &[u8], binding: &Binding, indev_mac: &Mac) -> Option<Vec<u8>> {
    if !binding.has_ipv6() {
        return None;
    }

    let ip_packet = Ipv6Packet::new_checked(raw_ip_packet).ok()?;
    if ip_packet.next_header() != IpProtocol::Icmpv6 {
        return None;
    }
    let icmp_packet = Icmpv6Packet::new_checked(ip_packet.payload()).ok()?;
    if icmp_packet.msg_type() != Icmpv6Message::NeighborSolicit {
        return None;
    }

    let body = icmp_packet.payload();
    if body.len() < NA_FIXED_HDR {
        return None;
    }
    let target: [u8; 16] = body[8..24].try_into().ok()?;
    let target_addr = std::net::Ipv6Addr::from(target);

    let subnet = binding.subnet6?;
    let ifll = make_ll64(indev_mac);
    if target_addr != ifll && !subnet.contains(&target_addr) {
        debug!(tap = %binding.tap, target = %target_addr, "NS: target outside binding, ignoring");
        return None;
    }

    let options = &body[NA_FIXED_HDR..];
    let client_mac = find_source_ll_addr(options)?;
    if !binding.accepts_source_mac(&client_mac) {
        debug!(tap = %binding.tap, "NS: spoofed request, ignoring");
        return None;
    }

    let src_addr = ip_packet.src_addr();
    // Unsolicited/DAD NS packets use the unspecified address as source; a
    // unicast reply is meaningless there; reply to the solicited-node
    // multicast origin via the querying address when present, otherwise
    // fall back to the all-nodes address.
    let dst = if src_addr.is_unspecified() {
        Ipv6Address::from_bytes(&[0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 1])
    } else {
        src_addr
    };

    Some(build_na(indev_mac, &ifll, &std::net::Ipv6Addr::from(dst.octets()), &target_addr, &binding.mac))
}

fn build_na(
    src_mac: &Mac,
    src_ll: &std::net::Ipv6Addr,
    dst: &std::net::Ipv6Addr,
    target: &std::net::Ipv6Addr,
    dst_mac: &Mac,
) -> Vec<u8> {
    let mut icmp_body = Vec::new();
    icmp_body.push(136); // type: Neighbor Advertisement
    icmp_body.push(0); // code
    icmp_body.extend_from_slice(&[0, 0]); // checksum placeholder
    // R=1 (we are a router, matching the RA responder), O=0 (no override
    // request expected since this answers DAD/unicast lookups), S=1
    // (solicited).
    icmp_body.extend_from_slice(&[0xc0, 0, 0, 0]);
    icmp_body.extend_from_slice(&target.octets());
    push_ll_addr_option(&mut icmp_body, ndp_opt::TARGET_LL_ADDR, src_mac);

    let icmp_len = icmp_body.len();
    let total_len = ETH_HDR + IPV6_HDR + icmp_len;
    let mut packet = vec![0u8; total_len];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(*src_mac),
        dst_addr: EthernetAddress(*dst_mac),
        ethertype: EthernetProtocol::Ipv6,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let src = Ipv6Address::from_bytes(&src_ll.octets());
    let dst_addr = Ipv6Address::from_bytes(&dst.octets());
    let ip_repr = Ipv6Repr {
        src_addr: src,
        dst_addr,
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp_len,
        hop_limit: 255,
    };
    let mut ip_packet = Ipv6Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet);

    let icmp_slice = ip_packet.payload_mut();
    icmp_slice.copy_from_slice(&icmp_body);
    let checksum = icmpv6_checksum(&src, &dst_addr, icmp_slice);
    icmp_slice[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnet::Ipv6Net;

    fn test_binding() -> Binding {
        Binding {
            tap: "vnet0".to_string(),
            indev: Some("eth0".to_string()),
            mac: [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc],
            hostname: "vm1.example.org".to_string(),
            ip: None,
            subnet: None,
            gateway: None,
            subnet6: Some("2001:db8::/64".parse::<Ipv6Net>().unwrap()),
            gateway6: None,
            eui64: None,
            macspoof: false,
            mtu: None,
            private: false,
        }
    }

    fn build_ns(target: std::net::Ipv6Addr, src_mac: Option<[u8; 6]>) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(135u8); // NS
        body.push(0);
        body.extend_from_slice(&[0, 0]); // checksum (unchecked by responder)
        body.extend_from_slice(&[0u8; 4]);
        body.extend_from_slice(&target.octets());
        if let Some(mac) = src_mac {
            push_ll_addr_option(&mut body, ndp_opt::SOURCE_LL_ADDR, &mac);
        }

        let mut pkt = vec![0u8; IPV6_HDR + body.len()];
        let src = std::net::Ipv6Addr::UNSPECIFIED;
        let ip_repr = Ipv6Repr {
            src_addr: Ipv6Address::from_bytes(&src.octets()),
            dst_addr: Ipv6Address::from_bytes(&target.octets()),
            next_header: IpProtocol::Icmpv6,
            payload_len: body.len(),
            hop_limit: 255,
        };
        let mut ip_packet = Ipv6Packet::new_unchecked(&mut pkt[..]);
        ip_repr.emit(&mut ip_packet);
        ip_packet.payload_mut().copy_from_slice(&body);
        pkt
    }

    #[test]
    fn ns_without_source_ll_addr_is_ignored() {
        let binding = test_binding();
        let indev_mac = [0x02, 0, 0, 0, 0, 1];
        let target = make_ll64(&indev_mac);
        let pkt = build_ns(target, None);
        assert!(handle(&pkt, &binding, &indev_mac).is_none());
    }

    #[test]
    fn ns_for_target_outside_subnet_is_ignored() {
        let binding = test_binding();
        let indev_mac = [0x02, 0, 0, 0, 0, 1];
        let target: std::net::Ipv6Addr = "2001:db8:dead::1".parse().unwrap();
        let pkt = build_ns(target, Some(binding.mac));
        assert!(handle(&pkt, &binding, &indev_mac).is_none());
    }

    #[test]
    fn ns_for_link_local_target_with_matching_mac_yields_na() {
        let binding = test_binding();
        let indev_mac = [0x02, 0, 0, 0, 0, 1];
        let target = make_ll64(&indev_mac);
        let pkt = build_ns(target, Some(binding.mac));
        let reply = handle(&pkt, &binding, &indev_mac).expect("should reply");
        assert!(reply.len() > ETH_HDR + IPV6_HDR);
    }

    #[test]
    fn spoofed_source_ll_addr_is_rejected() {
        let binding = test_binding();
        let indev_mac = [0x02, 0, 0, 0, 0, 1];
        let target = make_ll64(&indev_mac);
        let pkt = build_ns(target, Some([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]));
        assert!(handle(&pkt, &binding, &indev_mac).is_none());
    }
}
