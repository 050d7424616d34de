//! DHCPv6 Information-Request responder (§4.8): the only DHCPv6 message this
//! daemon answers. It never hands out addresses -- only DNS configuration --
//! since every guest address already comes from RS/RA's SLAAC prefix.
//!
//! NFQUEUE delivers a raw IP packet with no Ethernet header, so unlike the
//! other three responders there is no link-layer-address signal to recover a
//! MAC from at all: an Information-Request carries no Client Link-Layer
//! Address option the way a Solicit/Request might, and its IPv6 source
//! address is not derived from the client's MAC the way an RS's is. Binding
//! lookup for this queue therefore happens purely by ifindex, and this
//! responder answers unconditionally once it can parse the request --
//! it never performs the MAC-based anti-spoofing check the other three do.

use dhcproto::v6::{DhcpOption, DhcpOptions, Message, MessageType, OptionCode};
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, IpProtocol, Ipv6Address, Ipv6Packet,
    Ipv6Repr, UdpPacket,
};
use tracing::debug;

use crate::binding::Binding;
use crate::config::Ipv6Config;
use crate::eui64::{Mac, make_ll64};

const ETH_HDR: usize = 14;
const IPV6_HDR: usize = 40;
const UDP_HDR: usize = 8;

const DHCP6_SERVER_PORT: u16 = 547;
const DHCP6_CLIENT_PORT: u16 = 546;

/// Process a DHCPv6 packet, returning the REPLY frame for an
/// Information-Request, or `None` for every other case (§4.8 edge cases).
pub fn handle(raw_ip_packet: &[u8], binding: &Binding, indev_mac: &Mac, cfg: &Ipv6Config) -> Option<Vec<u8>> {
    if !binding.has_ipv6() || !cfg.enable_dhcpv6 {
        return None;
    }

    let ip_packet = Ipv6Packet::new_checked(raw_ip_packet).ok()?;
    if ip_packet.next_header() != IpProtocol::Udp {
        return None;
    }
    let udp_packet = UdpPacket::new_checked(ip_packet.payload()).ok()?;
    if udp_packet.dst_port() != DHCP6_SERVER_PORT {
        return None;
    }

    let mut decoder = Decoder::new(udp_packet.payload());
    let request = Message::decode(&mut decoder).ok()?;

    if request.msg_type() != MessageType::InformationRequest {
        debug!(tap = %binding.tap, msg_type = ?request.msg_type(), "DHCPv6: ignoring non-information-request");
        return None;
    }

    let client_id = match request.opts().get(OptionCode::ClientId)? {
        DhcpOption::ClientId(duid) => duid.clone(),
        _ => return None,
    };

    let mut response = Message::new(MessageType::Reply);
    response.set_xid(request.xid());

    let mut server_duid = Vec::with_capacity(14);
    server_duid.extend_from_slice(&[0x00, 0x01]); // DUID-LLT
    server_duid.extend_from_slice(&[0x00, 0x01]); // Ethernet
    server_duid.extend_from_slice(&duid_llt_time().to_be_bytes());
    server_duid.extend_from_slice(indev_mac);

    response.opts_mut().insert(DhcpOption::ClientId(client_id));
    response.opts_mut().insert(DhcpOption::ServerId(server_duid));

    if !cfg.nameservers.is_empty() {
        response
            .opts_mut()
            .insert(DhcpOption::DomainNameServers(cfg.nameservers.clone()));
    }

    let domains = if !cfg.domains.is_empty() {
        cfg.domains.clone()
    } else {
        vec![binding.domain_from_hostname()]
    };
    if !domains.is_empty() {
        response
            .opts_mut()
            .insert(DhcpOption::DomainSearchList(domains));
    }

    let mut dhcp_bytes = Vec::new();
    let mut encoder = Encoder::new(&mut dhcp_bytes);
    response.encode(&mut encoder).ok()?;

    let src_ll = make_ll64(indev_mac);
    Some(build_frame(indev_mac, &src_ll, &std::net::Ipv6Addr::from(ip_packet.src_addr().octets()), &dhcp_bytes))
}

/// Seconds since midnight (UTC), January 1, 2000 -- the DUID-LLT epoch
/// (RFC 8415 §11.2), truncated to 32 bits the same way every other DUID-LLT
/// implementation does.
fn duid_llt_time() -> u32 {
    const DUID_EPOCH_UNIX: u64 = 946_684_800;
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs().saturating_sub(DUID_EPOCH_UNIX) as u32)
        .unwrap_or(0)
}

fn build_frame(src_mac: &Mac, src_ll: &std::net::Ipv6Addr, dst: &std::net::Ipv6Addr, dhcp_bytes: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HDR + dhcp_bytes.len();
    let total_len = ETH_HDR + IPV6_HDR + udp_len;
    let mut packet = vec![0u8; total_len];

    let eth_repr = smoltcp::wire::EthernetRepr {
        src_addr: EthernetAddress(*src_mac),
        dst_addr: EthernetAddress([0x33, 0x33, 0x00, 0x01, 0x00, 0x02]),
        ethertype: EthernetProtocol::Ipv6,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let src = Ipv6Address::from_bytes(&src_ll.octets());
    let dst_addr = Ipv6Address::from_bytes(&dst.octets());
    let ip_repr = Ipv6Repr {
        src_addr: src,
        dst_addr,
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv6Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet);
    ip_packet.set_traffic_class(192);

    let udp_slice = ip_packet.payload_mut();
    udp_slice[0..2].copy_from_slice(&DHCP6_SERVER_PORT.to_be_bytes());
    udp_slice[2..4].copy_from_slice(&DHCP6_CLIENT_PORT.to_be_bytes());
    udp_slice[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp_slice[6..8].fill(0);
    udp_slice[8..8 + dhcp_bytes.len()].copy_from_slice(dhcp_bytes);

    let checksum = crate::responders::wire::udp6_checksum(&src, &dst_addr, &udp_slice[..udp_len]);
    udp_slice[6..8].copy_from_slice(&checksum.to_be_bytes());

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

    fn test_cfg() -> Ipv6Config {
        Ipv6Config {
            enable_ipv6: true,
            enable_dhcpv6: true,
            ra_period: 300,
            rs_queue: 10,
            ns_queue: 11,
            dhcpv6_queue: Some(12),
            nameservers: vec!["2001:4860:4860::8888".parse().unwrap()],
            domains: vec![],
        }
    }

    fn encode_information_request() -> Vec<u8> {
        let mut msg = Message::new(MessageType::InformationRequest);
        msg.set_xid([1, 2, 3]);
        msg.opts_mut().insert(DhcpOption::ClientId(vec![0, 1, 2, 3]));
        let mut bytes = Vec::new();
        let mut encoder = Encoder::new(&mut bytes);
        msg.encode(&mut encoder).unwrap();
        bytes
    }

    fn wrap_in_udp_ip(dhcp_bytes: &[u8]) -> Vec<u8> {
        let udp_len = UDP_HDR + dhcp_bytes.len();
        let mut pkt = vec![0u8; IPV6_HDR + udp_len];
        let src: std::net::Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: std::net::Ipv6Addr = "ff02::1:2".parse().unwrap();
        let ip_repr = Ipv6Repr {
            src_addr: Ipv6Address::from_bytes(&src.octets()),
            dst_addr: Ipv6Address::from_bytes(&dst.octets()),
            next_header: IpProtocol::Udp,
            payload_len: udp_len,
            hop_limit: 255,
        };
        let mut ip_packet = Ipv6Packet::new_unchecked(&mut pkt[..]);
        ip_repr.emit(&mut ip_packet);
        let udp_slice = ip_packet.payload_mut();
        udp_slice[0..2].copy_from_slice(&DHCP6_CLIENT_PORT.to_be_bytes());
        udp_slice[2..4].copy_from_slice(&DHCP6_SERVER_PORT.to_be_bytes());
        udp_slice[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        udp_slice[8..8 + dhcp_bytes.len()].copy_from_slice(dhcp_bytes);
        pkt
    }

    #[test]
    fn information_request_yields_a_reply_with_dns_servers() {
        let binding = test_binding();
        let cfg = test_cfg();
        let indev_mac = [0x02, 0, 0, 0, 0, 1];
        let pkt = wrap_in_udp_ip(&encode_information_request());
        let reply = handle(&pkt, &binding, &indev_mac, &cfg).expect("should reply");
        assert!(reply.len() > ETH_HDR + IPV6_HDR + UDP_HDR);
    }

    #[test]
    fn disabled_dhcpv6_is_ignored() {
        let binding = test_binding();
        let mut cfg = test_cfg();
        cfg.enable_dhcpv6 = false;
        let indev_mac = [0x02, 0, 0, 0, 0, 1];
        let pkt = wrap_in_udp_ip(&encode_information_request());
        assert!(handle(&pkt, &binding, &indev_mac, &cfg).is_none());
    }

    #[test]
    fn binding_without_ipv6_is_ignored() {
        let mut binding = test_binding();
        binding.subnet6 = None;
        let cfg = test_cfg();
        let indev_mac = [0x02, 0, 0, 0, 0, 1];
        let pkt = wrap_in_udp_ip(&encode_information_request());
        assert!(handle(&pkt, &binding, &indev_mac, &cfg).is_none());
    }
}
