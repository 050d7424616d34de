//! DHCPv4 responder (§4.5): a pure function turning a raw IPv4 DHCP request
//! (no Ethernet header -- NFQUEUE hands back L3 packets) plus its resolved
//! [`Binding`] into a complete L2 reply frame.

use std::net::Ipv4Addr;

use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};
use tracing::{debug, info, warn};

use crate::binding::Binding;
use crate::config::DhcpConfig;
use crate::eui64::{Mac, format_mac};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// Process one DHCPv4 request already known to belong to `binding`. Returns
/// the complete Ethernet frame to transmit, or `None` if nothing should be
/// sent beyond the DROP verdict the caller already issued -- anti-spoofing
/// failure, a malformed packet, DHCPRELEASE, or a binding with no usable
/// IPv4 configuration (§4.5 edge cases).
pub fn handle(raw_ip_packet: &[u8], binding: &Binding, indev_mac: &Mac, cfg: &DhcpConfig) -> Option<Vec<u8>> {
    if !binding.has_ipv4() {
        debug!(tap = %binding.tap, "DHCP: binding has no IPv4 configuration, ignoring");
        return None;
    }

    let ip_packet = Ipv4Packet::new_checked(raw_ip_packet).ok()?;
    if ip_packet.next_header() != IpProtocol::Udp {
        return None;
    }
    let udp_packet = UdpPacket::new_checked(ip_packet.payload()).ok()?;
    if udp_packet.dst_port() != DHCP_SERVER_PORT {
        return None;
    }

    let mut decoder = Decoder::new(udp_packet.payload());
    let request = Message::decode(&mut decoder).ok()?;
    if request.opcode() != Opcode::BootRequest {
        return None;
    }

    let client_mac = chaddr_mac(&request)?;
    if !binding.accepts_source_mac(&client_mac) {
        debug!(tap = %binding.tap, mac = %format_mac(&client_mac), "DHCP: spoofed request, ignoring");
        return None;
    }

    let req_type = match request.opts().get(OptionCode::MessageType) {
        Some(DhcpOption::MessageType(t)) => *t,
        _ => {
            warn!(tap = %binding.tap, "DHCP: request has no message type option");
            return None;
        }
    };

    let dhcp_srv_ip = server_identifier(binding, cfg)?;
    let domain = cfg
        .domain
        .clone()
        .unwrap_or_else(|| binding.domain_from_hostname());

    info!(tap = %binding.tap, ?req_type, "DHCP: request");

    let (resp_type, options, yiaddr) = match req_type {
        MessageType::Discover | MessageType::Request => {
            let requested_addr = match request.opts().get(OptionCode::RequestedIpAddress) {
                Some(DhcpOption::RequestedIpAddress(addr)) => Some(*addr),
                _ => None,
            };
            if req_type == MessageType::Request
                && requested_addr.is_some()
                && requested_addr != binding.ip
            {
                info!(tap = %binding.tap, requested = ?requested_addr, configured = ?binding.ip, "DHCP: sending NAK, requested address mismatch");
                return build_nak(&request, indev_mac, dhcp_srv_ip, &client_mac);
            }

            let assigned = binding.ip?;
            let subnet = binding.subnet?;

            let mut opts = vec![
                DhcpOption::Hostname(binding.hostname.clone()),
                DhcpOption::DomainName(domain),
                DhcpOption::BroadcastAddr(subnet.broadcast()),
                DhcpOption::SubnetMask(subnet.netmask()),
                DhcpOption::Renewal(cfg.lease_renewal),
                DhcpOption::AddressLeaseTime(cfg.lease_lifetime),
            ];
            if let Some(gw) = binding.gateway {
                if !binding.private {
                    opts.push(DhcpOption::Router(vec![gw]));
                }
            }
            if let Some(mtu) = binding.mtu {
                opts.push(DhcpOption::InterfaceMtu(mtu));
            }
            if !cfg.nameservers.is_empty() {
                opts.push(DhcpOption::DomainNameServer(cfg.nameservers.clone()));
            }

            let resp_type = if req_type == MessageType::Discover {
                MessageType::Offer
            } else {
                MessageType::Ack
            };
            (resp_type, opts, Some(assigned))
        }
        MessageType::Inform => {
            let mut opts = vec![DhcpOption::Hostname(binding.hostname.clone()), DhcpOption::DomainName(domain)];
            if !cfg.nameservers.is_empty() {
                opts.push(DhcpOption::DomainNameServer(cfg.nameservers.clone()));
            }
            (MessageType::Ack, opts, None)
        }
        MessageType::Release => {
            info!(tap = %binding.tap, "DHCP: DHCPRELEASE received, nothing to send");
            return None;
        }
        other => {
            debug!(tap = %binding.tap, ?other, "DHCP: unhandled message type");
            return None;
        }
    };

    let mut response = Message::default();
    response.set_opcode(Opcode::BootReply);
    response.set_htype(request.htype());
    response.set_xid(request.xid());
    response.set_flags(request.flags());
    response.set_chaddr(request.chaddr());
    if let Some(addr) = yiaddr {
        response.set_yiaddr(addr);
    }

    let resp_opts = response.opts_mut();
    for opt in options {
        resp_opts.insert(opt);
    }
    resp_opts.insert(DhcpOption::MessageType(resp_type));
    resp_opts.insert(DhcpOption::ServerIdentifier(dhcp_srv_ip));

    let mut dhcp_bytes = Vec::new();
    let mut encoder = Encoder::new(&mut dhcp_bytes);
    response.encode(&mut encoder).ok()?;

    Some(build_frame(indev_mac, &client_mac, dhcp_srv_ip, binding.ip.unwrap_or(Ipv4Addr::BROADCAST), &dhcp_bytes))
}

fn server_identifier(binding: &Binding, cfg: &DhcpConfig) -> Option<Ipv4Addr> {
    if cfg.server_on_link {
        binding.ipv4_addr_on_link()
    } else {
        Some(cfg.server_ip)
    }
}

fn chaddr_mac(msg: &Message) -> Option<Mac> {
    msg.chaddr()[..6].try_into().ok()
}

fn build_nak(request: &Message, indev_mac: &Mac, server_ip: Ipv4Addr, client_mac: &Mac) -> Option<Vec<u8>> {
    let mut response = Message::default();
    response.set_opcode(Opcode::BootReply);
    response.set_htype(request.htype());
    response.set_xid(request.xid());
    response.set_chaddr(request.chaddr());

    let opts = response.opts_mut();
    opts.insert(DhcpOption::MessageType(MessageType::Nak));
    opts.insert(DhcpOption::ServerIdentifier(server_ip));

    let mut dhcp_bytes = Vec::new();
    let mut encoder = Encoder::new(&mut dhcp_bytes);
    response.encode(&mut encoder).ok()?;

    Some(build_frame(indev_mac, client_mac, server_ip, Ipv4Addr::BROADCAST, &dhcp_bytes))
}

/// Assemble the Ethernet/IPv4/UDP/DHCP reply. DHCP replies are always
/// broadcast at L2 in this daemon: the original sends through a raw
/// `AF_PACKET` socket bound to the guest's own tap, so there is exactly one
/// possible receiver regardless of destination MAC.
fn build_frame(src_mac: &Mac, dst_mac: &Mac, server_ip: Ipv4Addr, dst_ip: Ipv4Addr, dhcp_bytes: &[u8]) -> Vec<u8> {
    const ETH_HDR: usize = 14;
    const IP_HDR: usize = 20;
    const UDP_HDR: usize = 8;

    let udp_len = UDP_HDR + dhcp_bytes.len();
    let ip_len = IP_HDR + udp_len;
    let mut packet = vec![0u8; ETH_HDR + ip_len];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(*src_mac),
        dst_addr: EthernetAddress(*dst_mac),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let ip_repr = Ipv4Repr {
        src_addr: Ipv4Address::from_bytes(&server_ip.octets()),
        dst_addr: Ipv4Address::from_bytes(&dst_ip.octets()),
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

    let udp_repr = UdpRepr {
        src_port: DHCP_SERVER_PORT,
        dst_port: DHCP_CLIENT_PORT,
    };
    let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        dhcp_bytes.len(),
        |buf| buf.copy_from_slice(dhcp_bytes),
        &ChecksumCapabilities::default(),
    );

    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnet::Ipv4Net;

    fn test_config() -> DhcpConfig {
        DhcpConfig {
            enable_dhcp: true,
            lease_lifetime: 3600,
            lease_renewal: 600,
            server_ip: Ipv4Addr::new(1, 2, 3, 4),
            server_on_link: false,
            dhcp_queue: 42,
            nameservers: vec![],
            domain: None,
        }
    }

    fn test_binding() -> Binding {
        Binding {
            tap: "vnet0".to_string(),
            indev: Some("eth0".to_string()),
            mac: [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc],
            hostname: "vm1.example.org".to_string(),
            ip: Some(Ipv4Addr::new(10, 0, 0, 7)),
            subnet: Some("10.0.0.0/24".parse::<Ipv4Net>().unwrap()),
            gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
            subnet6: None,
            gateway6: None,
            eui64: None,
            macspoof: false,
            mtu: None,
            private: false,
        }
    }

    fn encode_discover(mac: &Mac) -> Vec<u8> {
        let mut msg = Message::default();
        msg.set_opcode(Opcode::BootRequest);
        msg.set_chaddr(mac);
        msg.opts_mut().insert(DhcpOption::MessageType(MessageType::Discover));
        let mut bytes = Vec::new();
        let mut enc = Encoder::new(&mut bytes);
        msg.encode(&mut enc).unwrap();
        bytes
    }

    #[test]
    fn spoofed_mac_is_rejected() {
        let binding = test_binding();
        let cfg = test_config();
        let bad_mac = [0, 0, 0, 0, 0, 0];
        let dhcp_bytes = encode_discover(&bad_mac);
        let ip_packet = wrap_in_udp_ip(&dhcp_bytes);
        assert!(handle(&ip_packet, &binding, &binding.mac, &cfg).is_none());
    }

    fn wrap_in_udp_ip(dhcp_bytes: &[u8]) -> Vec<u8> {
        const IP_HDR: usize = 20;
        const UDP_HDR: usize = 8;
        let udp_len = UDP_HDR + dhcp_bytes.len();
        let mut packet = vec![0u8; IP_HDR + udp_len];
        let ip_repr = Ipv4Repr {
            src_addr: Ipv4Address::UNSPECIFIED,
            dst_addr: Ipv4Address::BROADCAST,
            next_header: IpProtocol::Udp,
            payload_len: udp_len,
            hop_limit: 64,
        };
        let mut ip_packet = Ipv4Packet::new_unchecked(&mut packet[..]);
        ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());
        let udp_repr = UdpRepr {
            src_port: DHCP_CLIENT_PORT,
            dst_port: DHCP_SERVER_PORT,
        };
        let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
        udp_repr.emit(
            &mut udp_packet,
            &ip_repr.src_addr.into(),
            &ip_repr.dst_addr.into(),
            dhcp_bytes.len(),
            |buf| buf.copy_from_slice(dhcp_bytes),
            &ChecksumCapabilities::default(),
        );
        packet
    }

    #[test]
    fn discover_from_bound_mac_yields_an_offer() {
        let binding = test_binding();
        let cfg = test_config();
        let dhcp_bytes = encode_discover(&binding.mac);
        let ip_packet = wrap_in_udp_ip(&dhcp_bytes);
        let frame = handle(&ip_packet, &binding, &binding.mac, &cfg).expect("should respond");
        assert!(frame.len() > 14 + 20 + 8);
    }

    #[test]
    fn macspoof_binding_accepts_any_source() {
        let mut binding = test_binding();
        binding.macspoof = true;
        let cfg = test_config();
        let other_mac = [0, 1, 2, 3, 4, 5];
        let dhcp_bytes = encode_discover(&other_mac);
        let ip_packet = wrap_in_udp_ip(&dhcp_bytes);
        assert!(handle(&ip_packet, &binding, &binding.mac, &cfg).is_some());
    }

    #[test]
    fn binding_without_ip_is_ignored() {
        let mut binding = test_binding();
        binding.ip = None;
        let cfg = test_config();
        let dhcp_bytes = encode_discover(&binding.mac);
        let ip_packet = wrap_in_udp_ip(&dhcp_bytes);
        assert!(handle(&ip_packet, &binding, &binding.mac, &cfg).is_none());
    }
}
