//! Router Solicitation responder (§4.6): answers an ICMPv6 RS with an RA
//! carrying Prefix Information and, when configured, RDNSS/MTU options.

use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, Icmpv6Message, Icmpv6Packet,
    IpProtocol, Ipv6Address, Ipv6Packet, Ipv6Repr,
};
use tracing::{debug, info};

use crate::binding::Binding;
use crate::config::Ipv6Config;
use crate::eui64::{Mac, ipv62mac, make_ll64};
use crate::responders::wire::{icmpv6_checksum, push_mtu_option, push_prefix_info_option, push_rdnss_option};

const ETH_HDR: usize = 14;
const IPV6_HDR: usize = 40;

/// Router lifetime advertised in every RA (matches the original daemon's
/// fixed 14400s / 4 hours).
const ROUTER_LIFETIME: u16 = 14400;

/// Process a Router Solicitation already known to belong to `binding`, and
/// return the RA frame to transmit, or `None` if it should be silently
/// dropped (§4.6 edge cases).
pub fn handle(raw_ip_packet: &[u8], binding: &Binding, indev_mac: &Mac, cfg: &Ipv6Config) -> Option<Vec<u8>> {
    if !binding.has_ipv6() {
        debug!(tap = %binding.tap, "RS: binding has no IPv6 configuration, ignoring");
        return None;
    }

    let ip_packet = Ipv6Packet::new_checked(raw_ip_packet).ok()?;
    if ip_packet.next_header() != IpProtocol::Icmpv6 {
        return None;
    }
    let icmp_packet = Icmpv6Packet::new_checked(ip_packet.payload()).ok()?;
    if icmp_packet.msg_type() != Icmpv6Message::RouterSolicit {
        return None;
    }

    let src_addr = ip_packet.src_addr();
    let client_mac = ipv62mac(&std::net::Ipv6Addr::from(src_addr.octets()));
    if !binding.accepts_source_mac(&client_mac) {
        debug!(tap = %binding.tap, "RS: spoofed request, ignoring");
        return None;
    }

    let subnet = binding.subnet6?;

    info!(tap = %binding.tap, "RS: sending RA");
    let ifll = make_ll64(indev_mac);

    let other_config = cfg.enable_dhcpv6;
    Some(build_ra(
        indev_mac,
        &ifll,
        &std::net::Ipv6Addr::from(src_addr.octets()),
        &client_mac,
        subnet,
        binding.gateway6,
        binding.mtu,
        &cfg.nameservers,
        cfg.ra_period,
        other_config,
    ))
}

/// Shared RA builder used both by the unicast RS-triggered response and the
/// periodic broadcast in `ra.rs`. `dst`/`dst_mac` are the unicast requester
/// for an RS reply, or the all-nodes multicast address/MAC for a scheduled
/// broadcast.
#[allow(clippy::too_many_arguments)]
pub fn build_ra(
    src_mac: &Mac,
    src_ll: &std::net::Ipv6Addr,
    dst: &std::net::Ipv6Addr,
    dst_mac: &Mac,
    subnet: ipnet::Ipv6Net,
    gateway6: Option<std::net::Ipv6Addr>,
    mtu: Option<u16>,
    nameservers: &[std::net::Ipv6Addr],
    ra_period: u32,
    other_config: bool,
) -> Vec<u8> {
    let prefix = gateway6.unwrap_or_else(|| subnet.network());

    let mut icmp_body = Vec::new();
    icmp_body.push(134); // type: Router Advertisement
    icmp_body.push(0); // code
    icmp_body.extend_from_slice(&[0, 0]); // checksum placeholder
    icmp_body.push(64); // cur hop limit
    icmp_body.push(if other_config { 0x40 } else { 0x00 }); // O flag only, no M
    icmp_body.extend_from_slice(&ROUTER_LIFETIME.to_be_bytes());
    icmp_body.extend_from_slice(&[0u8; 4]); // reachable time
    icmp_body.extend_from_slice(&[0u8; 4]); // retrans timer

    push_prefix_info_option(&mut icmp_body, &prefix, subnet.prefix_len(), true, gateway6.is_some());
    if !nameservers.is_empty() {
        push_rdnss_option(&mut icmp_body, nameservers, ra_period * 3);
    }
    if let Some(mtu) = mtu {
        push_mtu_option(&mut icmp_body, mtu);
    }

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
