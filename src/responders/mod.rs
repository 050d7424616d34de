//! The four protocol responders (§4.5-§4.8): pure functions from a raw
//! inbound IP packet plus the relevant binding/config to an optional raw
//! Ethernet frame to transmit. None of them touch a socket directly --
//! `eventloop.rs` owns dispatch and `transmit.rs` owns the actual send.

pub mod dhcpv4;
pub mod dhcpv6;
pub mod ns;
pub mod rs;
pub mod wire;
