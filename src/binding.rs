//! Binding file parser (§4.1): one `KEY=VALUE` text file per tap, describing
//! everything the responders need to answer requests on behalf of a guest.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use ipnet::{Ipv4Net, Ipv6Net};
use tracing::warn;

use crate::eui64::{Mac, parse_mac};

/// A single guest interface's complete configuration, as described by its
/// binding file. See SPEC_FULL.md §3.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Tap interface name; also the binding file's basename.
    pub tap: String,
    /// Upstream interface name sampled for the host MAC used in replies.
    pub indev: Option<String>,
    pub mac: Mac,
    pub hostname: String,
    pub ip: Option<Ipv4Addr>,
    pub subnet: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
    pub subnet6: Option<Ipv6Net>,
    pub gateway6: Option<Ipv6Addr>,
    /// Informational only; not used to construct any reply.
    pub eui64: Option<Ipv6Addr>,
    pub macspoof: bool,
    pub mtu: Option<u16>,
    pub private: bool,
}

impl Binding {
    /// Whether guest traffic should be answered at all on this tap's IPv4
    /// DHCP queue: absent `ip` means silently ignore every DHCP request.
    pub fn has_ipv4(&self) -> bool {
        self.ip.is_some()
    }

    /// Whether this binding participates in IPv6 Neighbor Discovery / DHCPv6
    /// at all: absent `subnet6` means silently ignore RS/NS/DHCPv6.
    pub fn has_ipv6(&self) -> bool {
        self.subnet6.is_some()
    }

    /// Anti-spoofing check shared by all four responders: a request is
    /// accepted only if it comes from the configured MAC, unless `macspoof`
    /// is set on the binding.
    pub fn accepts_source_mac(&self, source: &Mac) -> bool {
        self.macspoof || source == &self.mac
    }

    /// The on-link IPv4 address to use as a DHCP "server identifier" when
    /// `server_on_link` is enabled: the configured gateway, else the first
    /// usable host address in the subnet.
    pub fn ipv4_addr_on_link(&self) -> Option<Ipv4Addr> {
        if let Some(gw) = self.gateway {
            return Some(gw);
        }
        let net = self.subnet?;
        let mut hosts = net.hosts();
        hosts.next()
    }

    /// DHCP domain name: the leftmost label of `hostname` stripped off, used
    /// when no global `dhcp_domain` is configured.
    pub fn domain_from_hostname(&self) -> String {
        match self.hostname.split_once('.') {
            Some((_, rest)) => rest.to_string(),
            None => self.hostname.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("unable to read binding file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("binding file {0} has no MAC or HOSTNAME, not installing")]
    Incomplete(String),
    #[error("binding file {0} has a malformed MTU value")]
    InvalidMtu(String),
    #[error("binding file {0} has a malformed address: {1}")]
    InvalidAddress(String, String),
}

/// Parse a binding file into a [`Binding`]. Any error (missing file, parse
/// failure, invalid address) is logged and yields `None` -- it never aborts
/// the process (§4.1, §7 error kind 1).
pub fn parse(path: &Path) -> Option<Binding> {
    match try_parse(path) {
        Ok(binding) => Some(binding),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "binding file rejected");
            None
        }
    }
}

fn try_parse(path: &Path) -> Result<Binding, BindingError> {
    let tap = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let text = std::fs::read_to_string(path)
        .map_err(|e| BindingError::Io(path.display().to_string(), e))?;

    let mut fields: HashMap<&str, String> = HashMap::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().to_string();
        // Empty value string means the field is absent (§4.1).
        if value.is_empty() {
            continue;
        }
        fields.insert(key, value);
    }

    let mac = fields
        .get("MAC")
        .and_then(|s| parse_mac(s).ok())
        .ok_or_else(|| BindingError::Incomplete(path.display().to_string()))?;
    let hostname = fields
        .get("HOSTNAME")
        .cloned()
        .ok_or_else(|| BindingError::Incomplete(path.display().to_string()))?;

    let indev = fields.get("INDEV").cloned();

    let ip: Option<Ipv4Addr> = match fields.get("IP") {
        Some(s) => Some(
            s.parse()
                .map_err(|_| BindingError::InvalidAddress(path.display().to_string(), s.clone()))?,
        ),
        None => None,
    };

    let gateway: Option<Ipv4Addr> = match fields.get("GATEWAY") {
        Some(s) => Some(
            s.parse()
                .map_err(|_| BindingError::InvalidAddress(path.display().to_string(), s.clone()))?,
        ),
        None => None,
    };

    let subnet: Option<Ipv4Net> = match fields.get("SUBNET") {
        Some(s) => Some(
            s.parse()
                .map_err(|_| BindingError::InvalidAddress(path.display().to_string(), s.clone()))?,
        ),
        None => None,
    };

    let gateway6: Option<Ipv6Addr> = match fields.get("GATEWAY6") {
        Some(s) => Some(
            s.parse()
                .map_err(|_| BindingError::InvalidAddress(path.display().to_string(), s.clone()))?,
        ),
        None => None,
    };

    let subnet6: Option<Ipv6Net> = match fields.get("SUBNET6") {
        Some(s) => Some(
            s.parse()
                .map_err(|_| BindingError::InvalidAddress(path.display().to_string(), s.clone()))?,
        ),
        None => None,
    };

    let eui64: Option<Ipv6Addr> = match fields.get("EUI64") {
        Some(s) => s.parse().ok(),
        None => None,
    };

    let mtu: Option<u16> = match fields.get("MTU") {
        Some(s) => Some(
            s.parse()
                .map_err(|_| BindingError::InvalidMtu(path.display().to_string()))?,
        ),
        None => None,
    };

    Ok(Binding {
        tap,
        indev,
        mac,
        hostname,
        ip,
        subnet,
        gateway,
        subnet6,
        gateway6,
        eui64,
        macspoof: fields.contains_key("MACSPOOF"),
        mtu,
        private: fields.contains_key("PRIVATE"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_binding(dir: &Path, tap: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(tap);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_a_complete_binding() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_binding(
            dir.path(),
            "vnet0",
            "IP=10.0.0.7\nMAC=52:54:00:aa:bb:cc\nHOSTNAME=vm1.example.org\n\
             INDEV=eth0\nSUBNET=10.0.0.0/24\nGATEWAY=10.0.0.1\nMTU=1400\n",
        );

        let binding = parse(&path).expect("should parse");
        assert_eq!(binding.tap, "vnet0");
        assert_eq!(binding.mac, [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc]);
        assert_eq!(binding.hostname, "vm1.example.org");
        assert_eq!(binding.ip, Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(binding.mtu, Some(1400));
        assert!(!binding.private);
        assert!(!binding.macspoof);
        assert_eq!(binding.domain_from_hostname(), "example.org");
    }

    #[test]
    fn missing_mac_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_binding(dir.path(), "vnet1", "HOSTNAME=vm1.example.org\n");
        assert!(parse(&path).is_none());
    }

    #[test]
    fn malformed_mtu_rejects_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_binding(
            dir.path(),
            "vnet2",
            "MAC=52:54:00:aa:bb:cc\nHOSTNAME=vm1.example.org\nMTU=not-a-number\n",
        );
        assert!(parse(&path).is_none());
    }

    #[test]
    fn empty_value_means_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_binding(
            dir.path(),
            "vnet3",
            "MAC=52:54:00:aa:bb:cc\nHOSTNAME=vm1.example.org\nIP=\n",
        );
        let binding = parse(&path).unwrap();
        assert_eq!(binding.ip, None);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_binding(
            dir.path(),
            "vnet4",
            "MAC=52:54:00:aa:bb:cc\nHOSTNAME=vm1.example.org\nBOGUS=xyz\n",
        );
        assert!(parse(&path).is_some());
    }

    #[test]
    fn macspoof_and_private_are_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_binding(
            dir.path(),
            "vnet5",
            "MAC=52:54:00:aa:bb:cc\nHOSTNAME=vm1.example.org\nMACSPOOF=1\nPRIVATE=1\n",
        );
        let binding = parse(&path).unwrap();
        assert!(binding.macspoof);
        assert!(binding.private);
    }
}
