//! The validated configuration record the core consumes (§6), plus a small
//! INI-style loader used by `main.rs` to build one from `-c/--config`.
//!
//! Parsing/validating a configuration file is explicitly out of scope for the
//! core (see SPEC_FULL.md §1, §4.11): [`load_file`] is a convenience for the
//! binary entry point, not a tested contract of this crate.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use thiserror::Error;

/// Default DHCP server identifier used when `server_on_link` is false and no
/// `server_ip` is configured.
pub const DEFAULT_SERVER_IP: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

/// Default DHCP lease lifetime, in seconds (one week).
pub const DEFAULT_LEASE_LIFETIME: u32 = 604_800;

/// Default DHCP lease renewal time, in seconds (ten minutes).
pub const DEFAULT_LEASE_RENEWAL: u32 = 600;

/// Default period between unsolicited Router Advertisements, in seconds.
pub const DEFAULT_RA_PERIOD: u32 = 300;

/// `[general]` section.
#[derive(Debug, Clone)]
pub struct GeneralConfig {
    /// Directory of binding files, one file per tap.
    pub datapath: String,
    pub pidfile: String,
    pub logdir: String,
    pub user: String,
}

/// `[dhcp]` section.
#[derive(Debug, Clone)]
pub struct DhcpConfig {
    pub enable_dhcp: bool,
    pub lease_lifetime: u32,
    pub lease_renewal: u32,
    pub server_ip: Ipv4Addr,
    pub server_on_link: bool,
    pub dhcp_queue: u16,
    pub nameservers: Vec<Ipv4Addr>,
    pub domain: Option<String>,
}

/// `[ipv6]` section.
#[derive(Debug, Clone)]
pub struct Ipv6Config {
    pub enable_ipv6: bool,
    pub enable_dhcpv6: bool,
    pub ra_period: u32,
    pub rs_queue: u16,
    pub ns_queue: u16,
    pub dhcpv6_queue: Option<u16>,
    pub nameservers: Vec<Ipv6Addr>,
    pub domains: Vec<String>,
}

impl Ipv6Config {
    /// The queue number the DHCPv6 responder should actually bind to: the
    /// explicit `dhcpv6_queue` if set, otherwise `dhcp_queue` under `[ipv6]`.
    pub fn effective_dhcpv6_queue(&self, fallback_dhcp_queue: u16) -> u16 {
        self.dhcpv6_queue.unwrap_or(fallback_dhcp_queue)
    }
}

/// The full validated configuration record.
#[derive(Debug, Clone)]
pub struct Config {
    pub general: GeneralConfig,
    pub dhcp: DhcpConfig,
    pub ipv6: Ipv6Config,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("missing required key [{0}] {1}")]
    MissingKey(String, String),
    #[error("invalid value for [{0}] {1}: {2}")]
    InvalidValue(String, String, String),
}

/// A minimal `[section]` / `key = value` reader. Unknown sections and keys
/// are ignored; this intentionally does not validate the way a real
/// configuration loader would (see module docs).
fn parse_ini(text: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current = String::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            current = line[1..line.len() - 1].trim().to_string();
            sections.entry(current.clone()).or_default();
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    sections
}

fn get<'a>(
    sections: &'a HashMap<String, HashMap<String, String>>,
    section: &str,
    key: &str,
) -> Option<&'a str> {
    sections.get(section)?.get(key).map(|s| s.as_str())
}

fn get_required(
    sections: &HashMap<String, HashMap<String, String>>,
    section: &str,
    key: &str,
) -> Result<String, ConfigError> {
    get(sections, section, key)
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::MissingKey(section.to_string(), key.to_string()))
}

fn get_bool(
    sections: &HashMap<String, HashMap<String, String>>,
    section: &str,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(sections, section, key) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::InvalidValue(
                section.to_string(),
                key.to_string(),
                other.to_string(),
            )),
        },
    }
}

fn get_u32(
    sections: &HashMap<String, HashMap<String, String>>,
    section: &str,
    key: &str,
    default: u32,
) -> Result<u32, ConfigError> {
    match get(sections, section, key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| {
            ConfigError::InvalidValue(section.to_string(), key.to_string(), v.to_string())
        }),
    }
}

fn get_u16(
    sections: &HashMap<String, HashMap<String, String>>,
    section: &str,
    key: &str,
) -> Result<u16, ConfigError> {
    let raw = get_required(sections, section, key)?;
    raw.parse()
        .map_err(|_| ConfigError::InvalidValue(section.to_string(), key.to_string(), raw))
}

fn get_opt_u16(
    sections: &HashMap<String, HashMap<String, String>>,
    section: &str,
    key: &str,
) -> Result<Option<u16>, ConfigError> {
    match get(sections, section, key) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(section.to_string(), key.to_string(), v.to_string())),
    }
}

fn get_ip4_list(
    sections: &HashMap<String, HashMap<String, String>>,
    section: &str,
    key: &str,
) -> Vec<Ipv4Addr> {
    get(sections, section, key)
        .map(|v| v.split(',').filter_map(|s| s.trim().parse().ok()).collect())
        .unwrap_or_default()
}

fn get_ip6_list(
    sections: &HashMap<String, HashMap<String, String>>,
    section: &str,
    key: &str,
) -> Vec<Ipv6Addr> {
    get(sections, section, key)
        .map(|v| v.split(',').filter_map(|s| s.trim().parse().ok()).collect())
        .unwrap_or_default()
}

fn get_str_list(
    sections: &HashMap<String, HashMap<String, String>>,
    section: &str,
    key: &str,
) -> Vec<String> {
    get(sections, section, key)
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// Load a `Config` record from an INI-style file at `path`.
pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
    let sections = parse_ini(&text);

    let general = GeneralConfig {
        datapath: get_required(&sections, "general", "datapath")?,
        pidfile: get_required(&sections, "general", "pidfile")?,
        logdir: get_required(&sections, "general", "logdir")?,
        user: get_required(&sections, "general", "user")?,
    };

    let dhcp = DhcpConfig {
        enable_dhcp: get_bool(&sections, "dhcp", "enable_dhcp", true)?,
        lease_lifetime: get_u32(&sections, "dhcp", "lease_lifetime", DEFAULT_LEASE_LIFETIME)?,
        lease_renewal: get_u32(&sections, "dhcp", "lease_renewal", DEFAULT_LEASE_RENEWAL)?,
        server_ip: get(&sections, "dhcp", "server_ip")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| {
                ConfigError::InvalidValue("dhcp".into(), "server_ip".into(), "not an IPv4 address".into())
            })?
            .unwrap_or(DEFAULT_SERVER_IP),
        server_on_link: get_bool(&sections, "dhcp", "server_on_link", false)?,
        dhcp_queue: get_u16(&sections, "dhcp", "dhcp_queue")?,
        nameservers: get_ip4_list(&sections, "dhcp", "nameservers"),
        domain: get(&sections, "dhcp", "domain").map(|s| s.to_string()),
    };

    let ipv6 = Ipv6Config {
        enable_ipv6: get_bool(&sections, "ipv6", "enable_ipv6", true)?,
        enable_dhcpv6: get_bool(&sections, "ipv6", "enable_dhcpv6", false)?,
        ra_period: get_u32(&sections, "ipv6", "ra_period", DEFAULT_RA_PERIOD)?,
        rs_queue: get_u16(&sections, "ipv6", "rs_queue")?,
        ns_queue: get_u16(&sections, "ipv6", "ns_queue")?,
        dhcpv6_queue: get_opt_u16(&sections, "ipv6", "dhcpv6_queue")?,
        nameservers: get_ip6_list(&sections, "ipv6", "nameservers"),
        domains: get_str_list(&sections, "ipv6", "domains"),
    };

    Ok(Config { general, dhcp, ipv6 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tapnetd.conf");
        std::fs::write(
            &path,
            r#"
[general]
datapath = /var/lib/tapnetd/bindings
pidfile = /run/tapnetd.pid
logdir = /var/log
user = nobody

[dhcp]
enable_dhcp = true
dhcp_queue = 42
nameservers = 8.8.8.8, 1.1.1.1

[ipv6]
enable_ipv6 = true
enable_dhcpv6 = false
rs_queue = 10
ns_queue = 11
nameservers = 2001:4860:4860::8888
"#,
        )
        .unwrap();

        let cfg = load_file(&path).unwrap();
        assert_eq!(cfg.general.user, "nobody");
        assert_eq!(cfg.dhcp.dhcp_queue, 42);
        assert_eq!(cfg.dhcp.nameservers.len(), 2);
        assert_eq!(cfg.dhcp.server_ip, DEFAULT_SERVER_IP);
        assert_eq!(cfg.ipv6.rs_queue, 10);
        assert!(!cfg.ipv6.enable_dhcpv6);
        assert_eq!(cfg.ipv6.effective_dhcpv6_queue(cfg.dhcp.dhcp_queue), 42);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.conf");
        std::fs::write(&path, "[general]\ndatapath = /tmp\n").unwrap();
        assert!(load_file(&path).is_err());
    }
}
