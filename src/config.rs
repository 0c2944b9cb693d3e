//! Deployment configuration: fixed address/lease/radio plans plus an optional
//! TOML override file for non-default installations.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::ProvisionError;

/// SSID prefix; the MAC suffix is appended at derivation time.
pub const SSID_PREFIX: &str = "G2TabletNetwork-";
/// Passphrase prefix; the SHA-256 digest prefix is appended at derivation time.
pub const PASSPHRASE_PREFIX: &str = "G2";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StaticAddressPlan {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

impl StaticAddressPlan {
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }

    /// Reject a prefix length no IPv4 address can carry. Config overrides are
    /// the only source of out-of-range values; defaults are always valid.
    pub fn validate(&self) -> Result<()> {
        if self.prefix_len > 32 {
            return Err(ProvisionError::InvalidAddressPlan(format!(
                "prefix length /{} exceeds 32",
                self.prefix_len
            ))
            .into());
        }
        Ok(())
    }

    pub fn netmask(&self) -> Ipv4Addr {
        // Oversized prefixes are rejected by `validate`; clamp here so the
        // mask arithmetic can never underflow regardless of call order.
        let prefix = u32::from(self.prefix_len.min(32));
        let bits = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        Ipv4Addr::from(bits)
    }

    /// Whether `ip` lies inside this plan's subnet.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask());
        (u32::from(ip) & mask) == (u32::from(self.address) & mask)
    }
}

impl Default for StaticAddressPlan {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(192, 168, 4, 1),
            prefix_len: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpLeasePlan {
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    /// Lease duration in dnsmasq notation, e.g. "24h".
    pub lease_time: String,
    /// Hostname aliases resolved to the AP address by the local DNS server.
    pub dns_overrides: BTreeMap<String, Ipv4Addr>,
}

impl DhcpLeasePlan {
    /// Reject a plan whose range leaves the AP subnet or includes the gateway
    /// address. Runs before any configuration text is written.
    pub fn validate(&self, subnet: &StaticAddressPlan) -> Result<()> {
        subnet.validate()?;
        let reject = |detail: String| -> Result<()> {
            Err(ProvisionError::InvalidLeasePlan(detail).into())
        };

        if u32::from(self.range_start) > u32::from(self.range_end) {
            return reject(format!(
                "range start {} is after range end {}",
                self.range_start, self.range_end
            ));
        }
        for bound in [self.range_start, self.range_end] {
            if !subnet.contains(bound) {
                return reject(format!("{} is outside subnet {}", bound, subnet.cidr()));
            }
        }
        let gateway = u32::from(subnet.address);
        if (u32::from(self.range_start)..=u32::from(self.range_end)).contains(&gateway) {
            return reject(format!(
                "range {}-{} includes the gateway address {}",
                self.range_start, self.range_end, subnet.address
            ));
        }
        Ok(())
    }
}

impl Default for DhcpLeasePlan {
    fn default() -> Self {
        let ap = Ipv4Addr::new(192, 168, 4, 1);
        let mut dns_overrides = BTreeMap::new();
        dns_overrides.insert("g2.local".to_string(), ap);
        dns_overrides.insert("g2tablet.local".to_string(), ap);
        Self {
            range_start: Ipv4Addr::new(192, 168, 4, 2),
            range_end: Ipv4Addr::new(192, 168, 4, 20),
            lease_time: "24h".to_string(),
            dns_overrides,
        }
    }
}

/// Whole-deployment configuration. Defaults describe the shipped G2 tablet
/// setup; a TOML file can override individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApConfig {
    /// Interface provisioned as the access point.
    pub interface: String,
    /// Uplink interface the AP clients must never reach.
    pub uplink: Option<String>,
    pub address: StaticAddressPlan,
    pub dhcp: DhcpLeasePlan,

    // Radio parameters.
    pub channel: u8,
    pub country: String,
    pub hidden: bool,
    pub beacon_interval: u16,
    pub dtim_period: u8,
    pub max_stations: u16,

    // Local service ports. The API and WebSocket services bind to loopback
    // only and are exposed to AP clients through DNAT.
    pub api_port: u16,
    pub ui_port: u16,
    pub websocket_port: u16,

    /// Directory receiving the durable log and the verification report.
    pub log_dir: PathBuf,
}

impl ApConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        cfg.address.validate()?;
        Ok(cfg)
    }

    /// Hostname aliases served by DNS overrides, in stable order.
    pub fn service_aliases(&self) -> Vec<&str> {
        self.dhcp.dns_overrides.keys().map(String::as_str).collect()
    }

    /// Ports of services that only accept loopback-sourced connections and
    /// therefore need a DNAT rule.
    pub fn loopback_bound_ports(&self) -> Vec<u16> {
        vec![self.api_port, self.websocket_port]
    }
}

impl Default for ApConfig {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            uplink: Some("wlan1".to_string()),
            address: StaticAddressPlan::default(),
            dhcp: DhcpLeasePlan::default(),
            channel: 7,
            country: "IT".to_string(),
            hidden: false,
            beacon_interval: 100,
            dtim_period: 2,
            max_stations: 8,
            api_port: 8000,
            ui_port: 8080,
            websocket_port: 7125,
            log_dir: PathBuf::from("/var/log/g2-provision"),
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let system = PathBuf::from("/etc/g2-provision/config.toml");
    if system.exists() {
        return Ok(system);
    }
    // Per-user fallback for rehearsal runs without root.
    let config_dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config_dir.join("g2-provision").join("config.toml"))
}
