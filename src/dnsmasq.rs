//! DHCP/DNS daemon configuration (dnsmasq).

use anyhow::Result;
use tera::Context;
use tracing::info;

use crate::config::ApConfig;
use crate::render::TEMPLATES;
use crate::store::ConfigStore;

pub const RESOURCE: &str = "etc/dnsmasq.conf";
/// Domain the AP answers for; aliases under it resolve to the AP address.
pub const LOCAL_DOMAIN: &str = "g2.local";

pub struct DhcpDnsConfigurator<'a> {
    store: &'a ConfigStore,
}

impl<'a> DhcpDnsConfigurator<'a> {
    pub fn new(store: &'a ConfigStore) -> Self {
        Self { store }
    }

    /// Render the dnsmasq configuration text. Binds strictly to the AP
    /// interface; listening on all interfaces would capture the uplink.
    pub fn render(cfg: &ApConfig) -> Result<String> {
        cfg.dhcp.validate(&cfg.address)?;

        let mut ctx = Context::new();
        ctx.insert("interface", &cfg.interface);
        ctx.insert("uplink", &cfg.uplink);
        ctx.insert("domain", LOCAL_DOMAIN);
        ctx.insert("range_start", &cfg.dhcp.range_start);
        ctx.insert("range_end", &cfg.dhcp.range_end);
        ctx.insert("netmask", &cfg.address.netmask());
        ctx.insert("lease_time", &cfg.dhcp.lease_time);
        ctx.insert("gateway", &cfg.address.address);
        ctx.insert("overrides", &cfg.dhcp.dns_overrides);

        Ok(TEMPLATES.render("dnsmasq.conf", &ctx)?)
    }

    /// Validate the lease plan, back up any prior configuration, then install
    /// the rendered text. The supervisor runs `dnsmasq --test` before start.
    pub fn install(&self, cfg: &ApConfig) -> Result<()> {
        let rendered = Self::render(cfg)?;
        if let Some(backup) = self.store.backup(RESOURCE)? {
            info!("Backed up prior dnsmasq config to {}", backup.display());
        }
        self.store.write(RESOURCE, &rendered)?;
        info!("Installed dnsmasq configuration for {}", cfg.interface);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    #[test]
    fn rendered_config_binds_only_the_ap_interface() {
        let rendered = DhcpDnsConfigurator::render(&ApConfig::default()).unwrap();
        assert!(rendered.contains("interface=wlan0"));
        assert!(rendered.contains("bind-interfaces"));
        assert!(rendered.contains("except-interface=wlan1"));
        assert!(!rendered.contains("listen-address=0.0.0.0"));
    }

    #[test]
    fn rendered_config_contains_range_and_overrides() {
        let rendered = DhcpDnsConfigurator::render(&ApConfig::default()).unwrap();
        assert!(rendered.contains("dhcp-range=192.168.4.2,192.168.4.20,255.255.255.0,24h"));
        assert!(rendered.contains("dhcp-authoritative"));
        assert!(rendered.contains("address=/g2.local/192.168.4.1"));
        assert!(rendered.contains("address=/g2tablet.local/192.168.4.1"));
    }

    #[test]
    fn invalid_lease_plan_is_rejected_before_write() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let mut cfg = ApConfig::default();
        cfg.dhcp.range_end = Ipv4Addr::new(192, 168, 5, 20);

        assert!(DhcpDnsConfigurator::new(&store).install(&cfg).is_err());
        assert!(!store.exists(RESOURCE));
    }

    #[test]
    fn install_backs_up_prior_config() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        store.write(RESOURCE, "previous config\n").unwrap();

        DhcpDnsConfigurator::new(&store).install(&ApConfig::default()).unwrap();

        let backups: Vec<_> = std::fs::read_dir(dir.path().join("etc"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("dnsmasq.conf.bak-"))
            .collect();
        assert_eq!(backups.len(), 1);
    }
}
