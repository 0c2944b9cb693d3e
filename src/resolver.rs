//! System resolver bias: point name resolution at the local DNS server and
//! add static host entries as a fallback that bypasses DNS entirely.
//!
//! Everything here is advisory. If any of it fails the services stay
//! reachable by address, so the pipeline records a warning and moves on.

use anyhow::Result;
use tracing::info;

use crate::config::ApConfig;
use crate::dnsmasq::LOCAL_DOMAIN;
use crate::store::ConfigStore;
use crate::runner::CommandRunner;

pub const RESOLV_RESOURCE: &str = "etc/resolv.conf";
pub const HOSTS_RESOURCE: &str = "etc/hosts";
const HOSTS_MARKER: &str = "# g2-provision local services";

pub struct DnsResolutionOptimizer<'a> {
    runner: &'a dyn CommandRunner,
    store: &'a ConfigStore,
}

impl<'a> DnsResolutionOptimizer<'a> {
    pub fn new(runner: &'a dyn CommandRunner, store: &'a ConfigStore) -> Self {
        Self { runner, store }
    }

    pub fn optimize(&self, cfg: &ApConfig) -> Result<()> {
        self.store.backup(RESOLV_RESOURCE)?;
        self.store.write(
            RESOLV_RESOURCE,
            &format!("nameserver 127.0.0.1\nsearch {}\n", LOCAL_DOMAIN),
        )?;

        // Keep dhcpcd's resolvconf hook from clobbering the file. Must stay
        // a global option: anything below an `interface` stanza (the static
        // address block writes one) is scoped to that interface only, and the
        // uplink would still rewrite resolv.conf.
        self.store
            .prepend_once("etc/dhcpcd.conf", "# g2-provision resolver", "nohook resolv.conf\n")?;

        let entries: Vec<String> = cfg
            .dhcp
            .dns_overrides
            .iter()
            .map(|(host, addr)| format!("{} {}", addr, host))
            .collect();
        self.store
            .append_once(HOSTS_RESOURCE, HOSTS_MARKER, &format!("{}\n", entries.join("\n")))?;

        // Restart the resolver integration so it observes the new world.
        self.runner
            .run_unchecked("systemctl", &["restart", "NetworkManager"]);

        info!("Resolver biased toward 127.0.0.1 with {} host entries", entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use tempfile::TempDir;

    #[test]
    fn optimize_writes_resolver_and_hosts_entries() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        store.write(HOSTS_RESOURCE, "127.0.0.1 localhost\n").unwrap();
        let runner = ScriptedRunner::new();

        DnsResolutionOptimizer::new(&runner, &store)
            .optimize(&ApConfig::default())
            .unwrap();

        let resolv = store.read(RESOLV_RESOURCE).unwrap().unwrap();
        assert!(resolv.starts_with("nameserver 127.0.0.1"));

        let hosts = store.read(HOSTS_RESOURCE).unwrap().unwrap();
        assert!(hosts.contains("192.168.4.1 g2.local"));
        assert!(hosts.contains("192.168.4.1 g2tablet.local"));
    }

    #[test]
    fn dhcpcd_hook_suppression_stays_global() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        // The static address step writes an interface stanza first; options
        // placed after it would be scoped to wlan0 only.
        store
            .write(
                "etc/dhcpcd.conf",
                "interface wlan0\nstatic ip_address=192.168.4.1/24\nnohook wpa_supplicant\n",
            )
            .unwrap();
        let runner = ScriptedRunner::new();

        DnsResolutionOptimizer::new(&runner, &store)
            .optimize(&ApConfig::default())
            .unwrap();

        let dhcpcd = store.read("etc/dhcpcd.conf").unwrap().unwrap();
        let nohook = dhcpcd.find("nohook resolv.conf").unwrap();
        let stanza = dhcpcd.find("interface wlan0").unwrap();
        assert!(nohook < stanza);
    }

    #[test]
    fn reoptimize_does_not_duplicate_host_entries() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let runner = ScriptedRunner::new();
        let optimizer = DnsResolutionOptimizer::new(&runner, &store);

        optimizer.optimize(&ApConfig::default()).unwrap();
        optimizer.optimize(&ApConfig::default()).unwrap();

        let hosts = store.read(HOSTS_RESOURCE).unwrap().unwrap();
        assert_eq!(hosts.matches("g2tablet.local").count(), 1);
    }
}
