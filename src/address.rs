//! Static address assignment and persistence.
//!
//! The runtime assignment uses `ip`; persistence is written twice because the
//! target image does not guarantee which boot-time network stack is active:
//! an ifupdown stanza (primary) and a dhcpcd block (fallback).

use anyhow::Result;
use tracing::{info, warn};

use crate::config::StaticAddressPlan;
use crate::error::ProvisionError;
use crate::runner::CommandRunner;
use crate::store::ConfigStore;

pub const IFUPDOWN_RESOURCE: &str = "etc/network/interfaces.d/g2-wlan-ap";
pub const DHCPCD_RESOURCE: &str = "etc/dhcpcd.conf";
const DHCPCD_MARKER: &str = "# g2-provision static AP address";

pub struct StaticAddressConfigurator<'a> {
    runner: &'a dyn CommandRunner,
    store: &'a ConfigStore,
}

impl<'a> StaticAddressConfigurator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, store: &'a ConfigStore) -> Self {
        Self { runner, store }
    }

    /// Flush, bring up, assign, persist, tune, then verify the address is
    /// actually present. Gatewayless by design: the AP routes nowhere.
    pub fn apply(&self, interface: &str, plan: &StaticAddressPlan) -> Result<()> {
        self.runner
            .run_unchecked("ip", &["addr", "flush", "dev", interface]);
        self.runner
            .run_checked("ip", &["link", "set", interface, "up"])?;

        // "File exists" after a re-run is fine; the verify step below is the
        // real post-condition.
        let cidr = plan.cidr();
        self.runner
            .run_unchecked("ip", &["addr", "add", &cidr, "dev", interface]);

        self.persist(interface, plan)?;
        self.tune(interface);

        let shown = self
            .runner
            .run_checked("ip", &["-4", "addr", "show", interface])
            .unwrap_or_default();
        if !shown.contains(&plan.address.to_string()) {
            return Err(ProvisionError::AddressAssignmentFailed {
                interface: interface.to_string(),
                detail: format!("{} not present after assignment", cidr),
            }
            .into());
        }

        info!("Assigned {} to {}", cidr, interface);
        Ok(())
    }

    fn persist(&self, interface: &str, plan: &StaticAddressPlan) -> Result<()> {
        let stanza = format!(
            "# Written by g2-provision.\n\
             auto {if_name}\n\
             allow-hotplug {if_name}\n\
             iface {if_name} inet static\n\
             \x20   address {address}\n\
             \x20   netmask {netmask}\n",
            if_name = interface,
            address = plan.address,
            netmask = plan.netmask()
        );
        self.store.write(IFUPDOWN_RESOURCE, &stanza)?;

        let block = format!(
            "interface {if_name}\n\
             static ip_address={cidr}\n\
             nohook wpa_supplicant\n",
            if_name = interface,
            cidr = plan.cidr()
        );
        self.store.append_once(DHCPCD_RESOURCE, DHCPCD_MARKER, &block)?;
        Ok(())
    }

    /// Kernel tuning: IPv6 off on the AP interface (IPv6 AP service is out of
    /// scope) and larger TCP buffers for the camera stream. All best-effort.
    fn tune(&self, interface: &str) {
        let ipv6_off = format!("net.ipv6.conf.{}.disable_ipv6=1", interface);
        for setting in [
            ipv6_off.as_str(),
            "net.core.rmem_max=2097152",
            "net.core.wmem_max=2097152",
        ] {
            if self
                .runner
                .run("sysctl", &["-w", setting])
                .map(|out| !out.success)
                .unwrap_or(true)
            {
                warn!("sysctl tuning failed for {}", setting);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, ScriptedRunner) {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        runner.respond(
            "ip -4 addr show wlan0",
            true,
            "inet 192.168.4.1/24 brd 192.168.4.255 scope global wlan0",
        );
        (dir, runner)
    }

    #[test]
    fn apply_assigns_and_persists_twice() {
        let (dir, runner) = fixture();
        let store = ConfigStore::new(dir.path());
        let plan = StaticAddressPlan::default();

        StaticAddressConfigurator::new(&runner, &store)
            .apply("wlan0", &plan)
            .unwrap();

        assert!(runner.called_with("ip addr add 192.168.4.1/24 dev wlan0"));
        let stanza = store.read(IFUPDOWN_RESOURCE).unwrap().unwrap();
        assert!(stanza.contains("address 192.168.4.1"));
        assert!(stanza.contains("netmask 255.255.255.0"));
        let dhcpcd = store.read(DHCPCD_RESOURCE).unwrap().unwrap();
        assert!(dhcpcd.contains("static ip_address=192.168.4.1/24"));
    }

    #[test]
    fn reapply_does_not_duplicate_dhcpcd_block() {
        let (dir, runner) = fixture();
        let store = ConfigStore::new(dir.path());
        let plan = StaticAddressPlan::default();
        let configurator = StaticAddressConfigurator::new(&runner, &store);

        configurator.apply("wlan0", &plan).unwrap();
        configurator.apply("wlan0", &plan).unwrap();

        let dhcpcd = store.read(DHCPCD_RESOURCE).unwrap().unwrap();
        assert_eq!(dhcpcd.matches("static ip_address=192.168.4.1/24").count(), 1);
    }

    #[test]
    fn missing_address_after_assignment_fails() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let runner = ScriptedRunner::new();
        runner.respond("ip -4 addr show wlan0", true, "");

        let err = StaticAddressConfigurator::new(&runner, &store)
            .apply("wlan0", &StaticAddressPlan::default())
            .unwrap_err();
        assert!(err.to_string().contains("wlan0"));
    }
}
