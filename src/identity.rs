//! Interface identity: discovery of the target interface and its hardware
//! address at pipeline start.

use anyhow::Result;
use std::thread;
use std::time::Duration;

use crate::error::ProvisionError;
use crate::runner::CommandRunner;
use crate::store::ConfigStore;

/// Immutable identity of the provisioned interface, read once per run.
#[derive(Debug, Clone)]
pub struct NetworkIdentity {
    pub interface: String,
    pub hardware_address: String,
}

/// Read the interface identity. sysfs is authoritative; `ip link` is the
/// fallback when sysfs is unavailable (some containerized rehearsal setups).
/// Fails with `IdentityUnavailable` when no well-formed MAC can be found.
pub fn read_identity(
    runner: &dyn CommandRunner,
    store: &ConfigStore,
    interface: &str,
) -> Result<NetworkIdentity> {
    let sysfs = format!("sys/class/net/{}/address", interface);
    let mac = match store.read(&sysfs).ok().flatten() {
        Some(contents) => contents.trim().to_string(),
        None => mac_from_ip_link(runner, interface)?,
    };

    if !is_valid_mac(&mac) {
        return Err(ProvisionError::IdentityUnavailable(interface.to_string()).into());
    }

    Ok(NetworkIdentity {
        interface: interface.to_string(),
        hardware_address: mac,
    })
}

fn mac_from_ip_link(runner: &dyn CommandRunner, interface: &str) -> Result<String> {
    let output = runner
        .run_checked("ip", &["-o", "link", "show", interface])
        .map_err(|_| ProvisionError::IdentityUnavailable(interface.to_string()))?;

    output
        .split_whitespace()
        .skip_while(|tok| *tok != "link/ether")
        .nth(1)
        .map(str::to_string)
        .ok_or_else(|| ProvisionError::IdentityUnavailable(interface.to_string()).into())
}

/// 48-bit colon-hex form, e.g. "b8:27:eb:11:22:33".
pub fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Poll until the interface shows up, with a bounded iteration count. Some
/// USB adapters enumerate a few seconds after first boot.
pub fn wait_for_interface(
    runner: &dyn CommandRunner,
    interface: &str,
    attempts: u32,
    interval: Duration,
) -> bool {
    for attempt in 0..attempts {
        if interface_exists(runner, interface) {
            return true;
        }
        tracing::info!(
            "Waiting for interface {} ({}/{})",
            interface,
            attempt + 1,
            attempts
        );
        thread::sleep(interval);
    }
    false
}

pub fn interface_exists(runner: &dyn CommandRunner, interface: &str) -> bool {
    runner
        .run("ip", &["link", "show", interface])
        .map(|out| out.success)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use tempfile::TempDir;

    #[test]
    fn identity_prefers_sysfs() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        store
            .write("sys/class/net/wlan0/address", "b8:27:eb:11:22:33\n")
            .unwrap();

        let runner = ScriptedRunner::new();
        let identity = read_identity(&runner, &store, "wlan0").unwrap();
        assert_eq!(identity.hardware_address, "b8:27:eb:11:22:33");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn identity_falls_back_to_ip_link() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());

        let runner = ScriptedRunner::new();
        runner.respond(
            "ip -o link show wlan0",
            true,
            "3: wlan0: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN \
             link/ether b8:27:eb:aa:bb:cc brd ff:ff:ff:ff:ff:ff",
        );

        let identity = read_identity(&runner, &store, "wlan0").unwrap();
        assert_eq!(identity.hardware_address, "b8:27:eb:aa:bb:cc");
    }

    #[test]
    fn malformed_mac_is_identity_unavailable() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        store
            .write("sys/class/net/wlan0/address", "not-a-mac\n")
            .unwrap();

        let runner = ScriptedRunner::new();
        let err = read_identity(&runner, &store, "wlan0").unwrap_err();
        assert!(err.to_string().contains("wlan0"));
    }

    #[test]
    fn mac_validation() {
        assert!(is_valid_mac("b8:27:eb:11:22:33"));
        assert!(is_valid_mac("B8:27:EB:AA:BB:CC"));
        assert!(!is_valid_mac("b8:27:eb:11:22"));
        assert!(!is_valid_mac("b827eb112233"));
        assert!(!is_valid_mac("zz:27:eb:11:22:33"));
    }
}
