//! Interface reclamation: transfer ownership of the AP interface from
//! NetworkManager to this pipeline, permanently.

use anyhow::Result;
use tracing::{debug, info};

use crate::runner::CommandRunner;
use crate::store::ConfigStore;

pub const UNMANAGED_DIRECTIVE: &str = "etc/NetworkManager/conf.d/99-g2-unmanaged.conf";

pub struct InterfaceReclaimer<'a> {
    runner: &'a dyn CommandRunner,
    store: &'a ConfigStore,
}

impl<'a> InterfaceReclaimer<'a> {
    pub fn new(runner: &'a dyn CommandRunner, store: &'a ConfigStore) -> Self {
        Self { runner, store }
    }

    /// Stop anything that might reclaim the interface, then persist an
    /// "unmanaged" directive so reboots do not re-attach it. Stopping the
    /// supervisory processes is best-effort (they may not be installed); the
    /// directive write is the only failure that propagates.
    pub fn detach(&self, interface: &str) -> Result<()> {
        // wpa_supplicant fights hostapd for the radio.
        self.runner
            .run_unchecked("systemctl", &["stop", &format!("wpa_supplicant@{}", interface)]);
        self.runner.run_unchecked("systemctl", &["stop", "wpa_supplicant"]);

        // Immediate release for the current boot.
        self.runner
            .run_unchecked("nmcli", &["device", "set", interface, "managed", "no"]);

        let directive = format!(
            "# Written by g2-provision: {if_name} is owned by the AP pipeline.\n\
             [keyfile]\n\
             unmanaged-devices=interface-name:{if_name}\n",
            if_name = interface
        );

        // Same directive already in place means a prior run did the work.
        if self.store.read(UNMANAGED_DIRECTIVE)?.as_deref() == Some(directive.as_str()) {
            debug!("Unmanaged directive for {} already present", interface);
        } else {
            self.store.write(UNMANAGED_DIRECTIVE, &directive)?;
            info!("Marked {} unmanaged in NetworkManager", interface);
        }

        // Let NetworkManager pick up the directive now rather than at reboot.
        self.runner
            .run_unchecked("systemctl", &["reload-or-restart", "NetworkManager"]);

        Ok(())
    }
}
