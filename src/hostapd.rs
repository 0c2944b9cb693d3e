//! AP radio daemon configuration (hostapd).

use anyhow::Result;
use tera::Context;
use tracing::info;

use crate::config::ApConfig;
use crate::credentials::DerivedCredentials;
use crate::render::TEMPLATES;
use crate::store::ConfigStore;

pub const RESOURCE: &str = "etc/hostapd/hostapd.conf";

pub struct RadioConfigurator<'a> {
    store: &'a ConfigStore,
}

impl<'a> RadioConfigurator<'a> {
    pub fn new(store: &'a ConfigStore) -> Self {
        Self { store }
    }

    pub fn render(cfg: &ApConfig, creds: &DerivedCredentials) -> Result<String> {
        let mut ctx = Context::new();
        ctx.insert("interface", &cfg.interface);
        ctx.insert("ssid", &creds.ssid);
        ctx.insert("channel", &cfg.channel);
        ctx.insert("country", &cfg.country);
        ctx.insert("beacon_interval", &cfg.beacon_interval);
        ctx.insert("dtim_period", &cfg.dtim_period);
        ctx.insert("max_stations", &cfg.max_stations);
        ctx.insert("hidden_flag", &u8::from(cfg.hidden));
        ctx.insert("passphrase", &creds.passphrase);

        Ok(TEMPLATES.render("hostapd.conf", &ctx)?)
    }

    pub fn install(&self, cfg: &ApConfig, creds: &DerivedCredentials) -> Result<()> {
        let rendered = Self::render(cfg, creds)?;
        if let Some(backup) = self.store.backup(RESOURCE)? {
            info!("Backed up prior hostapd config to {}", backup.display());
        }
        self.store.write(RESOURCE, &rendered)?;
        info!("Installed hostapd configuration, ssid {}", creds.ssid);
        Ok(())
    }
}
