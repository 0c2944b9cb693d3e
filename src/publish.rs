//! Credential artifact publishing: the plain-text credentials file and the
//! scannable WiFi QR code.
//!
//! Credentials are intentionally stored unencrypted so a technician can read
//! them off the device; the network they open is local-only.

use anyhow::Result;
use chrono::Local;
use tera::Context;
use tracing::{info, warn};

use crate::config::ApConfig;
use crate::credentials::DerivedCredentials;
use crate::render::TEMPLATES;
use crate::runner::CommandRunner;
use crate::store::ConfigStore;

pub const CREDENTIALS_RESOURCE: &str = "etc/g2-provision/credentials.txt";
pub const QR_RESOURCE: &str = "etc/g2-provision/wifi-qr.png";

pub struct CredentialArtifactPublisher<'a> {
    runner: &'a dyn CommandRunner,
    store: &'a ConfigStore,
}

impl<'a> CredentialArtifactPublisher<'a> {
    pub fn new(runner: &'a dyn CommandRunner, store: &'a ConfigStore) -> Self {
        Self { runner, store }
    }

    /// Overwrite the credentials artifact with the current derivation plus
    /// connection metadata and the documented service URLs.
    pub fn write_credentials(&self, cfg: &ApConfig, creds: &DerivedCredentials) -> Result<()> {
        let mut ctx = Context::new();
        ctx.insert("ssid", &creds.ssid);
        ctx.insert("passphrase", &creds.passphrase);
        ctx.insert("ap_address", &cfg.address.address);
        ctx.insert("interface", &cfg.interface);
        ctx.insert("country", &cfg.country);
        ctx.insert("hidden", &cfg.hidden);
        ctx.insert("created", &Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
        ctx.insert("api_port", &cfg.api_port);

        let rendered = TEMPLATES.render("credentials.txt", &ctx)?;
        self.store.write(CREDENTIALS_RESOURCE, &rendered)?;
        info!("Credentials artifact written for {}", creds.ssid);
        Ok(())
    }

    /// Standard WiFi-connect payload understood by phone cameras.
    pub fn wifi_payload(creds: &DerivedCredentials, hidden: bool) -> String {
        format!(
            "WIFI:T:WPA;S:{};P:{};H:{};;",
            creds.ssid, creds.passphrase, hidden
        )
    }

    /// Ask the external renderer for a QR image. Failure leaves the text
    /// artifact as the fallback and is never fatal.
    pub fn render_qr(&self, cfg: &ApConfig, creds: &DerivedCredentials) {
        let payload = Self::wifi_payload(creds, cfg.hidden);
        let output = self.store.path(QR_RESOURCE);
        if let Some(parent) = output.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let output = output.display().to_string();

        match self
            .runner
            .run("qrencode", &["-o", &output, "-s", "8", &payload])
        {
            Ok(out) if out.success => info!("WiFi QR code written to {}", output),
            Ok(out) => warn!("qrencode failed: {}", out.message()),
            Err(e) => warn!("qrencode unavailable: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials;
    use crate::identity::NetworkIdentity;
    use crate::runner::testing::ScriptedRunner;
    use tempfile::TempDir;

    fn creds() -> DerivedCredentials {
        credentials::derive(&NetworkIdentity {
            interface: "wlan0".to_string(),
            hardware_address: "b8:27:eb:aa:bb:cc".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn artifact_contains_credentials_and_service_urls() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let runner = ScriptedRunner::new();
        let creds = creds();

        CredentialArtifactPublisher::new(&runner, &store)
            .write_credentials(&ApConfig::default(), &creds)
            .unwrap();

        let artifact = store.read(CREDENTIALS_RESOURCE).unwrap().unwrap();
        assert!(artifact.contains("SSID:        G2TabletNetwork-aabbcc"));
        assert!(artifact.contains(&creds.passphrase));
        assert!(creds.passphrase.starts_with("G2"));
        assert_eq!(creds.passphrase.len(), 18);
        assert!(artifact.contains("http://192.168.4.1/docs"));
        assert!(artifact.contains("http://192.168.4.1:8000/"));
        assert!(artifact.contains("ws://192.168.4.1/websocket"));
    }

    #[test]
    fn rewrite_overwrites_rather_than_appends() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let runner = ScriptedRunner::new();
        let publisher = CredentialArtifactPublisher::new(&runner, &store);

        publisher.write_credentials(&ApConfig::default(), &creds()).unwrap();
        publisher.write_credentials(&ApConfig::default(), &creds()).unwrap();

        let artifact = store.read(CREDENTIALS_RESOURCE).unwrap().unwrap();
        assert_eq!(artifact.matches("SSID:").count(), 1);
    }

    #[test]
    fn wifi_payload_matches_connect_format() {
        let creds = creds();
        let payload = CredentialArtifactPublisher::wifi_payload(&creds, false);
        assert_eq!(
            payload,
            format!("WIFI:T:WPA;S:{};P:{};H:false;;", creds.ssid, creds.passphrase)
        );
    }

    #[test]
    fn qr_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let runner = ScriptedRunner::new();
        runner.respond("qrencode", false, "");

        // Must not panic or error; the text artifact is the fallback.
        CredentialArtifactPublisher::new(&runner, &store).render_qr(&ApConfig::default(), &creds());
        assert!(runner.called_with("qrencode -o"));
    }
}
