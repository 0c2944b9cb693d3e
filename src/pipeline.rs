//! The provisioning orchestrator.
//!
//! Runs an explicit ordered step list; each step produces a [`StepOutcome`].
//! Fatal steps abort the run immediately, non-fatal steps record a warning
//! and let the pipeline continue. Re-running the whole pipeline is the
//! documented recovery path: every step overwrites or flush-and-rebuilds its
//! own state, so repeated runs converge.

use anyhow::Result;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::address::StaticAddressConfigurator;
use crate::config::ApConfig;
use crate::credentials::{self, DerivedCredentials};
use crate::dnsmasq::{self, DhcpDnsConfigurator};
use crate::firewall::FirewallConfigurator;
use crate::hostapd::{self, RadioConfigurator};
use crate::identity::{self, NetworkIdentity};
use crate::proxy::ReverseProxyConfigurator;
use crate::publish::CredentialArtifactPublisher;
use crate::reclaim::InterfaceReclaimer;
use crate::resolver::DnsResolutionOptimizer;
use crate::runner::CommandRunner;
use crate::store::ConfigStore;
use crate::supervisor::{DaemonSpec, ProcessSupervisor, ServiceSupervisor};
use crate::verify::{self, VerificationEngine, VerificationReport};

/// Unit name of the external local API service; started as a convenience
/// when verification finds its port closed on a fresh installation.
pub const API_SERVICE_UNIT: &str = "g2-service";

/// Written after a fully successful run. The first-boot trigger checks for
/// this file to suppress repeat provisioning; `--force` ignores it.
pub const COMPLETION_MARKER_RESOURCE: &str = "var/lib/g2-provision/provisioned";

const INTERFACE_WAIT_ATTEMPTS: u32 = 10;
const INTERFACE_WAIT_INTERVAL: Duration = Duration::from_secs(2);
const DAEMON_START_TIMEOUT: Duration = Duration::from_secs(10);
const DAEMON_SETTLE: Duration = Duration::from_secs(3);
const STABILIZATION_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step: &'static str,
    pub succeeded: bool,
    pub diagnostic: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    DeriveCredentials,
    ReclaimInterface,
    StaticAddress,
    DhcpDnsConfig,
    RadioConfig,
    Firewall,
    ReverseProxy,
    ResolverBias,
    StartServices,
    Verify,
    PublishArtifacts,
}

#[derive(Debug, Clone, Copy)]
pub struct StepSpec {
    pub name: &'static str,
    pub fatal: bool,
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub outcomes: Vec<StepOutcome>,
    pub verification: Option<VerificationReport>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.succeeded)
    }
}

pub struct ProvisioningOrchestrator<'a> {
    cfg: &'a ApConfig,
    runner: &'a dyn CommandRunner,
    store: &'a ConfigStore,
    supervisor: &'a dyn ProcessSupervisor,
    stabilization: Duration,
    daemon_start_timeout: Duration,
    daemon_settle: Duration,
    http: fn(&str) -> (bool, String),

    identity: Option<NetworkIdentity>,
    credentials: Option<DerivedCredentials>,
    verification: Option<VerificationReport>,
}

impl<'a> ProvisioningOrchestrator<'a> {
    pub fn new(
        cfg: &'a ApConfig,
        runner: &'a dyn CommandRunner,
        store: &'a ConfigStore,
        supervisor: &'a dyn ProcessSupervisor,
    ) -> Self {
        Self {
            cfg,
            runner,
            store,
            supervisor,
            stabilization: STABILIZATION_DELAY,
            daemon_start_timeout: DAEMON_START_TIMEOUT,
            daemon_settle: DAEMON_SETTLE,
            http: verify::http_reachable,
            identity: None,
            credentials: None,
            verification: None,
        }
    }

    #[cfg(test)]
    fn for_tests(mut self) -> Self {
        self.stabilization = Duration::ZERO;
        self.daemon_start_timeout = Duration::ZERO;
        self.daemon_settle = Duration::ZERO;
        self.http = |url| (true, url.to_string());
        self
    }

    /// The fixed step order. Fatality follows the component contracts:
    /// proxy, resolver bias and artifact publishing degrade gracefully,
    /// everything else is load-bearing.
    pub fn steps() -> Vec<StepSpec> {
        use StepKind::*;
        vec![
            StepSpec { name: "derive-credentials", fatal: true, kind: DeriveCredentials },
            StepSpec { name: "reclaim-interface", fatal: true, kind: ReclaimInterface },
            StepSpec { name: "static-address", fatal: true, kind: StaticAddress },
            StepSpec { name: "dhcp-dns-config", fatal: true, kind: DhcpDnsConfig },
            StepSpec { name: "radio-config", fatal: true, kind: RadioConfig },
            StepSpec { name: "firewall", fatal: true, kind: Firewall },
            StepSpec { name: "reverse-proxy", fatal: false, kind: ReverseProxy },
            StepSpec { name: "resolver-bias", fatal: false, kind: ResolverBias },
            StepSpec { name: "start-services", fatal: true, kind: StartServices },
            StepSpec { name: "verify", fatal: true, kind: Verify },
            StepSpec { name: "publish-artifacts", fatal: false, kind: PublishArtifacts },
        ]
    }

    pub fn run(&mut self) -> Result<PipelineReport> {
        let mut outcomes = Vec::new();

        for spec in Self::steps() {
            info!("==> {}", spec.name);
            match self.execute(spec.kind) {
                Ok(diagnostic) => {
                    outcomes.push(StepOutcome {
                        step: spec.name,
                        succeeded: true,
                        diagnostic,
                    });
                }
                Err(e) => {
                    let diagnostic = format!("{:#}", e);
                    outcomes.push(StepOutcome {
                        step: spec.name,
                        succeeded: false,
                        diagnostic: diagnostic.clone(),
                    });
                    if spec.fatal {
                        error!("Fatal step '{}' failed: {}", spec.name, diagnostic);
                        self.emit_report(&outcomes);
                        return Err(e);
                    }
                    warn!("Step '{}' failed, continuing: {}", spec.name, diagnostic);
                }
            }
        }

        self.emit_report(&outcomes);

        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Err(e) = self
            .store
            .write(COMPLETION_MARKER_RESOURCE, &format!("{}\n", stamp))
        {
            warn!("Could not write completion marker: {:#}", e);
        }

        Ok(PipelineReport {
            outcomes,
            verification: self.verification.clone(),
        })
    }

    fn execute(&mut self, kind: StepKind) -> Result<String> {
        match kind {
            StepKind::DeriveCredentials => {
                if !identity::wait_for_interface(
                    self.runner,
                    &self.cfg.interface,
                    INTERFACE_WAIT_ATTEMPTS,
                    INTERFACE_WAIT_INTERVAL,
                ) {
                    return Err(crate::error::ProvisionError::IdentityUnavailable(
                        self.cfg.interface.clone(),
                    )
                    .into());
                }
                let identity = identity::read_identity(self.runner, self.store, &self.cfg.interface)?;
                let creds = credentials::derive(&identity)?;
                let diagnostic = format!("ssid {}", creds.ssid);
                self.identity = Some(identity);
                self.credentials = Some(creds);
                Ok(diagnostic)
            }
            StepKind::ReclaimInterface => {
                InterfaceReclaimer::new(self.runner, self.store).detach(&self.cfg.interface)?;
                Ok(format!("{} unmanaged", self.cfg.interface))
            }
            StepKind::StaticAddress => {
                StaticAddressConfigurator::new(self.runner, self.store)
                    .apply(&self.cfg.interface, &self.cfg.address)?;
                Ok(self.cfg.address.cidr())
            }
            StepKind::DhcpDnsConfig => {
                DhcpDnsConfigurator::new(self.store).install(self.cfg)?;
                Ok(format!(
                    "range {}-{}",
                    self.cfg.dhcp.range_start, self.cfg.dhcp.range_end
                ))
            }
            StepKind::RadioConfig => {
                let creds = self.credentials()?;
                RadioConfigurator::new(self.store).install(self.cfg, &creds)?;
                // Publish immediately so the credentials survive a later
                // hostapd failure.
                let publisher = CredentialArtifactPublisher::new(self.runner, self.store);
                if let Err(e) = publisher.write_credentials(self.cfg, &creds) {
                    warn!("Could not publish credentials yet: {:#}", e);
                }
                Ok(format!("ssid {}", creds.ssid))
            }
            StepKind::Firewall => {
                FirewallConfigurator::new(self.runner, self.store).apply(self.cfg)?;
                Ok("rules applied and persisted".to_string())
            }
            StepKind::ReverseProxy => {
                ReverseProxyConfigurator::new(self.runner, self.store).install(self.cfg)?;
                Ok("vhost installed".to_string())
            }
            StepKind::ResolverBias => {
                DnsResolutionOptimizer::new(self.runner, self.store).optimize(self.cfg)?;
                Ok("resolver biased to 127.0.0.1".to_string())
            }
            StepKind::StartServices => {
                let services = ServiceSupervisor::new(self.runner, self.supervisor);
                services.resolve_port53_conflict();
                for spec in self.daemon_specs() {
                    services.start_daemon(&spec)?;
                }
                Ok("dnsmasq and hostapd running".to_string())
            }
            StepKind::Verify => {
                // On a fresh installation nothing listens on the API port
                // yet; start the service now so the critical api-port and
                // api-docs checks can pass and re-runs converge.
                self.ensure_api_service();
                let engine = VerificationEngine::new(self.runner, self.store, self.supervisor)
                    .with_http(self.http);
                let report = engine.run(self.cfg, self.stabilization);
                let critical = report.critical_failures;
                let diagnostic = format!(
                    "{} critical failures, dns {}, {} clients",
                    critical,
                    if report.dns_working { "ok" } else { "degraded" },
                    report.clients_served
                );
                self.verification = Some(report);
                if critical > 0 {
                    return Err(crate::error::ProvisionError::VerificationFailed(critical).into());
                }
                Ok(diagnostic)
            }
            StepKind::PublishArtifacts => {
                let creds = self.credentials()?;
                let publisher = CredentialArtifactPublisher::new(self.runner, self.store);
                publisher.write_credentials(self.cfg, &creds)?;
                publisher.render_qr(self.cfg, &creds);
                Ok("credentials artifact and QR code published".to_string())
            }
        }
    }

    fn credentials(&self) -> Result<DerivedCredentials> {
        self.credentials.clone().ok_or_else(|| {
            crate::error::ProvisionError::IdentityUnavailable(self.cfg.interface.clone()).into()
        })
    }

    fn daemon_specs(&self) -> Vec<DaemonSpec> {
        let dnsmasq_conf = self.store.path(dnsmasq::RESOURCE).display().to_string();
        let hostapd_conf = self.store.path(hostapd::RESOURCE).display().to_string();
        vec![
            DaemonSpec {
                name: "dnsmasq".to_string(),
                unit: "dnsmasq".to_string(),
                process: "dnsmasq".to_string(),
                config_test: Some(vec![
                    "dnsmasq".to_string(),
                    "--test".to_string(),
                    "-C".to_string(),
                    dnsmasq_conf.clone(),
                ]),
                manual_start: vec!["dnsmasq".to_string(), "-C".to_string(), dnsmasq_conf],
                start_timeout: self.daemon_start_timeout,
                settle: self.daemon_settle,
            },
            DaemonSpec {
                name: "hostapd".to_string(),
                unit: "hostapd".to_string(),
                process: "hostapd".to_string(),
                // hostapd has no config dry-run; startup is the test.
                config_test: None,
                manual_start: vec![
                    "hostapd".to_string(),
                    "-B".to_string(),
                    hostapd_conf,
                ],
                start_timeout: self.daemon_start_timeout,
                settle: self.daemon_settle,
            },
        ]
    }

    /// Convenience coupling, kept explicit: verification probes the local API,
    /// so right before verifying start its service if nothing listens yet.
    fn ensure_api_service(&self) {
        let listening = self
            .runner
            .run_checked("ss", &["-tln"])
            .unwrap_or_default();
        if !listening.contains(&format!(":{}", self.cfg.api_port)) {
            info!("Local API port closed, starting {}", API_SERVICE_UNIT);
            self.runner
                .run_unchecked("systemctl", &["start", API_SERVICE_UNIT]);
        }
    }

    /// Terminal report: printed for the operator and appended (as JSON) to
    /// the durable log directory for post-mortem review.
    fn emit_report(&self, outcomes: &[StepOutcome]) {
        println!();
        println!("Provisioning report");
        println!("{}", "-".repeat(60));
        for outcome in outcomes {
            let status = if outcome.succeeded { "ok" } else { "FAILED" };
            println!("{:<20} {:<7} {}", outcome.step, status, outcome.diagnostic);
        }
        if let Some(v) = &self.verification {
            println!(
                "verification: {} critical failures, dns {}, {} client(s) served",
                v.critical_failures,
                if v.dns_working { "working" } else { "degraded" },
                v.clients_served
            );
        }

        let report = PipelineReport {
            outcomes: outcomes.to_vec(),
            verification: self.verification.clone(),
        };
        let resource = format!(
            "{}/report.json",
            self.cfg.log_dir.to_string_lossy().trim_start_matches('/')
        );
        match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                if let Err(e) = self.store.write(&resource, &json) {
                    warn!("Could not write report file: {:#}", e);
                }
            }
            Err(e) => warn!("Could not serialize report: {}", e),
        }
    }
}
