//! Post-provisioning verification.
//!
//! Runs after a fixed stabilization delay and probes everything the AP needs
//! to be usable: interface address, daemon liveness, listening ports, HTTP
//! reachability and name resolution. Failing name resolution alone is a
//! warning (clients can still use addresses); everything else is critical.

use serde::Serialize;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ApConfig;
use crate::dnsmasq::LOCAL_DOMAIN;
use crate::runner::CommandRunner;
use crate::store::ConfigStore;
use crate::supervisor::ProcessSupervisor;

pub const LEASES_RESOURCE: &str = "var/lib/misc/dnsmasq.leases";

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub critical: bool,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    pub fn new(name: &'static str, critical: bool, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name,
            critical,
            passed,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub checks: Vec<CheckResult>,
    pub critical_failures: usize,
    pub dns_working: bool,
    pub clients_served: usize,
}

impl VerificationReport {
    /// Fold individual check results into the terminal report. Non-critical
    /// checks never contribute to the failure count.
    pub fn assess(checks: Vec<CheckResult>, dns_working: bool, clients_served: usize) -> Self {
        let critical_failures = checks.iter().filter(|c| c.critical && !c.passed).count();
        Self {
            checks,
            critical_failures,
            dns_working,
            clients_served,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.critical_failures == 0
    }
}

pub struct VerificationEngine<'a> {
    runner: &'a dyn CommandRunner,
    store: &'a ConfigStore,
    supervisor: &'a dyn ProcessSupervisor,
    http: fn(&str) -> (bool, String),
}

impl<'a> VerificationEngine<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        store: &'a ConfigStore,
        supervisor: &'a dyn ProcessSupervisor,
    ) -> Self {
        Self {
            runner,
            store,
            supervisor,
            http: http_reachable,
        }
    }

    /// Replace the HTTP probe, so orchestrator and engine tests do not open
    /// real sockets.
    pub(crate) fn with_http(mut self, http: fn(&str) -> (bool, String)) -> Self {
        self.http = http;
        self
    }

    pub fn run(&self, cfg: &ApConfig, stabilization: Duration) -> VerificationReport {
        if !stabilization.is_zero() {
            info!("Waiting {:?} before verification", stabilization);
            thread::sleep(stabilization);
        }

        let mut checks = Vec::new();

        let shown = self
            .runner
            .run_checked("ip", &["-4", "addr", "show", &cfg.interface])
            .unwrap_or_default();
        let has_addr = shown.contains(&cfg.address.address.to_string());
        checks.push(CheckResult::new(
            "interface-address",
            true,
            has_addr,
            if has_addr { cfg.address.cidr() } else { "address missing".to_string() },
        ));

        for (name, process) in [("radio-daemon", "hostapd"), ("dhcp-dns-daemon", "dnsmasq")] {
            let running = self.supervisor.is_running(process);
            checks.push(CheckResult::new(
                name,
                true,
                running,
                if running { "running" } else { "not running" },
            ));
        }

        let udp = self.listening_sockets("-uln");
        checks.push(CheckResult::new(
            "dhcp-port",
            true,
            udp.contains(":67 ") || udp.ends_with(":67"),
            "udp/67",
        ));
        checks.push(CheckResult::new(
            "dns-port",
            true,
            udp.contains(":53 ") || udp.ends_with(":53"),
            "udp/53",
        ));

        let root_url = format!("http://{}/", cfg.address.address);
        let api_url = format!("http://127.0.0.1:{}/", cfg.api_port);
        let docs_url = format!("http://127.0.0.1:{}/docs", cfg.api_port);
        for (name, url) in [
            ("http-root", &root_url),
            ("api-port", &api_url),
            ("api-docs", &docs_url),
        ] {
            let (reachable, detail) = (self.http)(url);
            checks.push(CheckResult::new(name, true, reachable, detail));
        }

        let dns_working = self.resolution_works();
        checks.push(CheckResult::new(
            "dns-resolution",
            false,
            dns_working,
            if dns_working { "resolves" } else { "not resolving (warning only)" },
        ));

        let clients_served = self.clients_served();
        let report = VerificationReport::assess(checks, dns_working, clients_served);

        for check in &report.checks {
            if check.passed {
                info!("check {}: ok ({})", check.name, check.detail);
            } else if check.critical {
                warn!("check {}: FAILED ({})", check.name, check.detail);
            } else {
                warn!("check {}: failed, non-critical ({})", check.name, check.detail);
            }
        }
        report
    }

    fn listening_sockets(&self, flags: &str) -> String {
        self.runner.run_checked("ss", &[flags]).unwrap_or_default()
    }

    /// Local name resolution, tried through two tools before falling back to
    /// a raw reachability probe of the DNS port.
    fn resolution_works(&self) -> bool {
        if let Ok(out) = self
            .runner
            .run("dig", &["+short", LOCAL_DOMAIN, "@127.0.0.1"])
        {
            if out.success && !out.stdout.trim().is_empty() {
                return true;
            }
        }
        if let Ok(out) = self.runner.run("nslookup", &[LOCAL_DOMAIN, "127.0.0.1"]) {
            if out.success {
                return true;
            }
        }
        self.listening_sockets("-tln").contains(":53")
    }

    /// Lease count from the dnsmasq leases file; zero right after first boot.
    fn clients_served(&self) -> usize {
        self.store
            .read(LEASES_RESOURCE)
            .ok()
            .flatten()
            .map(|contents| contents.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0)
    }
}

/// A URL counts as reachable when the server answers at all; an HTTP error
/// status still proves the service is there.
pub(crate) fn http_reachable(url: &str) -> (bool, String) {
    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(5))
        .build();
    match agent.get(url).call() {
        Ok(response) => (true, format!("{} {}", url, response.status())),
        Err(ureq::Error::Status(code, _)) => (true, format!("{} {}", url, code)),
        Err(e) => (false, format!("{}: {}", url, e)),
    }
}
