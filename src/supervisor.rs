//! Daemon lifecycle management.
//!
//! Each daemon walks an explicit state machine:
//!
//! ```text
//! Stopped -> ConfigValidated -> Starting -> Running
//!                                  |
//!                                  v
//!                             ManualRetry -> Running | Failed
//! ```
//!
//! A `Starting` timeout or immediate exit triggers the manual retry: kill any
//! stray process, launch the daemon directly with diagnostics, wait a fixed
//! settle time and re-check. A daemon that still is not running fails the
//! step with `ServiceStartFailed`, which aborts the whole pipeline.

use anyhow::Result;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::ProvisionError;
use crate::runner::CommandRunner;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    ConfigValidated,
    Starting,
    Running,
    ManualRetry,
    Failed,
}

/// Process-level operations the state machine is built on. The systemd
/// implementation shells out; tests drive the machine with a fake.
pub trait ProcessSupervisor {
    fn start(&self, unit: &str) -> Result<()>;
    fn stop(&self, unit: &str) -> Result<()>;
    fn is_running(&self, process: &str) -> bool;
    fn kill_strays(&self, process: &str);
    /// Captured unit status and recent log lines, for failure reports.
    fn diagnostics(&self, unit: &str) -> String;

    fn wait_until_running(&self, process: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_running(process) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

pub struct SystemdSupervisor<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> SystemdSupervisor<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl ProcessSupervisor for SystemdSupervisor<'_> {
    fn start(&self, unit: &str) -> Result<()> {
        self.runner.run_checked("systemctl", &["start", unit])?;
        Ok(())
    }

    fn stop(&self, unit: &str) -> Result<()> {
        self.runner.run_checked("systemctl", &["stop", unit])?;
        Ok(())
    }

    fn is_running(&self, process: &str) -> bool {
        self.runner
            .run("pgrep", &["-x", process])
            .map(|out| out.success && !out.stdout.is_empty())
            .unwrap_or(false)
    }

    fn kill_strays(&self, process: &str) {
        self.runner.run_unchecked("pkill", &["-x", process]);
    }

    fn diagnostics(&self, unit: &str) -> String {
        let status = self
            .runner
            .run("systemctl", &["status", unit, "--no-pager", "-l"])
            .map(|out| out.message())
            .unwrap_or_default();
        let journal = self
            .runner
            .run("journalctl", &["-u", unit, "-n", "20", "--no-pager"])
            .map(|out| out.message())
            .unwrap_or_default();
        format!("{}\n{}", status, journal)
    }
}

/// How to validate, start and manually fall back for one daemon.
pub struct DaemonSpec {
    pub name: String,
    pub unit: String,
    /// Exact process name as seen by pgrep.
    pub process: String,
    /// Config validation command, run before any start attempt.
    pub config_test: Option<Vec<String>>,
    /// Direct (non-unit) start used by the manual retry.
    pub manual_start: Vec<String>,
    pub start_timeout: Duration,
    pub settle: Duration,
}

pub struct ServiceSupervisor<'a> {
    runner: &'a dyn CommandRunner,
    supervisor: &'a dyn ProcessSupervisor,
}

impl<'a> ServiceSupervisor<'a> {
    pub fn new(runner: &'a dyn CommandRunner, supervisor: &'a dyn ProcessSupervisor) -> Self {
        Self { runner, supervisor }
    }

    /// A pre-existing system resolver holding port 53 keeps dnsmasq from
    /// binding. Stop and disable it before starting the local DNS function.
    pub fn resolve_port53_conflict(&self) {
        if self.supervisor.is_running("systemd-resolved") {
            info!("Stopping systemd-resolved to free port 53");
            if let Err(e) = self.supervisor.stop("systemd-resolved") {
                warn!("Could not stop systemd-resolved: {}", e);
            }
            self.runner
                .run_unchecked("systemctl", &["disable", "systemd-resolved"]);
        }
    }

    /// Drive one daemon to `Running`, or fail with `ServiceStartFailed`.
    pub fn start_daemon(&self, spec: &DaemonSpec) -> Result<ServiceState> {
        let mut state = ServiceState::Stopped;
        info!("Starting {} ({:?})", spec.name, state);

        if let Some(test) = &spec.config_test {
            let args: Vec<&str> = test[1..].iter().map(String::as_str).collect();
            if let Err(e) = self.runner.run_checked(&test[0], &args) {
                return Err(ProvisionError::ServiceStartFailed {
                    service: spec.name.clone(),
                    detail: format!("config validation failed: {}", e),
                }
                .into());
            }
        }
        state = ServiceState::ConfigValidated;
        info!("{} {:?}", spec.name, state);

        // Clean slate: a half-dead unit from a previous run confuses systemd.
        let _ = self.supervisor.stop(&spec.unit);

        if self.supervisor.start(&spec.unit).is_ok() {
            state = ServiceState::Starting;
            info!("{} {:?}", spec.name, state);
            if self.supervisor.wait_until_running(&spec.process, spec.start_timeout) {
                info!("{} running", spec.name);
                return Ok(ServiceState::Running);
            }
        }

        state = ServiceState::ManualRetry;
        warn!("{} did not reach Running, attempting manual start ({:?})", spec.name, state);
        self.supervisor.kill_strays(&spec.process);

        let args: Vec<&str> = spec.manual_start[1..].iter().map(String::as_str).collect();
        let manual = self
            .runner
            .run(&spec.manual_start[0], &args)
            .map(|out| out.message())
            .unwrap_or_else(|e| e.to_string());

        thread::sleep(spec.settle);

        if self.supervisor.is_running(&spec.process) {
            info!("{} running after manual start", spec.name);
            return Ok(ServiceState::Running);
        }

        state = ServiceState::Failed;
        let diagnostics = self.supervisor.diagnostics(&spec.unit);
        Err(ProvisionError::ServiceStartFailed {
            service: spec.name.clone(),
            detail: format!(
                "state {:?}; manual start output: {}; diagnostics: {}",
                state,
                manual.trim(),
                diagnostics.trim()
            ),
        }
        .into())
    }
}
