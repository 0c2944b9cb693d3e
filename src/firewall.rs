//! Packet-filter and NAT rule management.
//!
//! The whole rule set is flushed and rebuilt on every run rather than patched
//! incrementally, so re-provisioning can never accumulate duplicate or stale
//! rules. Rule synthesis is a pure function over the configuration; applying
//! and persisting the result are the only side effects.
//!
//! Rule order (synthesis phases):
//! 1. flush + accept policies as the baseline
//! 2. loopback accepted both directions
//! 3. established/related accepted on input and forward
//! 4. all AP-interface traffic accepted
//! 5. explicit allow per local service port
//! 6. DNAT per loopback-bound service port (such services refuse
//!    non-loopback-sourced connections)
//! 7. MASQUERADE on loopback so DNAT'd traffic appears locally originated
//! 8. forwarding for the AP <-> loopback DNAT path
//! 9. bidirectional reject between AP and uplink (the internet block)
//! 10. persistence via iptables-save

use anyhow::Result;
use tracing::{info, warn};

use crate::config::ApConfig;
use crate::error::ProvisionError;
use crate::runner::CommandRunner;
use crate::store::ConfigStore;

pub const RULES_RESOURCE: &str = "etc/iptables/rules.v4";

/// TCP service ports always allowed on the AP: SSH, HTTP, HTTPS.
const ALLOWED_TCP_PORTS: [u16; 3] = [22, 80, 443];

/// Synthesize the full iptables program for this configuration. Each entry is
/// one `iptables` argument vector; the order is significant.
pub fn synthesize_rules(cfg: &ApConfig) -> Vec<Vec<String>> {
    let mut rules: Vec<Vec<String>> = Vec::new();
    let mut rule = |args: &[&str]| {
        rules.push(args.iter().map(|s| s.to_string()).collect());
    };
    let ap = cfg.interface.clone();

    // Phase 1: flush everything, accept-by-default baseline.
    rule(&["-F"]);
    rule(&["-X"]);
    rule(&["-t", "nat", "-F"]);
    rule(&["-t", "nat", "-X"]);
    rule(&["-P", "INPUT", "ACCEPT"]);
    rule(&["-P", "FORWARD", "ACCEPT"]);
    rule(&["-P", "OUTPUT", "ACCEPT"]);

    // Phase 2: loopback.
    rule(&["-A", "INPUT", "-i", "lo", "-j", "ACCEPT"]);
    rule(&["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"]);

    // Phase 3: established/related.
    rule(&["-A", "INPUT", "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"]);
    rule(&["-A", "FORWARD", "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"]);

    // Phase 4: the AP interface itself.
    rule(&["-A", "INPUT", "-i", &ap, "-j", "ACCEPT"]);
    rule(&["-A", "OUTPUT", "-o", &ap, "-j", "ACCEPT"]);
    rule(&["-A", "FORWARD", "-i", &ap, "-j", "ACCEPT"]);

    // Phase 5: explicit service ports.
    let mut tcp_ports: Vec<u16> = ALLOWED_TCP_PORTS.to_vec();
    tcp_ports.push(53); // DNS over TCP
    tcp_ports.push(cfg.api_port);
    tcp_ports.push(cfg.ui_port);
    tcp_ports.push(cfg.websocket_port);
    for port in tcp_ports {
        let port = port.to_string();
        rule(&["-A", "INPUT", "-p", "tcp", "--dport", &port, "-j", "ACCEPT"]);
    }
    for port in ["53", "67", "68"] {
        // DNS and both DHCP directions over UDP.
        rule(&["-A", "INPUT", "-p", "udp", "--dport", port, "-j", "ACCEPT"]);
    }

    // Phases 6-8: expose loopback-bound services to AP clients.
    for port in cfg.loopback_bound_ports() {
        let port = port.to_string();
        let dest = format!("127.0.0.1:{}", port);
        rule(&[
            "-t", "nat", "-A", "PREROUTING", "-i", &ap, "-p", "tcp", "--dport", &port, "-j",
            "DNAT", "--to-destination", &dest,
        ]);
    }
    rule(&["-t", "nat", "-A", "POSTROUTING", "-o", "lo", "-j", "MASQUERADE"]);
    rule(&["-A", "FORWARD", "-i", &ap, "-o", "lo", "-j", "ACCEPT"]);
    rule(&["-A", "FORWARD", "-i", "lo", "-o", &ap, "-j", "ACCEPT"]);

    // Phase 9: block the uplink. This is the internet-blocking guarantee.
    if let Some(uplink) = cfg.uplink.as_deref() {
        if uplink != ap {
            for (from, to) in [(ap.as_str(), uplink), (uplink, ap.as_str())] {
                rule(&[
                    "-A", "FORWARD", "-i", from, "-o", to, "-j", "REJECT", "--reject-with",
                    "icmp-port-unreachable",
                ]);
            }
        }
    }

    rules
}

pub struct FirewallConfigurator<'a> {
    runner: &'a dyn CommandRunner,
    store: &'a ConfigStore,
}

impl<'a> FirewallConfigurator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, store: &'a ConfigStore) -> Self {
        Self { runner, store }
    }

    /// Apply the synthesized rule set and persist it for reboot. Individual
    /// rules are best-effort (a missing match extension should not take the
    /// whole AP down); failure to persist is fatal for this step.
    pub fn apply(&self, cfg: &ApConfig) -> Result<()> {
        // DNAT to 127.0.0.1 requires routing to localnet on the AP interface.
        let localnet = format!("net.ipv4.conf.{}.route_localnet=1", cfg.interface);
        self.runner.run_unchecked("sysctl", &["-w", &localnet]);

        let rules = synthesize_rules(cfg);
        let mut failed = 0usize;
        for rule in &rules {
            let args: Vec<&str> = rule.iter().map(String::as_str).collect();
            match self.runner.run("iptables", &args) {
                Ok(out) if out.success => {}
                Ok(out) => {
                    failed += 1;
                    warn!("iptables {} failed: {}", rule.join(" "), out.message());
                }
                Err(e) => {
                    return Err(ProvisionError::FirewallApplyFailed(e.to_string()).into());
                }
            }
        }
        info!("Applied {} firewall rules ({} failed)", rules.len(), failed);

        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let saved = self
            .runner
            .run_checked("iptables-save", &[])
            .map_err(|e| ProvisionError::FirewallApplyFailed(e.to_string()))?;

        self.store
            .write(RULES_RESOURCE, &saved)
            .map_err(|e| ProvisionError::FirewallApplyFailed(e.to_string()))?;

        // The persistence service reloads rules.v4 at boot.
        self.runner
            .run_unchecked("systemctl", &["enable", "netfilter-persistent"]);

        info!("Persisted firewall rules to {}", RULES_RESOURCE);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use tempfile::TempDir;

    #[test]
    fn synthesis_is_deterministic_across_runs() {
        let cfg = ApConfig::default();
        assert_eq!(synthesize_rules(&cfg), synthesize_rules(&cfg));
    }

    #[test]
    fn rule_program_starts_with_a_full_flush() {
        let rules = synthesize_rules(&ApConfig::default());
        assert_eq!(rules[0], vec!["-F"]);
        assert!(rules[..4].iter().any(|r| r.join(" ") == "-t nat -F"));
    }

    #[test]
    fn no_duplicate_append_rules() {
        let rules = synthesize_rules(&ApConfig::default());
        let appends: Vec<String> = rules
            .iter()
            .filter(|r| r.contains(&"-A".to_string()))
            .map(|r| r.join(" "))
            .collect();
        let mut deduped = appends.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(appends.len(), deduped.len());
    }

    #[test]
    fn dnat_and_masquerade_cover_loopback_bound_services() {
        let cfg = ApConfig::default();
        let joined: Vec<String> = synthesize_rules(&cfg).iter().map(|r| r.join(" ")).collect();

        for port in cfg.loopback_bound_ports() {
            let expected = format!(
                "-t nat -A PREROUTING -i wlan0 -p tcp --dport {port} -j DNAT \
                 --to-destination 127.0.0.1:{port}"
            );
            assert!(joined.contains(&expected), "missing DNAT for {}", port);
        }
        assert!(joined.contains(&"-t nat -A POSTROUTING -o lo -j MASQUERADE".to_string()));
    }

    #[test]
    fn uplink_is_rejected_in_both_directions() {
        let joined: Vec<String> = synthesize_rules(&ApConfig::default())
            .iter()
            .map(|r| r.join(" "))
            .collect();
        assert!(joined.contains(
            &"-A FORWARD -i wlan0 -o wlan1 -j REJECT --reject-with icmp-port-unreachable"
                .to_string()
        ));
        assert!(joined.contains(
            &"-A FORWARD -i wlan1 -o wlan0 -j REJECT --reject-with icmp-port-unreachable"
                .to_string()
        ));
    }

    #[test]
    fn no_uplink_means_no_reject_rules() {
        let cfg = ApConfig {
            uplink: None,
            ..ApConfig::default()
        };
        let joined: Vec<String> = synthesize_rules(&cfg).iter().map(|r| r.join(" ")).collect();
        assert!(!joined.iter().any(|r| r.contains("REJECT")));
    }

    #[test]
    fn apply_tolerates_individual_rule_failures() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let runner = ScriptedRunner::new();
        runner.respond("iptables -A INPUT -m state", false, "");
        runner.respond("iptables-save", true, "*filter\nCOMMIT\n");

        FirewallConfigurator::new(&runner, &store)
            .apply(&ApConfig::default())
            .unwrap();
        assert_eq!(
            store.read(RULES_RESOURCE).unwrap().as_deref(),
            Some("*filter\nCOMMIT\n")
        );
    }

    #[test]
    fn failed_persistence_fails_the_step() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let runner = ScriptedRunner::new();
        runner.respond("iptables-save", false, "");

        let err = FirewallConfigurator::new(&runner, &store)
            .apply(&ApConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("persistence failed"));
    }
}
