use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("No hardware address available for interface '{0}'")]
    IdentityUnavailable(String),

    #[error("Address assignment failed on '{interface}': {detail}")]
    AddressAssignmentFailed { interface: String, detail: String },

    #[error("Failed to write config resource '{resource}': {detail}")]
    ConfigWriteFailed { resource: String, detail: String },

    #[error("Firewall rule persistence failed: {0}")]
    FirewallApplyFailed(String),

    #[error("Service '{service}' failed to start: {detail}")]
    ServiceStartFailed { service: String, detail: String },

    #[error("Verification failed: {0} critical check(s) did not pass")]
    VerificationFailed(usize),

    #[error("Failed to execute {program}: {detail}")]
    CommandFailed { program: String, detail: String },

    #[error("Invalid DHCP lease plan: {0}")]
    InvalidLeasePlan(String),

    #[error("Invalid address plan: {0}")]
    InvalidAddressPlan(String),
}
