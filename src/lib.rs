//! G2 Access-Point Provisioner
//!
//! This library turns a wireless interface into a self-contained local
//! access point for the G2 printer tablet: clients join the AP and reach the
//! loopback-bound web UI, HTTP API and WebSocket services through DNAT and a
//! reverse proxy, while general internet access is blocked.
//!
//! # Modules
//!
//! - [`config`] - Deployment configuration: address, lease and radio plans
//! - [`credentials`] - Deterministic SSID/passphrase derivation from the MAC
//! - [`identity`] - Interface discovery and hardware-address reading
//! - [`reclaim`] - Detaching the interface from NetworkManager, persistently
//! - [`address`] - Static address assignment and dual persistence
//! - [`dnsmasq`] - DHCP/DNS daemon configuration generation
//! - [`hostapd`] - AP radio daemon configuration generation
//! - [`firewall`] - Packet-filter and NAT rule synthesis and persistence
//! - [`proxy`] - Reverse-proxy virtual host generation
//! - [`resolver`] - System resolver bias and static host entries
//! - [`supervisor`] - Daemon lifecycle state machine with manual fallback
//! - [`verify`] - Post-provisioning health checks
//! - [`publish`] - Credentials artifact and WiFi QR code
//! - [`pipeline`] - The ordered provisioning orchestrator
//!
//! The side-effect seams ([`runner::CommandRunner`], [`store::ConfigStore`],
//! [`supervisor::ProcessSupervisor`]) keep every step testable without
//! touching live system state.

pub mod address;
pub mod config;
pub mod credentials;
pub mod dnsmasq;
pub mod error;
pub mod firewall;
pub mod hostapd;
pub mod identity;
pub mod pipeline;
pub mod proxy;
pub mod publish;
pub mod reclaim;
pub mod render;
pub mod resolver;
pub mod runner;
pub mod store;
pub mod supervisor;
pub mod verify;

pub use config::ApConfig;
pub use credentials::{derive, DerivedCredentials};
pub use error::ProvisionError;
pub use identity::NetworkIdentity;
pub use pipeline::{PipelineReport, ProvisioningOrchestrator};
pub use runner::{CommandRunner, SystemRunner};
pub use store::ConfigStore;
pub use verify::VerificationReport;
