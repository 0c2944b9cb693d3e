//! Deterministic credential derivation.
//!
//! The SSID and passphrase are pure functions of the interface MAC, so the
//! same device always broadcasts the same network and re-provisioning never
//! invalidates a paired tablet. The passphrase keeps only the first 16 hex
//! characters of a SHA-256 digest (~64 bits, unsalted) and is stored in plain
//! text on the device; this is a deliberate usability trade-off for a
//! physically local network, not a hardened secret.

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::config::{PASSPHRASE_PREFIX, SSID_PREFIX};
use crate::error::ProvisionError;
use crate::identity::{is_valid_mac, NetworkIdentity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedCredentials {
    pub ssid: String,
    pub passphrase: String,
}

/// Derive the network credentials from the interface hardware address.
///
/// - ssid: `G2TabletNetwork-` + last 6 hex chars of the MAC (lowercase,
///   colons stripped)
/// - passphrase: `G2` + first 16 hex chars of SHA-256 of the stripped MAC
///
/// Example: `b8:27:eb:11:22:33` yields ssid `G2TabletNetwork-112233`.
pub fn derive(identity: &NetworkIdentity) -> Result<DerivedCredentials> {
    if !is_valid_mac(&identity.hardware_address) {
        return Err(ProvisionError::IdentityUnavailable(identity.interface.clone()).into());
    }

    let stripped = identity.hardware_address.to_lowercase().replace(':', "");

    let ssid = format!("{}{}", SSID_PREFIX, &stripped[6..]);

    let digest = hex::encode(Sha256::digest(stripped.as_bytes()));
    let passphrase = format!("{}{}", PASSPHRASE_PREFIX, &digest[..16]);

    Ok(DerivedCredentials { ssid, passphrase })
}
