//! Filesystem-backed configuration store.
//!
//! Every configurator owns one or more named resources (paths relative to the
//! store root, normally `/`). Routing all reads and writes through the store
//! keeps the pipeline idempotent and re-rootable: tests and rehearsal runs
//! point the root at a scratch directory instead of the live system.

use anyhow::Result;
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ProvisionError;

pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at the live filesystem.
    pub fn system() -> Self {
        Self::new("/")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a resource under this store's root.
    pub fn path(&self, resource: &str) -> PathBuf {
        self.root.join(resource.trim_start_matches('/'))
    }

    pub fn exists(&self, resource: &str) -> bool {
        self.path(resource).exists()
    }

    /// Read a resource, `None` if it does not exist.
    pub fn read(&self, resource: &str) -> Result<Option<String>> {
        let path = self.path(resource);
        if !path.exists() {
            return Ok(None);
        }
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) => Err(ProvisionError::ConfigWriteFailed {
                resource: resource.to_string(),
                detail: format!("read failed: {}", e),
            }
            .into()),
        }
    }

    /// Write a resource, creating parent directories as needed.
    pub fn write(&self, resource: &str, contents: &str) -> Result<()> {
        let path = self.path(resource);
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents)
        };
        write().map_err(|e| {
            ProvisionError::ConfigWriteFailed {
                resource: resource.to_string(),
                detail: e.to_string(),
            }
            .into()
        })
    }

    /// Copy the current contents of a resource to a timestamped sibling before
    /// it gets overwritten. Returns the backup path, or `None` when there was
    /// nothing to back up.
    pub fn backup(&self, resource: &str) -> Result<Option<PathBuf>> {
        let path = self.path(resource);
        if !path.exists() {
            return Ok(None);
        }
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let backup = PathBuf::from(format!("{}.bak-{}", path.display(), stamp));
        fs::copy(&path, &backup).map_err(|e| ProvisionError::ConfigWriteFailed {
            resource: resource.to_string(),
            detail: format!("backup failed: {}", e),
        })?;
        Ok(Some(backup))
    }

    /// Append a marker-guarded block to a resource. The block is only written
    /// once; re-running with the same marker is a no-op. Returns whether the
    /// block was appended.
    pub fn append_once(&self, resource: &str, marker: &str, block: &str) -> Result<bool> {
        let current = self.read(resource)?.unwrap_or_default();
        if current.contains(marker) {
            return Ok(false);
        }
        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(marker);
        updated.push('\n');
        updated.push_str(block);
        if !block.ends_with('\n') {
            updated.push('\n');
        }
        self.write(resource, &updated)?;
        Ok(true)
    }

    /// Insert a marker-guarded block at the top of a resource. For options
    /// that must precede any later section of the file (dhcpcd scopes options
    /// below an `interface` line to that interface). Same once-only semantics
    /// as [`ConfigStore::append_once`].
    pub fn prepend_once(&self, resource: &str, marker: &str, block: &str) -> Result<bool> {
        let current = self.read(resource)?.unwrap_or_default();
        if current.contains(marker) {
            return Ok(false);
        }
        let mut updated = String::new();
        updated.push_str(marker);
        updated.push('\n');
        updated.push_str(block);
        if !block.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&current);
        self.write(resource, &updated)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ConfigStore) {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn write_creates_parents_and_read_round_trips() {
        let (_dir, store) = store();
        store.write("etc/dnsmasq.conf", "interface=wlan0\n").unwrap();
        assert_eq!(
            store.read("etc/dnsmasq.conf").unwrap().as_deref(),
            Some("interface=wlan0\n")
        );
    }

    #[test]
    fn read_missing_resource_is_none() {
        let (_dir, store) = store();
        assert!(store.read("etc/absent.conf").unwrap().is_none());
    }

    #[test]
    fn backup_copies_prior_contents() {
        let (_dir, store) = store();
        store.write("etc/dnsmasq.conf", "old\n").unwrap();
        let backup = store.backup("etc/dnsmasq.conf").unwrap().unwrap();
        store.write("etc/dnsmasq.conf", "new\n").unwrap();
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "old\n");
    }

    #[test]
    fn backup_of_missing_resource_is_none() {
        let (_dir, store) = store();
        assert!(store.backup("etc/absent.conf").unwrap().is_none());
    }

    #[test]
    fn append_once_is_idempotent() {
        let (_dir, store) = store();
        store.write("etc/hosts", "127.0.0.1 localhost\n").unwrap();

        let marker = "# g2-provision hosts";
        assert!(store
            .append_once("etc/hosts", marker, "192.168.4.1 g2.local\n")
            .unwrap());
        assert!(!store
            .append_once("etc/hosts", marker, "192.168.4.1 g2.local\n")
            .unwrap());

        let contents = store.read("etc/hosts").unwrap().unwrap();
        assert_eq!(contents.matches("g2.local").count(), 1);
        assert!(contents.starts_with("127.0.0.1 localhost\n"));
    }

    #[test]
    fn prepend_once_inserts_before_existing_content() {
        let (_dir, store) = store();
        store
            .write("etc/dhcpcd.conf", "interface wlan0\nstatic ip_address=192.168.4.1/24\n")
            .unwrap();

        let marker = "# g2-provision resolver";
        assert!(store
            .prepend_once("etc/dhcpcd.conf", marker, "nohook resolv.conf\n")
            .unwrap());
        assert!(!store
            .prepend_once("etc/dhcpcd.conf", marker, "nohook resolv.conf\n")
            .unwrap());

        let contents = store.read("etc/dhcpcd.conf").unwrap().unwrap();
        assert!(contents.starts_with(marker));
        assert_eq!(contents.matches("nohook resolv.conf").count(), 1);
        assert!(contents.ends_with("static ip_address=192.168.4.1/24\n"));
    }
}
