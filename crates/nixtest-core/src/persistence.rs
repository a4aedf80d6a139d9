//! VM record persistence.
//!
//! `nixtest setup` records the VMs it provisions so `status` and `cleanup`
//! can find them from a later process.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SupervisorError};
use crate::vm::{VmHandle, VmState};

/// A provisioned VM as last seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    /// Hypervisor identifier.
    pub name: String,
    /// Pristine snapshot, if recorded.
    pub snapshot: Option<String>,
    /// Last known power state.
    pub state: VmState,
    /// When the VM was first recorded.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl VmRecord {
    /// Creates a record for a freshly set up VM.
    #[must_use]
    pub fn from_handle(vm: &VmHandle) -> Self {
        let now = Utc::now();
        Self {
            name: vm.id.clone(),
            snapshot: vm.snapshot.clone(),
            state: vm.state,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuilds a handle. The address is always unknown.
    #[must_use]
    pub fn to_handle(&self) -> VmHandle {
        VmHandle {
            id: self.name.clone(),
            ip_address: None,
            state: self.state,
            snapshot: self.snapshot.clone(),
        }
    }
}

/// Stores one TOML file per VM under a directory.
pub struct VmRecordStore {
    base_dir: PathBuf,
}

impl VmRecordStore {
    /// Creates a store rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.toml"))
    }

    /// Saves a record, keeping the original creation time if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn save(&self, record: &VmRecord) -> Result<()> {
        fs::create_dir_all(&self.base_dir)?;

        let mut record = record.clone();
        if let Some(existing) = self.load(&record.name)? {
            record.created_at = existing.created_at;
        }
        record.updated_at = Utc::now();

        let content = toml::to_string_pretty(&record)
            .map_err(|e| SupervisorError::Config(format!("Failed to serialize VM record: {e}")))?;
        fs::write(self.record_path(&record.name), content)?;

        tracing::debug!("Saved VM record: {}", record.name);
        Ok(())
    }

    /// Loads a record, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(&self, name: &str) -> Result<Option<VmRecord>> {
        let path = self.record_path(name);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)?;
        let record = toml::from_str(&content).map_err(|e| {
            SupervisorError::Config(format!("Failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(record))
    }

    /// Loads every record, skipping unreadable ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be listed.
    pub fn list(&self) -> Result<Vec<VmRecord>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(name) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping VM record {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Removes a record. Missing records are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.record_path(name);
        if path.exists() {
            fs::remove_file(path)?;
            tracing::debug!("Removed VM record: {}", name);
        }
        Ok(())
    }
}
