// SPDX-License-Identifier: MIT OR Apache-2.0
//! Receipt and decision persistence.
//!
//! Both stores are append-only from the core's perspective: records are
//! written once under their time-ordered UUID and never touched again.
//! Files are partitioned by month (`YYYY-MM/<uuid>.json`) off the record's
//! own timestamp.

use anyhow::{Context, Result};
use moat_core::{PolicyDecision, Receipt};
use std::path::{Path, PathBuf};
use uuid::Uuid;

fn month_partition(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m").to_string()
}

fn write_json<T: serde::Serialize>(root: &Path, partition: &str, id: Uuid, value: &T) -> Result<PathBuf> {
    let dir = root.join(partition);
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(format!("{id}.json"));
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

fn scan_ids(root: &Path) -> Result<Vec<Uuid>> {
    let mut ids = Vec::new();
    let months = match std::fs::read_dir(root) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => {
            return Err(anyhow::Error::new(e).context(format!("read {}", root.display())));
        }
    };
    for month in months {
        let month = month?;
        if !month.file_type()?.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(month.path())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && let Ok(id) = Uuid::parse_str(stem)
            {
                ids.push(id);
            }
        }
    }
    ids.sort();
    Ok(ids)
}

fn find_json(root: &Path, id: Uuid) -> Result<Option<PathBuf>> {
    let months = match std::fs::read_dir(root) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(anyhow::Error::new(e).context(format!("read {}", root.display())));
        }
    };
    for month in months {
        let candidate = month?.path().join(format!("{id}.json"));
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Month-partitioned file store for [`Receipt`]s.
#[derive(Debug)]
pub struct ReceiptStore {
    root: PathBuf,
}

impl ReceiptStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Persist a receipt. Write-once: refuses to overwrite an existing id.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the file
    /// already exists, or the write fails.
    pub fn save(&self, receipt: &Receipt) -> Result<PathBuf> {
        if find_json(&self.root, receipt.id)?.is_some() {
            anyhow::bail!("receipt {} already persisted (write-once)", receipt.id);
        }
        write_json(
            &self.root,
            &month_partition(receipt.timestamp),
            receipt.id,
            receipt,
        )
    }

    /// Load a receipt by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or does not
    /// exist.
    pub fn load(&self, id: Uuid) -> Result<Receipt> {
        let path = find_json(&self.root, id)?
            .ok_or_else(|| anyhow::anyhow!("no receipt with id {id}"))?;
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// All stored receipt ids, sorted (v7 ids sort by creation time).
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be read.
    pub fn list(&self) -> Result<Vec<Uuid>> {
        scan_ids(&self.root)
    }

    /// Load every receipt recorded for a correlation id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be scanned or a file parsed.
    pub fn find_by_request_id(&self, request_id: &str) -> Result<Vec<Receipt>> {
        let mut found = Vec::new();
        for id in self.list()? {
            let receipt = self.load(id)?;
            if receipt.request_id == request_id {
                found.push(receipt);
            }
        }
        Ok(found)
    }
}

/// Month-partitioned file store for [`PolicyDecision`]s.
#[derive(Debug)]
pub struct DecisionStore {
    root: PathBuf,
}

impl DecisionStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Persist a decision. Write-once: refuses to overwrite an existing id.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the file
    /// already exists, or the write fails.
    pub fn save(&self, decision: &PolicyDecision) -> Result<PathBuf> {
        if find_json(&self.root, decision.id)?.is_some() {
            anyhow::bail!("decision {} already persisted (write-once)", decision.id);
        }
        write_json(
            &self.root,
            &month_partition(decision.timestamp),
            decision.id,
            decision,
        )
    }

    /// Load a decision by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or does not
    /// exist.
    pub fn load(&self, id: Uuid) -> Result<PolicyDecision> {
        let path = find_json(&self.root, id)?
            .ok_or_else(|| anyhow::anyhow!("no decision with id {id}"))?;
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// All stored decision ids, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be read.
    pub fn list(&self) -> Result<Vec<Uuid>> {
        scan_ids(&self.root)
    }
}
