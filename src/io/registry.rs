//! File-backed vehicle registry
//!
//! The registry file is TOML with one `[[vehicle]]` table per record, or a
//! DMV XML export (`<dmv><vehicle plate="..">..</vehicle></dmv>`) when the
//! path ends in `.xml`. Either way it is indexed by plate on load. With a zero staleness bound every lookup checks
//! the file fingerprint (mtime + length) and reloads on change, so lookups
//! always observe the latest data. A positive bound skips the check until
//! the bound elapses.

use crate::domain::types::{Owner, VehicleRecord};
use crate::io::collaborators::Registry;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "vehicle")]
    vehicles: Vec<VehicleRecord>,
}

#[derive(Debug, Deserialize)]
struct DmvFile {
    #[serde(default, rename = "vehicle")]
    vehicles: Vec<DmvVehicle>,
}

#[derive(Debug, Deserialize)]
struct DmvVehicle {
    #[serde(rename = "@plate")]
    plate: String,
    #[serde(default)]
    make: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    color: String,
    owner: DmvOwner,
}

#[derive(Debug, Deserialize)]
struct DmvOwner {
    #[serde(default)]
    name: String,
    #[serde(default)]
    contact: String,
}

impl From<DmvVehicle> for VehicleRecord {
    fn from(v: DmvVehicle) -> Self {
        Self {
            plate: v.plate.trim().to_string(),
            make: v.make,
            model: v.model,
            color: v.color,
            owner: Owner { name: v.owner.name, contact: v.owner.contact },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Xml,
}

impl Format {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("xml") => Format::Xml,
            _ => Format::Toml,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

struct Snapshot {
    index: FxHashMap<String, VehicleRecord>,
    fingerprint: Fingerprint,
    checked_at: Instant,
}

/// Parse registry TOML and index by plate. The first record for a plate wins.
pub fn parse_registry(content: &str) -> anyhow::Result<FxHashMap<String, VehicleRecord>> {
    let file: RegistryFile = toml::from_str(content).context("Failed to parse registry")?;
    let mut index = FxHashMap::default();
    for record in file.vehicles {
        index.entry(record.plate.clone()).or_insert(record);
    }
    Ok(index)
}

/// Parse a DMV XML export and index by plate. The first record for a plate wins.
pub fn parse_registry_xml(content: &str) -> anyhow::Result<FxHashMap<String, VehicleRecord>> {
    let file: DmvFile = quick_xml::de::from_str(content).context("Failed to parse XML registry")?;
    let mut index = FxHashMap::default();
    for record in file.vehicles.into_iter().map(VehicleRecord::from) {
        index.entry(record.plate.clone()).or_insert(record);
    }
    Ok(index)
}

pub struct FileRegistry {
    path: PathBuf,
    format: Format,
    staleness: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl FileRegistry {
    pub fn new<P: AsRef<Path>>(path: P, staleness: Duration) -> Self {
        let path = path.as_ref().to_path_buf();
        let format = Format::for_path(&path);
        Self { path, format, staleness, snapshot: RwLock::new(None) }
    }

    async fn fingerprint(&self) -> anyhow::Result<Fingerprint> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("Failed to stat registry {}", self.path.display()))?;
        Ok(Fingerprint { modified: meta.modified().ok(), len: meta.len() })
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        let now = Instant::now();
        let within_bound = {
            let guard = self.snapshot.read();
            guard.as_ref().is_some_and(|s| {
                !self.staleness.is_zero() && now.duration_since(s.checked_at) < self.staleness
            })
        };
        if within_bound {
            return Ok(());
        }

        let fingerprint = self.fingerprint().await?;
        let unchanged = {
            let mut guard = self.snapshot.write();
            match guard.as_mut() {
                Some(s) if fingerprint.modified.is_some() && s.fingerprint == fingerprint => {
                    s.checked_at = now;
                    true
                }
                _ => false,
            }
        };
        if unchanged {
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read registry {}", self.path.display()))?;
        let index = match self.format {
            Format::Toml => parse_registry(&content)?,
            Format::Xml => parse_registry_xml(&content)?,
        };
        info!(path = %self.path.display(), records = index.len(), "registry_loaded");
        *self.snapshot.write() = Some(Snapshot { index, fingerprint, checked_at: now });
        Ok(())
    }
}

#[async_trait]
impl Registry for FileRegistry {
    async fn lookup(&self, plate: &str) -> anyhow::Result<Option<VehicleRecord>> {
        self.refresh().await?;
        let record = self.snapshot.read().as_ref().and_then(|s| s.index.get(plate).cloned());
        debug!(plate = %plate, found = record.is_some(), "registry_lookup");
        Ok(record)
    }
}
