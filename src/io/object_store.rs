//! Filesystem object store and new-object watcher
//!
//! Objects live as plain files under `root/bucket/`, with their metadata
//! map in a `<file>.meta.json` sidecar written by the upload helper. The
//! watcher turns every newly stored image into one storage trigger.

use crate::domain::types::StoredObject;
use crate::io::collaborators::ObjectStore;
use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const METADATA_SUFFIX: &str = ".meta.json";

/// Storage notification that triggers the detector, one record per stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<StorageRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub s3: StorageEntity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntity {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Form-encoded key
    pub key: String,
}

impl StorageEvent {
    /// Build a single-record event, encoding the key
    pub fn for_object(bucket: &str, key: &str) -> Self {
        Self {
            records: vec![StorageRecord {
                s3: StorageEntity {
                    bucket: BucketRef { name: bucket.to_string() },
                    object: ObjectRef {
                        key: utf8_percent_encode(key, NON_ALPHANUMERIC).to_string(),
                    },
                },
            }],
        }
    }
}

/// Decode a form-encoded object key: `+` is a space, `%XX` is an escaped byte
pub fn decode_object_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Object store rooted at a directory whose subdirectories are buckets
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    /// Directory holding the objects of `bucket`
    pub fn bucket_dir(&self, bucket: &str) -> anyhow::Result<PathBuf> {
        let name = Path::new(bucket);
        let mut components = name.components();
        if !matches!((components.next(), components.next()), (Some(Component::Normal(_)), None)) {
            bail!("bucket {bucket:?} is not a plain directory name");
        }
        Ok(self.root.join(name))
    }

    /// Resolve `bucket/key` under the root, refusing anything that escapes it
    fn object_path(&self, bucket: &str, key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            bail!("object key {key:?} is not a plain relative path");
        }
        Ok(self.bucket_dir(bucket)?.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<StoredObject> {
        let path = self.object_path(bucket, key)?;
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read object {bucket}/{key}"))?;

        let meta_path = metadata_path(&path);
        let meta_json = tokio::fs::read_to_string(&meta_path)
            .await
            .with_context(|| format!("Failed to read metadata {}", meta_path.display()))?;
        let metadata: HashMap<String, String> = serde_json::from_str(&meta_json)
            .with_context(|| format!("Failed to parse metadata {}", meta_path.display()))?;

        debug!(bucket = %bucket, key = %key, bytes = bytes.len(), "object_read");
        Ok(StoredObject { bytes: Bytes::from(bytes), metadata })
    }
}

fn metadata_path(object_path: &Path) -> PathBuf {
    let mut name = object_path.as_os_str().to_owned();
    name.push(METADATA_SUFFIX);
    PathBuf::from(name)
}

/// Polls the store directory and emits one trigger per new image
pub struct ObjectWatcher {
    root: PathBuf,
    bucket: String,
    extension: String,
    scan_interval: Duration,
    seen: FxHashSet<String>,
}

impl ObjectWatcher {
    pub fn new<P: AsRef<Path>>(root: P, bucket: &str, extension: &str, scan_interval: Duration) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            bucket: bucket.to_string(),
            extension: extension.trim_start_matches('.').to_ascii_lowercase(),
            scan_interval,
            seen: FxHashSet::default(),
        }
    }

    /// Return keys of images not seen before whose metadata sidecar exists.
    /// Keys of removed images are forgotten, so a re-upload triggers again.
    pub async fn scan(&mut self) -> anyhow::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to list {}", self.root.display()))?;

        let mut present = FxHashSet::default();
        let mut fresh = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(key) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension));
            if !is_image {
                continue;
            }
            if self.seen.contains(&key) {
                present.insert(key);
                continue;
            }
            // The upload helper writes metadata after the image
            if !tokio::fs::try_exists(metadata_path(&path)).await.unwrap_or(false) {
                continue;
            }
            self.seen.insert(key.clone());
            present.insert(key.clone());
            fresh.push(key);
        }
        self.seen.retain(|key| present.contains(key));
        fresh.sort();
        Ok(fresh)
    }

    /// Scan until shutdown. Images present at startup are not triggered.
    pub async fn run(mut self, tx: mpsc::Sender<StorageEvent>, mut shutdown: watch::Receiver<bool>) {
        match self.scan().await {
            Ok(existing) => info!(dir = %self.root.display(), existing = existing.len(), "object_watcher_started"),
            Err(e) => warn!(dir = %self.root.display(), error = %e, "object_watcher_scan_failed"),
        }

        let mut interval = tokio::time::interval(self.scan_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("object_watcher_shutdown");
                        return;
                    }
                }
                _ = interval.tick() => {
                    let keys = match self.scan().await {
                        Ok(keys) => keys,
                        Err(e) => {
                            warn!(error = %e, "object_watcher_scan_failed");
                            continue;
                        }
                    };
                    for key in keys {
                        debug!(key = %key, "object_stored");
                        if tx.send(StorageEvent::for_object(&self.bucket, &key)).await.is_err() {
                            warn!("storage trigger channel closed");
                            return;
                        }
                    }
                }
            }
        }
    }
}
