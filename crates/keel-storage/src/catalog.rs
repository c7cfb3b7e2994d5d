// Small human-readable JSON files naming the topics of a broker and the
// subscriptions of a topic. Both are rewritten whole on every change.
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use keel_common::ids::SubscriptionId;
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: SubscriptionId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRecord {
    pub name: String,
}

/// Persistent name -> id list of a topic's subscriptions.
pub trait SubscriptionCatalog: Send {
    fn load(&self) -> Result<Vec<SubscriptionRecord>>;

    fn store(&mut self, records: &[SubscriptionRecord]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileSubscriptionCatalog {
    path: PathBuf,
}

impl FileSubscriptionCatalog {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            path: directory.as_ref().join("subscriptions.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SubscriptionCatalog for FileSubscriptionCatalog {
    fn load(&self) -> Result<Vec<SubscriptionRecord>> {
        load_json(&self.path)
    }

    fn store(&mut self, records: &[SubscriptionRecord]) -> Result<()> {
        store_json(&self.path, records)
    }
}

/// The list of topics a broker restores on startup.
#[derive(Debug, Clone)]
pub struct TopicCatalog {
    path: PathBuf,
}

impl TopicCatalog {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            path: directory.as_ref().join("topics.json"),
        }
    }

    pub fn load(&self) -> Result<Vec<TopicRecord>> {
        load_json(&self.path)
    }

    pub fn store(&self, records: &[TopicRecord]) -> Result<()> {
        store_json(&self.path, records)
    }
}

fn replacement_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("catalog");
    path.with_file_name(format!("{stem}_new.json"))
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let replacement = replacement_path(path);
    if !path.exists() && replacement.exists() {
        fs::rename(&replacement, path)?;
    }
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

// Write new, delete old, rename: a crash leaves either file complete.
fn store_json<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let replacement = replacement_path(path);
    let bytes = serde_json::to_vec_pretty(records)?;
    let mut file = fs::File::create(&replacement)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    fs::rename(&replacement, path)?;
    Ok(())
}
