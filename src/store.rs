//! Etag and offline-capsule storage contracts with in-memory and JSON-lines
//! implementations.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::descriptor::RequestDescriptor;
use crate::error::Error;
use crate::util::lock_unpoisoned;

pub trait EtagStore: Send + Sync {
    fn get(&self, base_url: &str, key: &str) -> Option<String>;

    fn upsert(&self, base_url: &str, key: &str, token: &str);
}

#[derive(Debug, Default)]
pub struct MemoryEtagStore {
    entries: Mutex<BTreeMap<(String, String), String>>,
}

impl MemoryEtagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EtagStore for MemoryEtagStore {
    fn get(&self, base_url: &str, key: &str) -> Option<String> {
        lock_unpoisoned(&self.entries)
            .get(&(base_url.to_owned(), key.to_owned()))
            .cloned()
    }

    fn upsert(&self, base_url: &str, key: &str, token: &str) {
        lock_unpoisoned(&self.entries)
            .insert((base_url.to_owned(), key.to_owned()), token.to_owned());
    }
}

/// A persisted request awaiting replay. `sequence` orders capsules FIFO.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OfflineCapsule {
    pub sequence: u64,
    pub descriptor: RequestDescriptor,
}

pub trait OfflineStore: Send + Sync {
    fn save(&self, descriptor: RequestDescriptor) -> crate::Result<OfflineCapsule>;

    /// Capsules currently persisted, oldest first.
    fn pending_capsules(&self) -> crate::Result<Vec<OfflineCapsule>>;

    /// Deletes the capsule with `sequence`. Returns whether it was present.
    fn remove(&self, sequence: u64) -> crate::Result<bool>;
}

#[derive(Debug, Default)]
struct MemoryOfflineState {
    next_sequence: u64,
    capsules: VecDeque<OfflineCapsule>,
}

#[derive(Debug, Default)]
pub struct MemoryOfflineStore {
    state: Mutex<MemoryOfflineState>,
}

impl MemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OfflineStore for MemoryOfflineStore {
    fn save(&self, descriptor: RequestDescriptor) -> crate::Result<OfflineCapsule> {
        let mut state = lock_unpoisoned(&self.state);
        let capsule = OfflineCapsule {
            sequence: state.next_sequence,
            descriptor,
        };
        state.next_sequence += 1;
        state.capsules.push_back(capsule.clone());
        Ok(capsule)
    }

    fn pending_capsules(&self) -> crate::Result<Vec<OfflineCapsule>> {
        Ok(lock_unpoisoned(&self.state).capsules.iter().cloned().collect())
    }

    fn remove(&self, sequence: u64) -> crate::Result<bool> {
        let mut state = lock_unpoisoned(&self.state);
        let Some(index) = state
            .capsules
            .iter()
            .position(|capsule| capsule.sequence == sequence)
        else {
            return Ok(false);
        };
        state.capsules.remove(index);
        Ok(true)
    }
}

/// Capsules stored one JSON document per line, appended in save order.
#[derive(Debug)]
pub struct JsonLinesOfflineStore {
    path: PathBuf,
    next_sequence: Mutex<u64>,
}

impl JsonLinesOfflineStore {
    /// Opens (or creates) the store at `path`, continuing the sequence after
    /// any capsules already on disk.
    pub fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| {
                Error::store_with_source(format!("create {}", parent.display()), source)
            })?;
        }
        let existing = read_capsules(&path)?;
        let next_sequence = existing
            .iter()
            .map(|capsule| capsule.sequence + 1)
            .max()
            .unwrap_or(0);
        Ok(Self {
            path,
            next_sequence: Mutex::new(next_sequence),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OfflineStore for JsonLinesOfflineStore {
    fn save(&self, descriptor: RequestDescriptor) -> crate::Result<OfflineCapsule> {
        let mut next_sequence = lock_unpoisoned(&self.next_sequence);
        let capsule = OfflineCapsule {
            sequence: *next_sequence,
            descriptor,
        };
        let mut line = serde_json::to_string(&capsule)
            .map_err(|source| Error::store_with_source("encode capsule", source))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| {
                Error::store_with_source(format!("open {}", self.path.display()), source)
            })?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|source| {
                Error::store_with_source(format!("append {}", self.path.display()), source)
            })?;

        *next_sequence += 1;
        Ok(capsule)
    }

    fn pending_capsules(&self) -> crate::Result<Vec<OfflineCapsule>> {
        let _guard = lock_unpoisoned(&self.next_sequence);
        read_capsules(&self.path)
    }

    fn remove(&self, sequence: u64) -> crate::Result<bool> {
        let _guard = lock_unpoisoned(&self.next_sequence);
        let mut capsules = read_capsules(&self.path)?;
        let before = capsules.len();
        capsules.retain(|capsule| capsule.sequence != sequence);
        if capsules.len() == before {
            return Ok(false);
        }
        self.rewrite(&capsules)?;
        Ok(true)
    }
}

impl JsonLinesOfflineStore {
    /// Replaces the file through a sibling temp file so a crash leaves either
    /// the old or the new capsule set on disk.
    fn rewrite(&self, capsules: &[OfflineCapsule]) -> crate::Result<()> {
        let mut contents = String::new();
        for capsule in capsules {
            let line = serde_json::to_string(capsule)
                .map_err(|source| Error::store_with_source("encode capsule", source))?;
            contents.push_str(&line);
            contents.push('\n');
        }

        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        std::fs::write(&staging, contents).map_err(|source| {
            Error::store_with_source(format!("write {}", staging.display()), source)
        })?;
        std::fs::rename(&staging, &self.path).map_err(|source| {
            Error::store_with_source(format!("replace {}", self.path.display()), source)
        })
    }
}

fn read_capsules(path: &Path) -> crate::Result<Vec<OfflineCapsule>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(Error::store_with_source(
                format!("open {}", path.display()),
                source,
            ));
        }
    };

    let mut capsules = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| {
            Error::store_with_source(format!("read {}", path.display()), source)
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let capsule: OfflineCapsule = serde_json::from_str(&line).map_err(|source| {
            Error::store_with_source(
                format!("decode capsule at {}:{}", path.display(), index + 1),
                source,
            )
        })?;
        capsules.push(capsule);
    }
    capsules.sort_by_key(|capsule| capsule.sequence);
    Ok(capsules)
}
