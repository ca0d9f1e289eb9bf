use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context as _, Result};
use log::{debug, info};

use super::{Key, OperationResult, Store};

const DATA_FILE: &str = "data.json";

/// In-memory hash map persisted as one JSON object: decimal keys, hex values.
pub struct PlainHash {
    path: PathBuf,
    entries: Mutex<HashMap<Key, Vec<u8>>>,
}

impl PlainHash {
    /// Opens the store in `dir`, loading `data.json` if it exists.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(DATA_FILE);
        let entries = if path.is_file() {
            load(&path)?
        } else {
            HashMap::new()
        };
        info!("plainhash: {} entries from {}", entries.len(), path.display());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Key, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn walk(&self, key: Key, length: usize, mut visit: impl FnMut(&[u8])) -> OperationResult {
        let entries = self.entries();
        let end = key.saturating_add(length as u64);
        let found = (key..end).filter_map(|k| entries.get(&k)).map(|v| visit(v)).count();
        OperationResult::ok(found)
    }
}

fn load(path: &Path) -> Result<HashMap<Key, Vec<u8>>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let raw: BTreeMap<String, String> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    raw.into_iter()
        .map(|(k, v)| {
            let key = k.parse::<Key>().with_context(|| format!("key {k:?}"))?;
            let value = hex::decode(&v).with_context(|| format!("value of key {k}"))?;
            Ok((key, value))
        })
        .collect()
}

impl Store for PlainHash {
    fn upsert(&self, key: Key, value: &[u8]) -> OperationResult {
        self.entries().insert(key, value.to_vec());
        OperationResult::ok(1)
    }

    fn update(&self, key: Key, value: &[u8]) -> OperationResult {
        match self.entries().get_mut(&key) {
            Some(slot) => {
                slot.clear();
                slot.extend_from_slice(value);
                OperationResult::ok(1)
            }
            None => OperationResult::not_found(),
        }
    }

    fn remove(&self, key: Key) -> OperationResult {
        match self.entries().remove(&key) {
            Some(_) => OperationResult::ok(1),
            None => OperationResult::not_found(),
        }
    }

    fn read(&self, key: Key, value: &mut Vec<u8>) -> OperationResult {
        value.clear();
        match self.entries().get(&key) {
            Some(v) => {
                value.extend_from_slice(v);
                OperationResult::ok(1)
            }
            None => OperationResult::not_found(),
        }
    }

    fn batch_upsert(&self, batch: &[(Key, &[u8])]) -> OperationResult {
        let mut entries = self.entries();
        for (key, value) in batch {
            entries.insert(*key, value.to_vec());
        }
        OperationResult::ok(batch.len())
    }

    fn batch_read(&self, keys: &[Key], values: &mut Vec<u8>) -> OperationResult {
        values.clear();
        let entries = self.entries();
        let mut found = 0;
        for v in keys.iter().filter_map(|k| entries.get(k)) {
            values.extend_from_slice(v);
            found += 1;
        }
        if found == keys.len() {
            OperationResult::ok(found)
        } else {
            OperationResult {
                entries_touched: found,
                ..OperationResult::not_found()
            }
        }
    }

    fn range_select(&self, key: Key, length: usize, values: &mut Vec<u8>) -> OperationResult {
        values.clear();
        self.walk(key, length, |v| values.extend_from_slice(v))
    }

    fn scan(&self, key: Key, length: usize, value: &mut Vec<u8>) -> OperationResult {
        self.walk(key, length, |v| {
            value.clear();
            value.extend_from_slice(v);
        })
    }

    fn flush(&self) -> Result<()> {
        let out: BTreeMap<String, String> = self
            .entries()
            .iter()
            .map(|(k, v)| (k.to_string(), hex::encode(v)))
            .collect();
        let text = serde_json::to_string_pretty(&out)?;
        fs::write(&self.path, text).with_context(|| format!("writing {}", self.path.display()))?;
        debug!("plainhash: flushed {} entries", out.len());
        Ok(())
    }

    fn size_on_disk(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}
