//! Durable keyed/indexed store for sessions, points and the sync queue.
//!
//! Every collection is an append-only JSON Lines log under the store root,
//! replayed into memory on open. Every log has a sibling `.lock` file that is
//! never renamed: appends and compaction hold it exclusively, so several
//! processes can write the same log without interleaving lines or losing
//! records to a concurrent rewrite.
//! A batch is written as a single log record: a torn write loses the whole
//! batch, never part of it.

use crate::{Error, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;

/// Items stored in a collection expose their primary key
pub trait Keyed {
    fn key(&self) -> String;
}

/// Names of the collections in the default layout
pub mod collections {
    pub const SESSIONS: &str = "sessions";
    pub const POINTS: &str = "points";
    pub const HEART_RATE_READINGS: &str = "heartRateReadings";
    pub const SYNC_QUEUE: &str = "syncQueue";
    pub const CACHE: &str = "cache";
}

/// Declares a collection and the top-level fields it is indexed by
#[derive(Clone, Debug)]
pub struct CollectionSpec {
    pub name: String,
    pub indexes: Vec<String>,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn indexed(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(field.into());
        self
    }
}

/// The collections used by sessions, samplers and the sync queue
pub fn default_layout() -> Vec<CollectionSpec> {
    vec![
        CollectionSpec::new(collections::SESSIONS).indexed("state"),
        CollectionSpec::new(collections::POINTS).indexed("session_id"),
        CollectionSpec::new(collections::HEART_RATE_READINGS).indexed("session_id"),
        CollectionSpec::new(collections::SYNC_QUEUE)
            .indexed("entity_kind")
            .indexed("entity_id")
            .indexed("status"),
        CollectionSpec::new(collections::CACHE),
    ]
}

// ============================================================================
// Log records
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct BatchEntry {
    key: String,
    item: Value,
}

/// One line of a collection log
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Upsert { key: String, item: Value },
    Delete { key: String },
    Clear,
    Batch { entries: Vec<BatchEntry> },
}

// ============================================================================
// In-memory collection state
// ============================================================================

struct Entry {
    /// First-insertion sequence; replacing an item keeps its position
    seq: u64,
    item: Value,
}

struct Collection {
    spec: CollectionSpec,
    path: PathBuf,
    lock_path: PathBuf,
    items: HashMap<String, Entry>,
    /// index field -> indexed value -> (seq, key)
    indexes: HashMap<String, HashMap<String, BTreeSet<(u64, String)>>>,
    next_seq: u64,
    log_records: usize,
}

fn index_value(item: &Value, field: &str) -> Option<String> {
    match item.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl Collection {
    fn new(spec: CollectionSpec, root: &Path) -> Self {
        let path = root.join(format!("{}.log", spec.name));
        let lock_path = root.join(format!("{}.lock", spec.name));
        let indexes = spec
            .indexes
            .iter()
            .map(|field| (field.clone(), HashMap::new()))
            .collect();
        Self {
            spec,
            path,
            lock_path,
            items: HashMap::new(),
            indexes,
            next_seq: 0,
            log_records: 0,
        }
    }

    fn unindex(&mut self, key: &str) {
        if let Some(entry) = self.items.get(key) {
            for (field, values) in self.indexes.iter_mut() {
                if let Some(value) = index_value(&entry.item, field) {
                    if let Some(keys) = values.get_mut(&value) {
                        keys.remove(&(entry.seq, key.to_string()));
                        if keys.is_empty() {
                            values.remove(&value);
                        }
                    }
                }
            }
        }
    }

    fn apply_upsert(&mut self, key: String, item: Value) {
        let seq = match self.items.get(&key) {
            Some(existing) => existing.seq,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                seq
            }
        };
        self.unindex(&key);
        for (field, values) in self.indexes.iter_mut() {
            if let Some(value) = index_value(&item, field) {
                values.entry(value).or_default().insert((seq, key.clone()));
            }
        }
        self.items.insert(key, Entry { seq, item });
    }

    fn apply_delete(&mut self, key: &str) -> bool {
        self.unindex(key);
        self.items.remove(key).is_some()
    }

    fn apply_clear(&mut self) {
        self.items.clear();
        for values in self.indexes.values_mut() {
            values.clear();
        }
    }

    fn apply(&mut self, record: LogRecord) {
        match record {
            LogRecord::Upsert { key, item } => self.apply_upsert(key, item),
            LogRecord::Delete { key } => {
                self.apply_delete(&key);
            }
            LogRecord::Clear => self.apply_clear(),
            LogRecord::Batch { entries } => {
                for entry in entries {
                    self.apply_upsert(entry.key, entry.item);
                }
            }
        }
        self.log_records += 1;
    }

    /// Open the collection's lock file and lock it
    fn lock(&self, exclusive: bool) -> Result<File> {
        let ctx = self.lock_path.display().to_string();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| Error::unavailable(&ctx, e))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|e| Error::unavailable(&ctx, e))?;
        Ok(file)
    }

    /// Replay the collection log, skipping corrupted or torn lines
    fn replay(&mut self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let lock = self.lock(false)?;
        let result = self.replay_locked();
        let _ = lock.unlock();
        result
    }

    /// Caller holds the lock file
    fn replay_locked(&mut self) -> Result<()> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::unavailable(self.path.display(), e)),
        };

        let reader = BufReader::new(&file);
        let mut skipped = 0usize;
        for (line_num, line_result) in reader.lines().enumerate() {
            let line = match line_result {
                Ok(line) => line,
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    tracing::warn!("Skipping undecodable line {} in {:?}", line_num + 1, self.path);
                    skipped += 1;
                    continue;
                }
                Err(e) => return Err(Error::unavailable(self.path.display(), e)),
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => self.apply(record),
                Err(e) => {
                    tracing::warn!(
                        "Skipping corrupted record in {:?} at line {}: {}",
                        self.path,
                        line_num + 1,
                        e
                    );
                    skipped += 1;
                }
            }
        }

        tracing::debug!(
            "Replayed {} records ({} skipped) into collection {}",
            self.log_records,
            skipped,
            self.spec.name
        );
        Ok(())
    }

    /// Drop the in-memory view and rebuild it from the log on disk
    ///
    /// Caller holds the lock file exclusively.
    fn reload_locked(&mut self) -> Result<()> {
        self.apply_clear();
        self.next_seq = 0;
        self.log_records = 0;
        self.replay_locked()
    }

    /// Append one record as a single line under an exclusive lock
    fn append(&mut self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let ctx = self.path.display().to_string();

        // The log is opened only after the lock is held, so a compaction that
        // renamed a new log into place is never appended to behind its back.
        let lock = self.lock(true)?;
        let result = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&self.path)?;
            // A crash may have left a torn last line; terminate it so this
            // record is not glued onto it.
            let len = file.metadata()?.len();
            let mut prefix = "";
            if len > 0 {
                let mut last = [0u8; 1];
                file.seek(SeekFrom::Start(len - 1))?;
                file.read_exact(&mut last)?;
                if last[0] != b'\n' {
                    prefix = "\n";
                }
            }
            let mut buf = Vec::with_capacity(prefix.len() + line.len() + 1);
            buf.extend_from_slice(prefix.as_bytes());
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
            file.write_all(&buf)?;
            file.sync_data()
        })();

        let _ = lock.unlock();
        result.map_err(|e| Error::unavailable(&ctx, e))?;
        self.log_records += 1;
        Ok(())
    }

    fn get_index(&self, index: &str) -> Result<&HashMap<String, BTreeSet<(u64, String)>>> {
        self.indexes.get(index).ok_or_else(|| Error::UnknownIndex {
            collection: self.spec.name.clone(),
            index: index.to_string(),
        })
    }

    fn ordered_entries(&self) -> Vec<(&String, &Value)> {
        let mut entries: Vec<(&String, &Entry)> = self.items.iter().collect();
        entries.sort_by_key(|(_, e)| e.seq);
        entries.into_iter().map(|(key, e)| (key, &e.item)).collect()
    }

    fn ordered_values(&self) -> Vec<&Value> {
        self.ordered_entries().into_iter().map(|(_, item)| item).collect()
    }

    fn duplicate(&self, key: &str) -> Error {
        Error::DuplicateKey {
            collection: self.spec.name.clone(),
            key: key.to_string(),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Process-durable collections shared by sessions and the sync queue
///
/// Each collection has its own lock: a batch write to `points` never waits
/// on a drain touching `syncQueue`. There are no cross-collection
/// transactions.
pub struct Store {
    root: PathBuf,
    collections: HashMap<String, Mutex<Collection>>,
}

fn to_entry<T: Serialize + Keyed>(item: &T) -> Result<(String, Value)> {
    Ok((item.key(), serde_json::to_value(item)?))
}

impl Store {
    /// Open (or create) a store rooted at `root` with the given collections
    pub fn open(root: impl Into<PathBuf>, specs: Vec<CollectionSpec>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| Error::unavailable(root.display(), e))?;

        let mut collections = HashMap::new();
        for spec in specs {
            let name = spec.name.clone();
            let mut collection = Collection::new(spec, &root);
            collection.replay()?;
            collections.insert(name, Mutex::new(collection));
        }

        tracing::info!("Opened store at {:?} ({} collections)", root, collections.len());
        Ok(Self { root, collections })
    }

    /// Open a store with the default session/points/sync layout
    pub fn open_default(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open(root, default_layout())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection(&self, name: &str) -> Result<MutexGuard<'_, Collection>> {
        let lock = self
            .collections
            .get(name)
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))?;
        lock.lock()
            .map_err(|_| Error::StoreUnavailable(format!("collection {} lock poisoned", name)))
    }

    /// Insert an item, failing if the key already exists
    pub fn put<T: Serialize + Keyed>(&self, collection: &str, item: &T) -> Result<()> {
        let (key, item) = to_entry(item)?;
        let mut coll = self.collection(collection)?;
        if coll.items.contains_key(&key) {
            return Err(coll.duplicate(&key));
        }
        let record = LogRecord::Upsert { key, item };
        coll.append(&record)?;
        if let LogRecord::Upsert { key, item } = record {
            coll.apply_upsert(key, item);
        }
        Ok(())
    }

    /// Insert or replace an item
    pub fn upsert<T: Serialize + Keyed>(&self, collection: &str, item: &T) -> Result<()> {
        let (key, item) = to_entry(item)?;
        let mut coll = self.collection(collection)?;
        let record = LogRecord::Upsert { key, item };
        coll.append(&record)?;
        if let LogRecord::Upsert { key, item } = record {
            coll.apply_upsert(key, item);
        }
        Ok(())
    }

    /// Insert every item as one atomic unit; fails without writing if any
    /// key already exists or repeats within the batch
    pub fn put_batch<T: Serialize + Keyed>(&self, collection: &str, items: &[T]) -> Result<()> {
        let entries = items
            .iter()
            .map(|item| to_entry(item).map(|(key, item)| BatchEntry { key, item }))
            .collect::<Result<Vec<_>>>()?;

        let mut coll = self.collection(collection)?;
        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            if coll.items.contains_key(&entry.key) || !seen.insert(entry.key.as_str()) {
                return Err(coll.duplicate(&entry.key));
            }
        }
        Self::write_batch(&mut coll, entries)
    }

    /// Insert-or-replace every item as one atomic unit
    ///
    /// Replaying the same batch leaves exactly one copy of each item.
    pub fn upsert_batch<T: Serialize + Keyed>(&self, collection: &str, items: &[T]) -> Result<()> {
        let entries = items
            .iter()
            .map(|item| to_entry(item).map(|(key, item)| BatchEntry { key, item }))
            .collect::<Result<Vec<_>>>()?;
        let mut coll = self.collection(collection)?;
        Self::write_batch(&mut coll, entries)
    }

    fn write_batch(coll: &mut Collection, entries: Vec<BatchEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let count = entries.len();
        let record = LogRecord::Batch { entries };
        coll.append(&record)?;
        if let LogRecord::Batch { entries } = record {
            for entry in entries {
                coll.apply_upsert(entry.key, entry.item);
            }
        }
        tracing::debug!("Wrote batch of {} items to {}", count, coll.spec.name);
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
        let coll = self.collection(collection)?;
        match coll.items.get(key) {
            Some(entry) => Ok(Some(serde_json::from_value(entry.item.clone())?)),
            None => Ok(None),
        }
    }

    /// Items whose indexed field equals `value`, in first-insertion order
    pub fn query<T: DeserializeOwned>(
        &self,
        collection: &str,
        index: &str,
        value: &str,
    ) -> Result<Vec<T>> {
        let coll = self.collection(collection)?;
        let Some(keys) = coll.get_index(index)?.get(value) else {
            return Ok(Vec::new());
        };
        keys.iter()
            .filter_map(|(_, key)| coll.items.get(key))
            .map(|entry| Ok(serde_json::from_value(entry.item.clone())?))
            .collect()
    }

    /// Every item in first-insertion order
    pub fn all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let coll = self.collection(collection)?;
        coll.ordered_values()
            .into_iter()
            .map(|item| Ok(serde_json::from_value(item.clone())?))
            .collect()
    }

    pub fn len(&self, collection: &str) -> Result<usize> {
        Ok(self.collection(collection)?.items.len())
    }

    /// Remove an item; returns whether it existed
    pub fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let mut coll = self.collection(collection)?;
        if !coll.items.contains_key(key) {
            return Ok(false);
        }
        coll.append(&LogRecord::Delete {
            key: key.to_string(),
        })?;
        Ok(coll.apply_delete(key))
    }

    pub fn clear(&self, collection: &str) -> Result<()> {
        let mut coll = self.collection(collection)?;
        coll.append(&LogRecord::Clear)?;
        coll.apply_clear();
        Ok(())
    }

    /// Rewrite a collection log as a snapshot of its live items
    ///
    /// Runs under the collection's exclusive lock: the log is re-read first,
    /// so records appended by other processes since this store was opened
    /// are kept. The snapshot is written to a temp file, synced, then
    /// renamed over the log.
    pub fn compact(&self, collection: &str) -> Result<()> {
        let mut coll = self.collection(collection)?;
        let lock = coll.lock(true)?;
        let result = Self::compact_locked(&self.root, &mut coll);
        let _ = lock.unlock();
        result
    }

    fn compact_locked(root: &Path, coll: &mut Collection) -> Result<()> {
        let ctx = coll.path.display().to_string();
        coll.reload_locked()?;
        let before = coll.log_records;

        let temp = NamedTempFile::new_in(root).map_err(|e| Error::unavailable(&ctx, e))?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            for (key, item) in coll.ordered_entries() {
                let record = LogRecord::Upsert {
                    key: key.clone(),
                    item: item.clone(),
                };
                let line = serde_json::to_string(&record)?;
                writer
                    .write_all(line.as_bytes())
                    .and_then(|_| writer.write_all(b"\n"))
                    .map_err(|e| Error::unavailable(&ctx, e))?;
            }
            writer.flush().map_err(|e| Error::unavailable(&ctx, e))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| Error::unavailable(&ctx, e))?;
        temp.persist(&coll.path)
            .map_err(|e| Error::unavailable(&ctx, e.error))?;

        coll.log_records = coll.items.len();
        tracing::info!(
            "Compacted {} from {} to {} records",
            coll.spec.name,
            before,
            coll.log_records
        );
        Ok(())
    }

    /// Compact every collection whose log has grown past `threshold` records
    pub fn compact_if_needed(&self, threshold: usize) -> Result<usize> {
        let mut names: Vec<&String> = self.collections.keys().collect();
        names.sort();
        let mut compacted = 0;
        for name in names {
            let records = self.collection(name)?.log_records;
            if records > threshold {
                self.compact(name)?;
                compacted += 1;
            }
        }
        Ok(compacted)
    }
}
