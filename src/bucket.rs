//! Rank-partitioned record storage for one realm.
//!
//! Ranks `[start, start+size)` share a bucket, stored as `<start>to<end>/data.json`
//! under the realm directory. Every account lives in exactly one bucket: a
//! re-sighting at a rank in another bucket moves the record, pages and all.
//!
//! Moving a record touches two files that can't be replaced together, so a
//! flush writes in two passes. The first pass writes every dirty bucket with
//! its moved-out records still in it; once that is durable, the second pass
//! rewrites the buckets that lost records. A crash in between leaves a
//! duplicate, never a gap, and `open` folds duplicates back into one record.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::PathBuf,
    sync::Arc,
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

use crate::{parse::Entry, persist, Error, Result};

const BUCKET_FILE: &str = "data.json";

/// Stored form of one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub latest: Map<String, Value>,
    pub pages: BTreeSet<u32>,
}

impl Record {
    fn last_page(&self) -> u32 {
        self.pages.last().copied().unwrap_or(0)
    }
}

/// Bucket index of a 1-based rank.
pub fn bucket_key(rank: u32, bucket_size: u32) -> u32 {
    rank.max(1).saturating_sub(1) / bucket_size.max(1)
}

/// First and last rank (inclusive) held by bucket `key`.
pub fn bucket_bounds(key: u32, bucket_size: u32) -> (u64, u64) {
    let size = u64::from(bucket_size.max(1));
    let start = u64::from(key) * size + 1;
    (start, start + size - 1)
}

#[derive(Debug, Default)]
struct Bucket {
    records: BTreeMap<String, Record>,
    /// Records moved to another bucket since the last flush.
    departed: BTreeMap<String, Record>,
    dirty: bool,
    generation: u64,
}

impl Bucket {
    fn touch(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }

    /// Applies one sighting. Returns whether anything changed.
    fn merge(&mut self, entry: &Entry, page: u32) -> bool {
        let changed = match self.records.get_mut(&entry.id) {
            Some(record) => {
                let mut changed = record.pages.insert(page);
                if record.latest != entry.latest {
                    record.latest = entry.latest.clone();
                    changed = true;
                }
                changed
            }
            None => {
                self.records.insert(
                    entry.id.clone(),
                    Record {
                        latest: entry.latest.clone(),
                        pages: BTreeSet::from([page]),
                    },
                );
                true
            }
        };
        if changed {
            self.touch();
        }
        changed
    }

    fn take(&mut self, id: &str) -> Option<Record> {
        let record = self.records.remove(id)?;
        self.departed.insert(id.to_owned(), record.clone());
        self.touch();
        Some(record)
    }

    fn adopt(&mut self, id: &str, mut record: Record) {
        self.departed.remove(id);
        if let Some(existing) = self.records.remove(id) {
            record.pages.extend(existing.pages);
        }
        self.records.insert(id.to_owned(), record);
        self.touch();
    }
}

struct Snapshot {
    key: u32,
    bucket: Arc<Mutex<Bucket>>,
    generation: u64,
    full: Vec<u8>,
    trimmed: Option<Vec<u8>>,
    departed: BTreeMap<String, Record>,
}

/// Buckets of one realm, each behind its own lock.
pub struct BucketStore {
    root: PathBuf,
    bucket_size: u32,
    buckets: DashMap<u32, Arc<Mutex<Bucket>>>,
    /// id -> bucket key, the single place every account currently lives.
    index: DashMap<String, u32>,
    /// Upserts share it; `flush_dirty` takes it exclusively only while snapshotting.
    gate: RwLock<()>,
}

impl BucketStore {
    /// Opens the realm directory `root`, loading every bucket already on disk.
    pub fn open(root: impl Into<PathBuf>, bucket_size: u32) -> Result<Self> {
        if bucket_size == 0 {
            return Err(Error::Configuration("bucket size must be positive".into()));
        }
        let store = Self {
            root: root.into(),
            bucket_size,
            buckets: DashMap::new(),
            index: DashMap::new(),
            gate: RwLock::new(()),
        };

        for (key, path) in store.existing_buckets()? {
            let Some(records) = persist::read_json::<BTreeMap<String, Record>>(&path)? else {
                continue;
            };
            debug!(bucket = %path.display(), records = records.len(), "loaded bucket");
            let bucket = store.bucket(key);
            let mut bucket = bucket.lock();
            for (id, record) in records {
                store.load_record(key, &mut bucket, id, record);
            }
        }
        Ok(store)
    }

    /// Puts a record read from disk in place, folding a duplicate left by an interrupted move.
    fn load_record(&self, key: u32, bucket: &mut Bucket, id: String, mut record: Record) {
        let Some(other_key) = self.index.get(&id).map(|k| *k) else {
            self.index.insert(id.clone(), key);
            bucket.records.insert(id, record);
            return;
        };
        // Earlier buckets are already loaded and unlocked.
        let other = self.bucket(other_key);
        let mut other = other.lock();
        let Some(mut previous) = other.records.remove(&id) else {
            self.index.insert(id.clone(), key);
            bucket.records.insert(id, record);
            return;
        };
        warn!(%id, first = other_key, second = key, "account found in two buckets, merging");
        // Whichever copy keeps the union is rewritten if it gained pages,
        // the other bucket always is.
        if previous.last_page() > record.last_page() {
            if !record.pages.is_subset(&previous.pages) {
                previous.pages.extend(record.pages);
                other.touch();
            }
            other.records.insert(id, previous);
            bucket.touch();
        } else {
            if !previous.pages.is_subset(&record.pages) {
                record.pages.extend(previous.pages);
                bucket.touch();
            }
            other.touch();
            self.index.insert(id.clone(), key);
            bucket.records.insert(id, record);
        }
    }

    fn existing_buckets(&self) -> Result<Vec<(u32, PathBuf)>> {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        for item in dir {
            let item = item?;
            if !item.file_type()?.is_dir() {
                continue;
            }
            let name = item.file_name();
            let Some((start, end)) = name.to_str().and_then(parse_bucket_dir) else {
                continue;
            };
            let key = self.key_for_range(start, end).ok_or_else(|| {
                Error::Configuration(format!(
                    "bucket {start}to{end} in {} doesn't match bucket size {}",
                    self.root.display(),
                    self.bucket_size
                ))
            })?;
            found.push((key, item.path().join(BUCKET_FILE)));
        }
        found.sort();
        Ok(found)
    }

    fn key_for_range(&self, start: u64, end: u64) -> Option<u32> {
        let size = u64::from(self.bucket_size);
        if start == 0 || end + 1 != start + size || (start - 1) % size != 0 {
            return None;
        }
        u32::try_from((start - 1) / size).ok()
    }

    fn bucket(&self, key: u32) -> Arc<Mutex<Bucket>> {
        self.buckets.entry(key).or_default().value().clone()
    }

    pub fn bucket_path(&self, key: u32) -> PathBuf {
        let (start, end) = bucket_bounds(key, self.bucket_size);
        self.root.join(format!("{start}to{end}")).join(BUCKET_FILE)
    }

    /// Merges the entries seen on `page`. Returns how many records changed.
    pub fn upsert(&self, entries: &[Entry], page: u32) -> usize {
        let _gate = self.gate.read();
        let mut changed = 0;
        for entry in entries {
            let key = bucket_key(entry.rank, self.bucket_size);
            let mut slot = self.index.entry(entry.id.clone()).or_insert(key);
            let current = *slot;

            if current == key {
                if self.bucket(key).lock().merge(entry, page) {
                    changed += 1;
                }
                continue;
            }

            let (from, to) = (self.bucket(current), self.bucket(key));
            let (mut from, mut to) = if current < key {
                let from = from.lock();
                (from, to.lock())
            } else {
                let to = to.lock();
                (from.lock(), to)
            };
            if let Some(record) = from.take(&entry.id) {
                to.adopt(&entry.id, record);
            }
            to.merge(entry, page);
            *slot = key;
            changed += 1;
        }
        changed
    }

    /// Writes every dirty bucket. A bucket's dirty flag is cleared only once the
    /// content that was written is durable and nothing changed it meanwhile.
    pub fn flush_dirty(&self) -> Result<usize> {
        let snapshots = self.snapshot_dirty()?;
        if snapshots.is_empty() {
            return Ok(0);
        }

        for snap in &snapshots {
            persist::write(&self.bucket_path(snap.key), &snap.full)?;
        }
        for snap in &snapshots {
            if let Some(trimmed) = &snap.trimmed {
                persist::write(&self.bucket_path(snap.key), trimmed)?;
            }
        }

        for snap in &snapshots {
            let mut bucket = snap.bucket.lock();
            bucket
                .departed
                .retain(|id, record| snap.departed.get(id) != Some(&*record));
            if bucket.generation == snap.generation {
                bucket.dirty = false;
            }
        }
        Ok(snapshots.len())
    }

    fn snapshot_dirty(&self) -> Result<Vec<Snapshot>> {
        let _gate = self.gate.write();
        let mut handles: Vec<_> = self
            .buckets
            .iter()
            .map(|b| (*b.key(), b.value().clone()))
            .collect();
        handles.sort_by_key(|(key, _)| *key);

        let mut snapshots = Vec::new();
        for (key, handle) in handles {
            let bucket = handle.lock();
            if !bucket.dirty {
                continue;
            }
            let (full, trimmed) = if bucket.departed.is_empty() {
                (persist::to_json_bytes(&bucket.records)?, None)
            } else {
                let mut all = bucket.records.clone();
                for (id, record) in &bucket.departed {
                    all.entry(id.clone()).or_insert_with(|| record.clone());
                }
                (
                    persist::to_json_bytes(&all)?,
                    Some(persist::to_json_bytes(&bucket.records)?),
                )
            };
            let generation = bucket.generation;
            let departed = bucket.departed.clone();
            drop(bucket);
            snapshots.push(Snapshot {
                key,
                bucket: handle,
                generation,
                full,
                trimmed,
                departed,
            });
        }
        Ok(snapshots)
    }

    /// `flush_dirty` on the blocking pool.
    pub async fn flush_dirty_async(self: &Arc<Self>) -> Result<usize> {
        let store = self.clone();
        spawn_blocking(move || store.flush_dirty()).await?
    }

    /// Where an account currently lives and its record.
    pub fn get(&self, id: &str) -> Option<(u32, Record)> {
        let key = *self.index.get(id)?;
        let record = self.bucket(key).lock().records.get(id).cloned()?;
        Some((key, record))
    }

    /// Copy of one bucket's records.
    pub fn records(&self, key: u32) -> BTreeMap<String, Record> {
        self.buckets
            .get(&key)
            .map(|b| b.lock().records.clone())
            .unwrap_or_default()
    }

    /// Keys of all buckets holding at least one record, ascending.
    pub fn keys(&self) -> Vec<u32> {
        let mut keys: Vec<_> = self
            .buckets
            .iter()
            .filter(|b| !b.value().lock().records.is_empty())
            .map(|b| *b.key())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Number of distinct accounts.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.buckets.iter().filter(|b| b.value().lock().dirty).count()
    }
}

fn parse_bucket_dir(name: &str) -> Option<(u64, u64)> {
    let (start, end) = name.split_once("to")?;
    Some((start.parse().ok()?, end.parse().ok()?))
}
