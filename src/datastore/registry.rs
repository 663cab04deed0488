//! Authoritative table of backed up files.
//!
//! Uploads go through a two phase lifecycle: [DataStore::reserve] claims a
//! filename and creates the on-disk file, [DataStore::commit] publishes the
//! finished upload (only committed files are visible to listings, downloads
//! and deletes), [DataStore::release] rolls a failed upload back. A snapshot
//! thread persists the committed set to a JSON file whenever it changes, and
//! startup reconciles that snapshot with the backup directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::{format_err, Context, Error};
use bytes::Bytes;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use cbs_tools::time::epoch_i64;

use super::PrefixCache;

lazy_static! {
    static ref FILENAME_REGEX: regex::Regex =
        regex::Regex::new(r"^[^\x00-\x1f\x7f/\\]+$").unwrap();
}

/// Check a client supplied filename.
///
/// Accepted names are 1..=255 bytes, contain no path separators, no control
/// bytes, and do not start with a dot (which also rules out `.` and `..`).
pub fn check_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && FILENAME_REGEX.is_match(name)
}

/// Stored attributes of a committed file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "filename")]
    pub name: String,
    pub size: i64,
    pub time: i64,
}

/// A committed file entry shared between workers.
///
/// The embedded lock serializes access to the on-disk bytes: downloads hold
/// it shared while reading, delete holds it exclusively while unlinking.
pub struct FileEntry {
    pub info: FileInfo,
    pub lock: RwLock<()>,
}

enum Slot {
    /// Filename claimed by a running upload, not yet visible.
    Reserved,
    Committed(Arc<FileEntry>),
}

impl Slot {
    fn committed(&self) -> Option<&Arc<FileEntry>> {
        match self {
            Slot::Committed(entry) => Some(entry),
            Slot::Reserved => None,
        }
    }
}

/// The file metadata registry.
pub struct DataStore {
    backup_dir: PathBuf,
    snapshot_path: PathBuf,
    table: RwLock<HashMap<String, Slot>>,
    dirty: Mutex<bool>,
    dirty_cond: Condvar,
    cache: PrefixCache,
}

impl DataStore {
    /// Open the registry: load the snapshot, reconcile it with the backup
    /// directory and start the snapshot thread.
    pub fn open(
        backup_dir: impl Into<PathBuf>,
        snapshot_path: impl Into<PathBuf>,
        cache_capacity: usize,
        cache_entry_size: usize,
    ) -> Result<Arc<Self>, Error> {
        let backup_dir = backup_dir.into();
        let snapshot_path = snapshot_path.into();

        std::fs::create_dir_all(&backup_dir)
            .with_context(|| format!("unable to create backup directory {:?}", backup_dir))?;
        if let Some(parent) = snapshot_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("unable to create directory {:?}", parent))?;
            }
        }

        let store = Arc::new(Self {
            backup_dir,
            snapshot_path,
            table: RwLock::new(HashMap::new()),
            dirty: Mutex::new(false),
            dirty_cond: Condvar::new(),
            cache: PrefixCache::new(cache_capacity, cache_entry_size),
        });

        store.load_snapshot()?;
        store.reconcile()?;

        // persist the reconciled state right away so a crash before the
        // first commit does not resurrect dropped rows
        if *store.dirty.lock().unwrap() {
            store.snapshot_now()?;
        }

        let weak = Arc::downgrade(&store);
        std::thread::Builder::new()
            .name("snapshot".to_string())
            .spawn(move || snapshot_thread(weak))
            .map_err(|err| format_err!("unable to start snapshot thread - {}", err))?;

        let count = store.table.read().unwrap().len();
        log::info!("datastore initialized, {} files", count);

        Ok(store)
    }

    /// Absolute path of the backup file for `name`.
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.backup_dir.join(name)
    }

    /// Claim `name` for an upload and create (or truncate) the on-disk file.
    ///
    /// Fails if the name is invalid or already present, reserved or
    /// committed; concurrent uploads of one filename are serialized by
    /// whoever wins this call.
    pub fn reserve(&self, name: &str) -> bool {
        if !check_filename(name) {
            log::warn!("reserve error, invalid filename: {:?}", name);
            return false;
        }
        let mut table = self.table.write().unwrap();
        if table.contains_key(name) {
            log::info!("reserve error, file already present: {}", name);
            return false;
        }
        if let Err(err) = std::fs::File::create(self.file_path(name)) {
            log::warn!("reserve error, unable to create file {} - {}", name, err);
            return false;
        }
        table.insert(name.to_string(), Slot::Reserved);
        true
    }

    /// Roll back a reserved upload: drop the claim and the on-disk file.
    pub fn release(&self, name: &str) -> bool {
        let mut table = self.table.write().unwrap();
        match table.get(name) {
            Some(Slot::Reserved) => {
                table.remove(name);
            }
            _ => {
                log::warn!("release error, file not reserved: {}", name);
                return false;
            }
        }
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => {
                log::error!("release error, unable to remove file {} - {}", name, err);
                false
            }
        }
    }

    /// Publish a finished upload of `size` bytes.
    pub fn commit(&self, name: &str, size: i64) -> bool {
        let mut table = self.table.write().unwrap();
        match table.get(name) {
            Some(Slot::Reserved) => (),
            Some(Slot::Committed(_)) => {
                log::warn!("commit error, file already committed: {}", name);
                return false;
            }
            None => {
                log::warn!("commit error, file not reserved: {}", name);
                return false;
            }
        }
        let entry = Arc::new(FileEntry {
            info: FileInfo {
                name: name.to_string(),
                size,
                time: epoch_i64(),
            },
            lock: RwLock::new(()),
        });
        table.insert(name.to_string(), Slot::Committed(entry));
        self.mark_dirty();
        true
    }

    /// Remove a committed file and its metadata.
    pub fn delete(&self, name: &str) -> bool {
        let mut table = self.table.write().unwrap();
        let entry = match table.get(name).and_then(Slot::committed) {
            Some(entry) => Arc::clone(entry),
            None => {
                log::warn!("delete error, file not found: {}", name);
                return false;
            }
        };

        self.cache.remove(name);

        let mut ok = true;
        {
            let _guard = entry.lock.write().unwrap();
            match std::fs::remove_file(self.file_path(name)) {
                Ok(()) => (),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                Err(err) => {
                    log::error!("delete error, unable to remove file {} - {}", name, err);
                    ok = false;
                }
            }
        }

        table.remove(name);
        self.mark_dirty();
        ok
    }

    /// Look up a committed file.
    pub fn lookup(&self, name: &str) -> Option<Arc<FileEntry>> {
        if !check_filename(name) {
            return None;
        }
        let table = self.table.read().unwrap();
        table.get(name).and_then(Slot::committed).cloned()
    }

    /// Attributes of all committed files, sorted by name.
    pub fn list(&self) -> Vec<FileInfo> {
        let table = self.table.read().unwrap();
        let mut infos: Vec<FileInfo> = table
            .values()
            .filter_map(|slot| slot.committed().map(|entry| entry.info.clone()))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Cached head bytes of a committed file.
    pub fn prefix_get(&self, name: &str) -> Option<Bytes> {
        self.lookup(name)?;
        self.cache.get(name)
    }

    /// Cache the head bytes of a committed file.
    pub fn prefix_put(&self, name: &str, data: &[u8]) {
        if self.lookup(name).is_none() {
            log::warn!("prefix cache put rejected, file not committed: {}", name);
            return;
        }
        self.cache.put(name, data);
    }

    fn mark_dirty(&self) {
        let mut dirty = self.dirty.lock().unwrap();
        *dirty = true;
        self.dirty_cond.notify_all();
    }

    /// Serialize all committed entries to the snapshot file and clear the
    /// dirty flag. Runs on the snapshot thread; also used directly by
    /// startup and tests.
    pub fn snapshot_now(&self) -> Result<(), Error> {
        let data = {
            let table = self.table.read().unwrap();
            let mut infos: Vec<FileInfo> = table
                .values()
                .filter_map(|slot| slot.committed().map(|entry| entry.info.clone()))
                .collect();
            infos.sort_by(|a, b| a.name.cmp(&b.name));

            // clear while still holding the table lock, so a commit racing
            // with this pass is never lost
            *self.dirty.lock().unwrap() = false;

            serde_json::to_vec(&infos)?
        };

        cbs_tools::fs::replace_file(&self.snapshot_path, &data)
            .context("unable to write snapshot file")
    }

    fn load_snapshot(&self) -> Result<(), Error> {
        let raw = match std::fs::read_to_string(&self.snapshot_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(format_err!(
                    "unable to read snapshot {:?} - {}",
                    self.snapshot_path,
                    err
                ))
            }
        };
        if raw.trim().is_empty() {
            return Ok(());
        }

        let rows: Vec<serde_json::Value> = serde_json::from_str(&raw)
            .with_context(|| format!("unable to parse snapshot {:?}", self.snapshot_path))?;

        let mut table = self.table.write().unwrap();
        for row in rows {
            let info: FileInfo = match serde_json::from_value(row) {
                Ok(info) => info,
                Err(err) => {
                    log::warn!("skipping malformed snapshot row - {}", err);
                    continue;
                }
            };
            if info.name.is_empty() || info.size < 0 {
                log::warn!("skipping invalid snapshot row: {:?}", info.name);
                continue;
            }
            let name = info.name.clone();
            let entry = Arc::new(FileEntry {
                info,
                lock: RwLock::new(()),
            });
            table.insert(name, Slot::Committed(entry));
        }
        Ok(())
    }

    /// Make the snapshot and the backup directory agree: files on disk
    /// without a snapshot row are leftovers of crashed uploads and get
    /// removed, snapshot rows without a file are dropped.
    fn reconcile(&self) -> Result<(), Error> {
        let on_disk = cbs_tools::fs::scan_dir_filenames(&self.backup_dir)?;

        let mut table = self.table.write().unwrap();
        let mut present = std::collections::HashSet::new();
        for name in on_disk {
            if table.contains_key(&name) {
                present.insert(name);
            } else {
                log::warn!("removing stray file without metadata: {}", name);
                if let Err(err) = std::fs::remove_file(self.backup_dir.join(&name)) {
                    log::warn!("unable to remove stray file {} - {}", name, err);
                }
            }
        }

        let missing: Vec<String> = table
            .keys()
            .filter(|name| !present.contains(*name))
            .cloned()
            .collect();
        for name in missing {
            log::warn!("dropping metadata of missing file: {}", name);
            table.remove(&name);
            *self.dirty.lock().unwrap() = true;
        }
        Ok(())
    }
}

fn snapshot_thread(store: Weak<DataStore>) {
    loop {
        let store = match store.upgrade() {
            Some(store) => store,
            None => break,
        };

        let is_dirty = {
            let guard = store.dirty.lock().unwrap();
            let (guard, _timeout) = store
                .dirty_cond
                .wait_timeout_while(guard, Duration::from_millis(500), |dirty| !*dirty)
                .unwrap();
            *guard
        };

        if is_dirty {
            if let Err(err) = store.snapshot_now() {
                log::warn!("snapshot pass failed - {}", err);
            }
        }
        // drop our reference each round so the store can go away
    }
}
