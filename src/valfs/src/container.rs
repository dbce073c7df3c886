use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use valtown_lib::ValTownApi;

use crate::blob_upload::UploadTimeouts;
use crate::config::ValfsConfig;
use crate::error::{FsError, FsResult};
use crate::inode::{InodeTable, Node};
use crate::notify::KernelNotify;
use crate::prewarm::Prewarmer;
use crate::reconcile::{ChildEntry, RefreshReport};

pub const SCRATCH_DIR_NAME: &str = "valfs-blobs";

/// Everything a mount shares between its directories and files.
pub struct FsContext {
    pub api: Arc<dyn ValTownApi>,
    pub config: ValfsConfig,
    pub inodes: InodeTable,
    pub notify: KernelNotify,
    pub prewarm: Prewarmer,
    pub scratch_dir: PathBuf,
    pub upload_timeouts: UploadTimeouts,
}

impl FsContext {
    pub fn new(api: Arc<dyn ValTownApi>, config: ValfsConfig) -> Self {
        let prewarm = Prewarmer::new(config.deno_cache);
        Self {
            api,
            config,
            inodes: InodeTable::new(),
            notify: KernelNotify::new(),
            prewarm,
            scratch_dir: std::env::temp_dir().join(SCRATCH_DIR_NAME),
            upload_timeouts: UploadTimeouts::default(),
        }
    }

    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = dir;
        self
    }

    pub fn with_upload_timeouts(mut self, timeouts: UploadTimeouts) -> Self {
        self.upload_timeouts = timeouts;
        self
    }

    /// Tells the kernel about a finished refresh. Must not be called while
    /// a container lock is held: the kernel may need that lock to answer.
    pub fn notify_report(&self, parent: u64, report: &RefreshReport) {
        for name in report.removed.iter().chain(report.added.iter()) {
            self.notify.entry_changed(parent, name);
        }
        for (_, ino) in &report.updated {
            self.notify.content_changed(*ino);
        }
    }
}

/// A top-level directory mirroring one remote collection.
#[async_trait]
pub trait Container: Send + Sync {
    fn ino(&self) -> u64;
    fn name(&self) -> &'static str;

    fn lookup(&self, name: &str) -> Option<(u64, Node)>;
    fn entries(&self) -> Vec<(String, u64, Node)>;

    async fn create(&self, name: &str) -> FsResult<(u64, Node)>;
    async fn unlink(&self, name: &str) -> FsResult<()>;
    async fn rename(&self, old: &str, new: &str, new_parent: u64) -> FsResult<()>;

    /// `Ok(None)` when another refresh of this container is still running.
    async fn refresh(&self) -> FsResult<Option<RefreshReport>>;
}

/// The `name -> child` map of a container.
pub struct Children<T> {
    map: RwLock<BTreeMap<String, ChildEntry<T>>>,
}

impl<T> Children<T> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<ChildEntry<T>> {
        self.map.read().ok()?.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map
            .read()
            .map(|map| map.contains_key(name))
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<(String, ChildEntry<T>)> {
        match self.map.read() {
            Ok(map) => map
                .iter()
                .map(|(name, entry)| (name.clone(), entry.clone()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn insert(&self, name: String, entry: ChildEntry<T>) {
        if let Ok(mut map) = self.map.write() {
            map.insert(name, entry);
        }
    }

    pub fn remove(&self, name: &str) -> Option<ChildEntry<T>> {
        self.map.write().ok()?.remove(name)
    }

    pub fn rename(&self, old: &str, new: &str) -> bool {
        let Ok(mut map) = self.map.write() else {
            return false;
        };
        match map.remove(old) {
            Some(entry) => {
                map.insert(new.to_string(), entry);
                true
            }
            None => false,
        }
    }

    pub fn with_map<R, F>(&self, f: F) -> FsResult<R>
    where
        F: FnOnce(&mut BTreeMap<String, ChildEntry<T>>) -> R,
    {
        let mut map = self
            .map
            .write()
            .map_err(|_| FsError::Io("child map poisoned".to_string()))?;
        Ok(f(&mut map))
    }
}

impl<T> Default for Children<T> {
    fn default() -> Self {
        Self::new()
    }
}
