use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;
use valtown_lib::{blob_get, blob_put, empty_stream, BlobInfo};

use crate::blob_file::BlobFile;
use crate::container::{Children, Container, FsContext};
use crate::error::{FsError, FsResult};
use crate::inode::Node;
use crate::naming::is_valid_blob_key;
use crate::reconcile::{reconcile, ChildEntry, ChildSink, RefreshReport};

pub const BLOBS_DIR_NAME: &str = "blobs";

pub struct BlobsDir {
    ino: u64,
    ctx: Arc<FsContext>,
    children: Children<BlobFile>,
    refresh_gate: Mutex<()>,
    structure: Mutex<()>,
}

impl BlobsDir {
    pub fn new(ctx: Arc<FsContext>) -> Arc<Self> {
        let ino = ctx.inodes.next_ino();
        let dir = Arc::new(Self {
            ino,
            ctx: ctx.clone(),
            children: Children::new(),
            refresh_gate: Mutex::new(()),
            structure: Mutex::new(()),
        });
        ctx.inodes.insert(ino, Node::BlobsDir(dir.clone()));
        dir
    }

    fn attach_blob(&self, info: BlobInfo) -> ChildEntry<BlobFile> {
        let node = Arc::new(BlobFile::new(self.ctx.clone(), info));
        let ino = self.ctx.inodes.allocate(Node::BlobFile(node.clone()));
        ChildEntry { ino, node }
    }

    fn check_key(key: &str) -> FsResult<()> {
        if is_valid_blob_key(key) {
            Ok(())
        } else {
            Err(FsError::Invalid(format!("{:?} is not a valid blob key", key)))
        }
    }

    pub fn child(&self, name: &str) -> Option<ChildEntry<BlobFile>> {
        self.children.get(name)
    }

    /// There is no rename endpoint: stream `old` into `new`, then drop
    /// `old`. A failed copy removes whatever reached `new`.
    async fn copy_then_delete(&self, old: &str, new: &str) -> FsResult<()> {
        let api = self.ctx.api.as_ref();
        let body = blob_get(api, old).await.map_err(|e| {
            error!("rename blob {}: read failed: {}", old, e);
            FsError::from(e)
        })?;
        if let Err(e) = blob_put(api, new, body).await {
            error!("rename blob {} -> {}: copy failed: {}", old, new, e);
            if let Err(rollback) = api.blobs_delete(new).await {
                warn!("rename blob {} -> {}: rollback failed: {}", old, new, rollback);
            }
            return Err(e.into());
        }
        if let Err(e) = api.blobs_delete(old).await {
            warn!(
                "rename blob {} -> {}: old key could not be deleted and stays orphaned: {}",
                old, new, e
            );
        }
        Ok(())
    }
}

impl ChildSink<BlobFile> for BlobsDir {
    fn attach(&self, remote: BlobInfo) -> ChildEntry<BlobFile> {
        self.attach_blob(remote)
    }

    fn detach(&self, name: &str, entry: &ChildEntry<BlobFile>) {
        debug!("blobs: {} is gone remotely", name);
        self.ctx.inodes.remove(entry.ino);
    }
}

#[async_trait]
impl Container for BlobsDir {
    fn ino(&self) -> u64 {
        self.ino
    }

    fn name(&self) -> &'static str {
        BLOBS_DIR_NAME
    }

    fn lookup(&self, name: &str) -> Option<(u64, Node)> {
        self.children
            .get(name)
            .map(|entry| (entry.ino, Node::BlobFile(entry.node)))
    }

    fn entries(&self) -> Vec<(String, u64, Node)> {
        self.children
            .list()
            .into_iter()
            .map(|(name, entry)| (name, entry.ino, Node::BlobFile(entry.node)))
            .collect()
    }

    async fn create(&self, name: &str) -> FsResult<(u64, Node)> {
        Self::check_key(name)?;
        let _structure = self.structure.lock().await;
        if self.children.contains(name) {
            return Err(FsError::Exists(name.to_string()));
        }

        blob_put(self.ctx.api.as_ref(), name, empty_stream())
            .await
            .map_err(|e| {
                error!("create blob {} failed: {}", name, e);
                FsError::from(e)
            })?;
        info!("created blob {}", name);

        let entry = self.attach_blob(BlobInfo {
            key: name.to_string(),
            size: Some(0),
            last_modified: Some(Utc::now()),
        });
        let ino = entry.ino;
        let node = Node::BlobFile(entry.node.clone());
        self.children.insert(name.to_string(), entry);
        Ok((ino, node))
    }

    async fn unlink(&self, name: &str) -> FsResult<()> {
        let _structure = self.structure.lock().await;
        let entry = self
            .children
            .get(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        // A running or later upload would bring the blob back.
        entry.node.mark_unlinked().await;
        if let Err(e) = self.ctx.api.blobs_delete(name).await {
            error!("delete blob {} failed: {}", name, e);
            entry.node.clear_unlinked();
            return Err(e.into());
        }
        self.children.remove(name);
        self.ctx.inodes.remove(entry.ino);
        info!("deleted blob {}", name);
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str, new_parent: u64) -> FsResult<()> {
        if new_parent != self.ino {
            return Err(FsError::Invalid(format!("{} cannot leave {}", old, BLOBS_DIR_NAME)));
        }
        let _structure = self.structure.lock().await;
        let entry = self
            .children
            .get(old)
            .ok_or_else(|| FsError::NotFound(old.to_string()))?;
        if old == new {
            return Ok(());
        }
        Self::check_key(new)?;
        if self.children.contains(new) {
            return Err(FsError::Exists(new.to_string()));
        }

        // The copy must see the latest bytes.
        if let Err(e) = entry.node.finish_upload().await {
            warn!("rename blob {}: pending upload did not finish: {}", old, e);
        }
        self.copy_then_delete(old, new).await?;

        entry.node.set_key(new);
        self.children.rename(old, new);
        info!("renamed blob {} to {}", old, new);
        Ok(())
    }

    async fn refresh(&self) -> FsResult<Option<RefreshReport>> {
        let Ok(_gate) = self.refresh_gate.try_lock() else {
            debug!("blobs: refresh already running");
            return Ok(None);
        };
        let report = {
            let _structure = self.structure.lock().await;
            let listing: Vec<BlobInfo> = self
                .ctx
                .api
                .blobs_list()
                .await?
                .into_iter()
                .filter(|info| {
                    let valid = is_valid_blob_key(&info.key);
                    if !valid {
                        debug!("blobs: skipping key {:?} that cannot be a filename", info.key);
                    }
                    valid
                })
                .collect();
            self.children
                .with_map(|map| reconcile(map, listing, self))?
        };
        if !report.is_empty() {
            debug!("blobs: refreshed, {}", report);
        }
        self.ctx.notify_report(self.ino, &report);
        Ok(Some(report))
    }
}
