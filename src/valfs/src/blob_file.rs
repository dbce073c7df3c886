use chrono::Utc;
use log::{debug, error, warn};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use valtown_lib::{blob_get, BlobInfo};

use crate::blob_upload::BlobUpload;
use crate::container::FsContext;
use crate::error::{FsError, FsResult};
use crate::reconcile::SyncedChild;

pub const BLOB_FILE_MODE: u16 = 0o666;

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(1);

struct Scratch {
    file: Arc<File>,
    path: PathBuf,
    opens: usize,
}

/// One remote blob. While open, its bytes live in a scratch file that
/// serves reads and is the source of every upload.
pub struct BlobFile {
    ctx: Arc<FsContext>,
    info: RwLock<BlobInfo>,
    scratch: Mutex<Option<Scratch>>,
    scratch_path: PathBuf,
    upload: BlobUpload,
    unlinked: AtomicBool,
}

impl BlobFile {
    pub fn new(ctx: Arc<FsContext>, info: BlobInfo) -> Self {
        let upload = BlobUpload::new(ctx.api.clone(), ctx.upload_timeouts);
        let scratch_path = scratch_path_for(
            &ctx.scratch_dir,
            SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed),
            &info.key,
        );
        Self {
            ctx,
            info: RwLock::new(info),
            scratch: Mutex::new(None),
            scratch_path,
            upload,
            unlinked: AtomicBool::new(false),
        }
    }

    pub fn info(&self) -> BlobInfo {
        match self.info.read() {
            Ok(info) => info.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn key(&self) -> String {
        self.info().key
    }

    pub fn size(&self) -> u64 {
        self.info().size.unwrap_or(0)
    }

    pub fn modified_at(&self) -> SystemTime {
        self.info()
            .last_modified
            .map(SystemTime::from)
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    fn update_info<F: FnOnce(&mut BlobInfo)>(&self, f: F) {
        if let Ok(mut info) = self.info.write() {
            f(&mut info);
        }
    }

    pub fn set_key(&self, key: &str) {
        self.update_info(|info| info.key = key.to_string());
    }

    pub fn upload_ongoing(&self) -> bool {
        self.upload.ongoing()
    }

    /// Fixed for the life of the node, so a rename never lets a new blob
    /// under the old key share it.
    pub fn scratch_path(&self) -> &Path {
        &self.scratch_path
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::SeqCst)
    }

    /// Detaches the node from its remote blob. Open handles keep working on
    /// the scratch file, but nothing is uploaded any more.
    pub async fn mark_unlinked(&self) {
        let _scratch = self.scratch.lock().await;
        self.unlinked.store(true, Ordering::SeqCst);
        self.upload.cancel().await;
    }

    /// The remote delete failed; the blob is still there.
    pub fn clear_unlinked(&self) {
        self.unlinked.store(false, Ordering::SeqCst);
    }

    /// Opens (or joins) the scratch file. The first open fills it from the
    /// remote blob unless `fetch` is false (a blob that was just created).
    pub async fn open(&self, fetch: bool) -> FsResult<()> {
        let mut scratch = self.scratch.lock().await;
        if let Some(existing) = scratch.as_mut() {
            existing.opens += 1;
            return Ok(());
        }

        let key = self.key();
        let path = self.scratch_path.clone();
        let file = ensure_scratch_file(&self.ctx.scratch_dir, &path)?;
        if fetch {
            if let Err(e) = self.fill_scratch(&key, &file).await {
                error!("fetch blob {} into {} failed: {}", key, path.display(), e);
                drop(file);
                remove_scratch_file(&path);
                return Err(e);
            }
        }

        let len = file.metadata()?.len();
        self.update_info(|info| {
            if info.size.is_none() {
                info.size = Some(len);
            }
        });
        *scratch = Some(Scratch {
            file: Arc::new(file),
            path,
            opens: 1,
        });
        Ok(())
    }

    async fn fill_scratch(&self, key: &str, file: &File) -> FsResult<()> {
        let body = blob_get(self.ctx.api.as_ref(), key).await?;
        let mut reader = StreamReader::new(body);
        let mut target = tokio::fs::File::from_std(file.try_clone()?);
        let copied = tokio::io::copy(&mut reader, &mut target).await?;
        target.flush().await?;
        debug!("blob {}: fetched {} bytes", key, copied);
        Ok(())
    }

    async fn scratch_file(&self) -> FsResult<Arc<File>> {
        let scratch = self.scratch.lock().await;
        scratch
            .as_ref()
            .map(|s| s.file.clone())
            .ok_or_else(|| FsError::Io(format!("blob {} is not open", self.key())))
    }

    pub async fn read(&self, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let file = self.scratch_file().await?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Scratch first, then the upload, then the cached size.
    pub async fn write(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        let scratch = self.scratch.lock().await;
        let file = scratch
            .as_ref()
            .map(|s| s.file.clone())
            .ok_or_else(|| FsError::Io(format!("blob {} is not open", self.key())))?;
        let key = self.key();

        file.write_all_at(data, offset).map_err(|e| {
            error!("blob {}: scratch write at {} failed: {}", key, offset, e);
            FsError::from(e)
        })?;
        if self.is_unlinked() {
            debug!("blob {}: unlinked, keeping write of {} bytes local", key, data.len());
        } else {
            self.upload
                .write(&key, &file, offset, data)
                .await
                .map_err(|e| {
                    error!("blob {}: upload restart failed: {}", key, e);
                    e
                })?;
        }
        let len = file.metadata()?.len();
        self.update_info(|info| {
            info.size = Some(len);
            info.last_modified = Some(Utc::now());
        });
        Ok(data.len())
    }

    /// Local truncate of the scratch file; nothing is sent.
    pub async fn truncate(&self, size: u64) -> FsResult<()> {
        let scratch = self.scratch.lock().await;
        if let Some(s) = scratch.as_ref() {
            s.file.set_len(size)?;
        }
        self.update_info(|info| info.size = Some(size));
        Ok(())
    }

    /// Drops one open. The last one waits for the upload and removes the
    /// scratch file; upload errors were already logged and do not fail it.
    pub async fn release(&self) -> FsResult<()> {
        let mut scratch = self.scratch.lock().await;
        let last = match scratch.as_mut() {
            Some(s) if s.opens > 1 => {
                s.opens -= 1;
                false
            }
            Some(_) => true,
            None => return Ok(()),
        };
        if !last {
            return Ok(());
        }

        if self.is_unlinked() {
            self.upload.cancel().await;
        } else if let Err(e) = self.upload.finish().await {
            warn!("blob {}: released with unfinished upload: {}", self.key(), e);
        }
        if let Some(s) = scratch.take() {
            drop(s.file);
            remove_scratch_file(&s.path);
        }
        Ok(())
    }

    pub async fn finish_upload(&self) -> FsResult<()> {
        self.upload.finish().await
    }

    #[cfg(test)]
    pub async fn open_count(&self) -> usize {
        self.scratch.lock().await.as_ref().map(|s| s.opens).unwrap_or(0)
    }
}

impl SyncedChild for BlobFile {
    type Remote = BlobInfo;

    fn remote_key(remote: &BlobInfo) -> String {
        remote.key.clone()
    }

    fn remote_file_name(remote: &BlobInfo) -> String {
        remote.key.clone()
    }

    fn key(&self) -> String {
        BlobFile::key(self)
    }

    fn is_stale(&self, remote: &BlobInfo) -> bool {
        match (remote.last_modified, self.info().last_modified) {
            (Some(theirs), Some(ours)) => theirs > ours,
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn is_busy(&self) -> bool {
        self.upload.ongoing()
    }

    fn replace_snapshot(&self, remote: BlobInfo) {
        self.update_info(|info| *info = remote);
    }
}

/// `blob-<pid>-<seq>-<key>`: unique per node and per process sharing the
/// scratch directory.
pub fn scratch_path_for(dir: &Path, seq: u64, key: &str) -> PathBuf {
    dir.join(format!("blob-{}-{}-{}", std::process::id(), seq, key))
}

fn ensure_scratch_file(dir: &Path, path: &Path) -> FsResult<File> {
    std::fs::create_dir_all(dir)
        .map_err(|e| FsError::Io(format!("create {} failed: {}", dir.display(), e)))?;
    let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755));
    // A leftover from an earlier mount is stale; start from empty.
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(path)
        .map_err(|e| FsError::Io(format!("open scratch {} failed: {}", path.display(), e)))
}

fn remove_scratch_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("remove scratch {} failed: {}", path.display(), e);
        }
    }
}
