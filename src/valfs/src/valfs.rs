use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request,
};
use libc::{EACCES, EBADF, EINVAL, EISDIR, ENOENT, ENOTDIR, EPERM};
use log::{debug, error, info, warn};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Runtime;
use tokio::signal::unix::{signal, SignalKind};
use valtown_lib::ValTownClient;

use crate::blob_file::BLOB_FILE_MODE;
use crate::config::ValfsConfig;
use crate::container::{Container, FsContext};
use crate::error::{FsError, FsResult};
use crate::inode::{build_attr, HandleTable, Node, OpenHandle, Owner};
use crate::refresher::Refresher;
use crate::root::{MountRoot, DIR_MODE, STATIC_FILE_MODE};

const TTL: Duration = Duration::from_secs(1);
const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub mountpoint: PathBuf,
    pub config: ValfsConfig,
    pub api_key: String,
}

/// `fuser` front end. Callbacks are synchronous; node code is async and
/// driven with `block_on` on the mount's runtime.
pub struct ValFs {
    runtime: Arc<Runtime>,
    ctx: Arc<FsContext>,
    root: Arc<MountRoot>,
    handles: HandleTable,
    owner: Owner,
}

fn map_fs_err(err: FsError) -> i32 {
    err.errno()
}

fn is_write_open(flags: i32) -> bool {
    let accmode = flags & libc::O_ACCMODE;
    accmode == libc::O_WRONLY || accmode == libc::O_RDWR
}

impl ValFs {
    pub fn new(runtime: Arc<Runtime>, ctx: Arc<FsContext>, root: Arc<MountRoot>) -> Self {
        Self {
            runtime,
            ctx,
            root,
            handles: HandleTable::new(),
            owner: Owner::current(),
        }
    }

    fn node(&self, ino: u64) -> Result<Node, i32> {
        self.ctx.inodes.get(ino).ok_or(ENOENT)
    }

    fn container(&self, ino: u64) -> Result<Arc<dyn Container>, i32> {
        match self.node(ino)? {
            Node::ValsDir(_) | Node::BlobsDir(_) => self.root.container(ino).ok_or(ENOENT),
            // Nothing can be added to or removed from the root itself.
            Node::Root => Err(EPERM),
            _ => Err(ENOTDIR),
        }
    }

    fn build_attr(&self, ino: u64, node: &Node) -> FileAttr {
        let mounted_at = self.root.mounted_at;
        match node {
            Node::Root | Node::ValsDir(_) | Node::BlobsDir(_) => build_attr(
                ino,
                FileType::Directory,
                DIR_MODE,
                0,
                mounted_at,
                self.owner,
            ),
            Node::Static(file) => build_attr(
                ino,
                FileType::RegularFile,
                STATIC_FILE_MODE,
                file.data.len() as u64,
                mounted_at,
                self.owner,
            ),
            Node::ValFile(val) => {
                let stat = val.stat();
                build_attr(
                    ino,
                    FileType::RegularFile,
                    val.mode(),
                    stat.size,
                    stat.modified_at,
                    self.owner,
                )
            }
            Node::BlobFile(blob) => build_attr(
                ino,
                FileType::RegularFile,
                BLOB_FILE_MODE,
                blob.size(),
                blob.modified_at(),
                self.owner,
            ),
        }
    }

    fn children_of(&self, ino: u64) -> Result<Vec<(String, u64, Node)>, i32> {
        match self.node(ino)? {
            Node::Root => Ok(self.root.entries()),
            Node::ValsDir(dir) => Ok(dir.entries()),
            Node::BlobsDir(dir) => Ok(dir.entries()),
            _ => Err(ENOTDIR),
        }
    }

    pub(crate) fn lookup_entry(&self, parent: u64, name: &str) -> Result<FileAttr, i32> {
        let found = match self.node(parent)? {
            Node::Root => self.root.lookup(name),
            Node::ValsDir(dir) => dir.lookup(name),
            Node::BlobsDir(dir) => dir.lookup(name),
            _ => return Err(ENOTDIR),
        };
        let (ino, node) = found.ok_or(ENOENT)?;
        Ok(self.build_attr(ino, &node))
    }

    pub(crate) fn getattr_entry(&self, ino: u64) -> Result<FileAttr, i32> {
        let node = self.node(ino)?;
        Ok(self.build_attr(ino, &node))
    }

    pub(crate) fn readdir_entries(
        &self,
        ino: u64,
        offset: i64,
    ) -> Result<Vec<(u64, FileType, String, i64)>, i32> {
        let children = self.children_of(ino)?;
        let mut out = Vec::new();
        if offset < 1 {
            out.push((ino, FileType::Directory, ".".to_string(), 1));
        }
        if offset < 2 {
            out.push((ino, FileType::Directory, "..".to_string(), 2));
        }
        let mut idx: i64 = offset.max(2);
        for (name, child_ino, node) in children.into_iter().skip((idx - 2) as usize) {
            idx += 1;
            out.push((child_ino, node.kind(), name, idx));
        }
        Ok(out)
    }

    /// Returns the file handle and the `FOPEN_*` flags for the reply.
    pub(crate) fn open_file(&self, ino: u64, flags: i32) -> Result<(u64, u32), i32> {
        match self.node(ino)? {
            Node::ValFile(val) => {
                self.runtime.block_on(val.open()).map_err(map_fs_err)?;
                let fh = self.handles.insert(OpenHandle::Val(val));
                Ok((fh, fuser::consts::FOPEN_DIRECT_IO))
            }
            Node::BlobFile(blob) => {
                self.runtime.block_on(blob.open(true)).map_err(map_fs_err)?;
                let fh = self.handles.insert(OpenHandle::Blob(blob));
                Ok((fh, 0))
            }
            Node::Static(file) => {
                if is_write_open(flags) {
                    return Err(EACCES);
                }
                Ok((self.handles.insert(OpenHandle::Static(file)), 0))
            }
            Node::Root | Node::ValsDir(_) | Node::BlobsDir(_) => Err(EISDIR),
        }
    }

    pub(crate) fn create_file(&self, parent: u64, name: &str) -> Result<(FileAttr, u64, u32), i32> {
        let container = self.container(parent)?;
        let (ino, node) = self
            .runtime
            .block_on(container.create(name))
            .map_err(map_fs_err)?;
        let (fh, open_flags) = match &node {
            Node::ValFile(val) => (
                self.handles.insert(OpenHandle::Val(val.clone())),
                fuser::consts::FOPEN_DIRECT_IO,
            ),
            Node::BlobFile(blob) => {
                self.runtime.block_on(blob.open(false)).map_err(map_fs_err)?;
                (self.handles.insert(OpenHandle::Blob(blob.clone())), 0)
            }
            _ => return Err(EINVAL),
        };
        Ok((self.build_attr(ino, &node), fh, open_flags))
    }

    pub(crate) fn read_handle(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        let offset = u64::try_from(offset).map_err(|_| EINVAL)?;
        match self.handles.get(fh).ok_or(EBADF)? {
            OpenHandle::Val(val) => self
                .runtime
                .block_on(val.read(offset, size))
                .map_err(map_fs_err),
            OpenHandle::Blob(blob) => self
                .runtime
                .block_on(blob.read(offset, size))
                .map_err(map_fs_err),
            OpenHandle::Static(file) => Ok(file.read(offset, size)),
        }
    }

    pub(crate) fn write_handle(&self, fh: u64, offset: i64, data: &[u8]) -> Result<usize, i32> {
        let offset = u64::try_from(offset).map_err(|_| EINVAL)?;
        match self.handles.get(fh).ok_or(EBADF)? {
            OpenHandle::Val(val) => self
                .runtime
                .block_on(val.write(offset, data))
                .map_err(map_fs_err),
            OpenHandle::Blob(blob) => self
                .runtime
                .block_on(blob.write(offset, data))
                .map_err(map_fs_err),
            OpenHandle::Static(_) => Err(EACCES),
        }
    }

    pub(crate) fn release_handle(&self, fh: u64) -> Result<(), i32> {
        match self.handles.remove(fh) {
            Some(OpenHandle::Blob(blob)) => self
                .runtime
                .block_on(blob.release())
                .map_err(map_fs_err),
            Some(_) | None => Ok(()),
        }
    }

    pub(crate) fn unlink_entry(&self, parent: u64, name: &str) -> Result<(), i32> {
        let container = self.container(parent)?;
        self.runtime
            .block_on(container.unlink(name))
            .map_err(map_fs_err)
    }

    pub(crate) fn rename_entry(
        &self,
        parent: u64,
        name: &str,
        newparent: u64,
        newname: &str,
    ) -> Result<(), i32> {
        let container = self.container(parent)?;
        self.runtime
            .block_on(container.rename(name, newname, newparent))
            .map_err(map_fs_err)
    }

    /// Attribute changes are echoed, not stored remotely. A size change on
    /// a blob truncates its scratch file.
    pub(crate) fn setattr_entry(&self, ino: u64, size: Option<u64>) -> Result<FileAttr, i32> {
        let node = self.node(ino)?;
        if let Some(size) = size {
            match &node {
                Node::Root | Node::ValsDir(_) | Node::BlobsDir(_) => return Err(EISDIR),
                Node::BlobFile(blob) => self
                    .runtime
                    .block_on(blob.truncate(size))
                    .map_err(map_fs_err)?,
                Node::ValFile(_) | Node::Static(_) => {}
            }
        }
        Ok(self.build_attr(ino, &node))
    }

    pub(crate) fn open_handles(&self) -> usize {
        self.handles.len()
    }
}

fn name_str(name: &OsStr) -> Result<&str, i32> {
    name.to_str().ok_or(EINVAL)
}

impl Filesystem for ValFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name_str(name) {
            Ok(v) => v,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.lookup_entry(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.getattr_entry(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr request ino={}, mode={:?}, size={:?}, fh={:?}",
            ino, mode, size, fh
        );
        match self.setattr_entry(ino, size) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.readdir_entries(ino, offset) {
            Ok(entries) => {
                for (inode, file_type, name, next_offset) in entries {
                    if reply.add(inode, next_offset, file_type, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(code) => reply.error(code),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.open_file(ino, flags) {
            Ok((fh, open_flags)) => reply.opened(fh, open_flags),
            Err(code) => reply.error(code),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name_str(name) {
            Ok(v) => v,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.create_file(parent, name) {
            Ok((attr, fh, open_flags)) => reply.created(&TTL, &attr, 0, fh, open_flags),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_handle(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.write_handle(fh, offset, data) {
            Ok(n) => reply.written(n as u32),
            Err(code) => reply.error(code),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.release_handle(fh) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // Vals publish on write, blobs upload on write and settle on release.
        reply.ok();
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(v) => v,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.unlink_entry(parent, name) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (name_str(name), name_str(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.rename_entry(parent, name, newparent, newname) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(EPERM);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(EPERM);
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        // Remote capacity is unknown; report plenty of room.
        let blocks = 1u64 << 32;
        reply.statfs(blocks, blocks, blocks, 1 << 20, 1 << 20, 4096, 255, 4096);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }
}

async fn wait_for_exit(session: &BackgroundSession) -> FsResult<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut poll = tokio::time::interval(SESSION_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT received, unmounting");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, unmounting");
                return Ok(());
            }
            _ = poll.tick() => {
                if session.guard.is_finished() {
                    info!("session ended, mount point was unmounted");
                    return Ok(());
                }
            }
        }
    }
}

pub fn run_mount(options: MountOptions) -> FsResult<()> {
    let MountOptions {
        mountpoint,
        config,
        api_key,
    } = options;
    let runtime = Arc::new(Runtime::new().map_err(|e| FsError::Io(e.to_string()))?);
    let client = ValTownClient::new(&config.api_base_url, &api_key)?;
    let ctx = Arc::new(FsContext::new(Arc::new(client), config.clone()));

    std::fs::create_dir_all(&mountpoint).map_err(|e| {
        FsError::Io(format!(
            "create mountpoint {} failed: {}",
            mountpoint.display(),
            e
        ))
    })?;

    let root = Arc::new(MountRoot::assemble(&ctx));
    runtime.block_on(root.refresh_all());

    let filesystem = ValFs::new(runtime.clone(), ctx.clone(), root.clone());
    let mut mount_options = vec![MountOption::FSName("valfs".to_string())];
    if config.auto_unmount_on_exit {
        mount_options.push(MountOption::AutoUnmount);
    }
    info!(
        "mounting valfs at {:?}, api={}, vals={}, blobs={}",
        mountpoint, config.api_base_url, config.enable_vals_directory, config.enable_blobs_directory
    );
    let session = fuser::spawn_mount2(filesystem, &mountpoint, &mount_options)
        .map_err(|e| FsError::Io(format!("mount failed: {}", e)))?;
    if !ctx.notify.install(Box::new(session.notifier())) {
        warn!("kernel notifier was already installed");
    }

    let refresher = config.auto_refresh.then(|| {
        Refresher::start(
            runtime.handle(),
            root.containers(),
            config.refresh_interval(),
        )
    });
    info!("valfs mounted at {:?}", mountpoint);

    let result = if config.auto_unmount_on_exit {
        let waited = runtime.block_on(wait_for_exit(&session));
        drop(session);
        waited
    } else {
        session.join();
        Ok(())
    };

    if let Some(refresher) = refresher {
        runtime.block_on(refresher.stop());
    }
    if let Err(e) = &result {
        error!("valfs at {:?} stopped with error: {}", mountpoint, e);
    } else {
        info!("valfs at {:?} unmounted", mountpoint);
    }
    result
}
