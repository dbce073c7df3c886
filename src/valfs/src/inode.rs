use fuser::{FileAttr, FileType};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use crate::blob_file::BlobFile;
use crate::blobs_dir::BlobsDir;
use crate::root::StaticFile;
use crate::val_file::ValFile;
use crate::vals_dir::ValsDir;

pub const ROOT_INODE: u64 = 1;
const FIRST_DYNAMIC_INODE: u64 = 2;

#[derive(Clone)]
pub enum Node {
    Root,
    ValsDir(Arc<ValsDir>),
    BlobsDir(Arc<BlobsDir>),
    Static(Arc<StaticFile>),
    ValFile(Arc<ValFile>),
    BlobFile(Arc<BlobFile>),
}

impl Node {
    pub fn kind(&self) -> FileType {
        match self {
            Node::Root | Node::ValsDir(_) | Node::BlobsDir(_) => FileType::Directory,
            _ => FileType::RegularFile,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Root => f.write_str("Root"),
            Node::ValsDir(_) => f.write_str("ValsDir"),
            Node::BlobsDir(_) => f.write_str("BlobsDir"),
            Node::Static(file) => write!(f, "Static({})", file.name),
            Node::ValFile(val) => write!(f, "ValFile({})", val.id()),
            Node::BlobFile(blob) => write!(f, "BlobFile({})", blob.key()),
        }
    }
}

/// `ino -> Node` for the lifetime of a mount. Inode numbers are handed out
/// monotonically and never reused.
pub struct InodeTable {
    next_inode: AtomicU64,
    nodes: RwLock<HashMap<u64, Node>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INODE, Node::Root);
        Self {
            next_inode: AtomicU64::new(FIRST_DYNAMIC_INODE),
            nodes: RwLock::new(nodes),
        }
    }

    /// Reserves a number for a node that needs to know its own inode
    /// before it can be built.
    pub fn next_ino(&self) -> u64 {
        self.next_inode.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert(&self, ino: u64, node: Node) {
        if let Ok(mut map) = self.nodes.write() {
            map.insert(ino, node);
        }
    }

    pub fn allocate(&self, node: Node) -> u64 {
        let ino = self.next_ino();
        self.insert(ino, node);
        ino
    }

    pub fn get(&self, ino: u64) -> Option<Node> {
        self.nodes.read().ok()?.get(&ino).cloned()
    }

    pub fn remove(&self, ino: u64) -> Option<Node> {
        if ino == ROOT_INODE {
            return None;
        }
        self.nodes.write().ok()?.remove(&ino)
    }

    pub fn contains(&self, ino: u64) -> bool {
        self.nodes
            .read()
            .map(|map| map.contains_key(&ino))
            .unwrap_or(false)
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub enum OpenHandle {
    Val(Arc<ValFile>),
    Blob(Arc<BlobFile>),
    Static(Arc<StaticFile>),
}

pub struct HandleTable {
    next_fh: AtomicU64,
    handles: Mutex<HashMap<u64, OpenHandle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, handle: OpenHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut map) = self.handles.lock() {
            map.insert(fh, handle);
        }
        fh
    }

    pub fn get(&self, fh: u64) -> Option<OpenHandle> {
        self.handles.lock().ok()?.get(&fh).cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<OpenHandle> {
        self.handles.lock().ok()?.remove(&fh)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().map(|map| map.len()).unwrap_or(0)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Ownership stamped on every attr. The mount is single-user.
#[derive(Debug, Clone, Copy)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub fn current() -> Self {
        Self {
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }
}

pub fn build_attr(
    ino: u64,
    kind: FileType,
    perm: u16,
    size: u64,
    time: SystemTime,
    owner: Owner,
) -> FileAttr {
    let nlink = if kind == FileType::Directory { 2 } else { 1 };
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: time,
        mtime: time,
        ctime: time,
        crtime: time,
        kind,
        perm,
        nlink,
        uid: owner.uid,
        gid: owner.gid,
        rdev: 0,
        flags: 0,
        blksize: 4096,
    }
}
