use log::debug;
use std::ffi::OsStr;
use std::io;
use std::sync::OnceLock;

/// Kernel cache invalidation. Implemented for `fuser::Notifier`; tests plug
/// in a recorder.
pub trait Invalidator: Send + Sync {
    fn inval_entry(&self, parent: u64, name: &OsStr) -> io::Result<()>;
    fn inval_inode(&self, ino: u64) -> io::Result<()>;
}

impl Invalidator for fuser::Notifier {
    fn inval_entry(&self, parent: u64, name: &OsStr) -> io::Result<()> {
        fuser::Notifier::inval_entry(self, parent, name)
    }

    fn inval_inode(&self, ino: u64) -> io::Result<()> {
        fuser::Notifier::inval_inode(self, ino, 0, 0)
    }
}

/// Holds the invalidator once the session is up. Notifications sent before
/// that (the initial refresh runs before mounting) are dropped.
#[derive(Default)]
pub struct KernelNotify {
    sink: OnceLock<Box<dyn Invalidator>>,
}

impl KernelNotify {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, invalidator: Box<dyn Invalidator>) -> bool {
        self.sink.set(invalidator).is_ok()
    }

    /// A name under `parent` appeared or went away.
    pub fn entry_changed(&self, parent: u64, name: &str) {
        if let Some(sink) = self.sink.get() {
            // ENOENT just means the kernel never cached the entry.
            if let Err(e) = sink.inval_entry(parent, OsStr::new(name)) {
                debug!("inval_entry({}, {}) failed: {}", parent, name, e);
            }
        }
    }

    pub fn content_changed(&self, ino: u64) {
        if let Some(sink) = self.sink.get() {
            if let Err(e) = sink.inval_inode(ino) {
                debug!("inval_inode({}) failed: {}", ino, e);
            }
        }
    }
}
