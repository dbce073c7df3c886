use log::{debug, warn};
use std::sync::Arc;
use std::time::SystemTime;

use crate::blobs_dir::BlobsDir;
use crate::container::{Container, FsContext};
use crate::inode::Node;
use crate::vals_dir::ValsDir;

pub const STATIC_FILE_MODE: u16 = 0o644;
pub const DIR_MODE: u16 = 0o555;

const DENO_JSON: &[u8] = include_bytes!("../assets/deno.json");
const CURSOR_RULES: &[u8] = include_bytes!("../assets/.cursorrules");

/// Fixed editor hint file at the mount root.
pub struct StaticFile {
    pub name: &'static str,
    pub data: &'static [u8],
}

impl StaticFile {
    pub fn read(&self, offset: u64, size: u32) -> Vec<u8> {
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(size as usize).min(self.data.len());
        self.data[start..end].to_vec()
    }
}

/// The children of the mount point, fixed at mount time.
pub struct MountRoot {
    pub vals: Option<Arc<ValsDir>>,
    pub blobs: Option<Arc<BlobsDir>>,
    statics: Vec<(u64, Arc<StaticFile>)>,
    pub mounted_at: SystemTime,
}

impl MountRoot {
    pub fn assemble(ctx: &Arc<FsContext>) -> Self {
        let config = &ctx.config;
        let vals = config
            .enable_vals_directory
            .then(|| ValsDir::new(ctx.clone()));
        let blobs = config
            .enable_blobs_directory
            .then(|| BlobsDir::new(ctx.clone()));

        let mut statics = Vec::new();
        let wanted = [
            (config.deno_json, "deno.json", DENO_JSON),
            (config.cursor_rules, ".cursorrules", CURSOR_RULES),
        ];
        for (enabled, name, data) in wanted {
            if enabled {
                let file = Arc::new(StaticFile { name, data });
                let ino = ctx.inodes.allocate(Node::Static(file.clone()));
                statics.push((ino, file));
            }
        }

        if vals.is_none() && blobs.is_none() {
            warn!("both vals/ and blobs/ are disabled, the mount will be empty");
        }
        Self {
            vals,
            blobs,
            statics,
            mounted_at: SystemTime::now(),
        }
    }

    pub fn containers(&self) -> Vec<Arc<dyn Container>> {
        let mut out: Vec<Arc<dyn Container>> = Vec::new();
        if let Some(vals) = &self.vals {
            out.push(vals.clone());
        }
        if let Some(blobs) = &self.blobs {
            out.push(blobs.clone());
        }
        out
    }

    pub fn container(&self, ino: u64) -> Option<Arc<dyn Container>> {
        self.containers().into_iter().find(|c| c.ino() == ino)
    }

    pub fn lookup(&self, name: &str) -> Option<(u64, Node)> {
        self.entries()
            .into_iter()
            .find(|(entry_name, _, _)| entry_name == name)
            .map(|(_, ino, node)| (ino, node))
    }

    pub fn entries(&self) -> Vec<(String, u64, Node)> {
        let mut out = Vec::new();
        if let Some(vals) = &self.vals {
            out.push((vals.name().to_string(), vals.ino(), Node::ValsDir(vals.clone())));
        }
        if let Some(blobs) = &self.blobs {
            out.push((blobs.name().to_string(), blobs.ino(), Node::BlobsDir(blobs.clone())));
        }
        for (ino, file) in &self.statics {
            out.push((file.name.to_string(), *ino, Node::Static(file.clone())));
        }
        out
    }

    /// Runs one refresh of every container. Failures are logged; the next
    /// tick tries again.
    pub async fn refresh_all(&self) {
        for container in self.containers() {
            match container.refresh().await {
                Ok(Some(report)) => debug!("{}: {}", container.name(), report),
                Ok(None) => {}
                Err(e) => warn!("refresh of {} failed: {}", container.name(), e),
            }
        }
    }
}
