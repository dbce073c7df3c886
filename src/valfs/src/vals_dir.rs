use async_trait::async_trait;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use valtown_lib::{list_all_vals, ValCreateRequest, ValPrivacy, ValSummary, ValType};

use crate::container::{Children, Container, FsContext};
use crate::error::{FsError, FsResult};
use crate::inode::Node;
use crate::naming::extract_from_val_filename;
use crate::reconcile::{reconcile, ChildEntry, ChildSink, RefreshReport};
use crate::val_file::ValFile;

pub const VALS_DIR_NAME: &str = "vals";

/// Starting code for a val created from the filesystem.
pub fn val_template(val_type: ValType) -> &'static str {
    match val_type {
        ValType::Http => {
            "export default async function (req: Request): Promise<Response> {\n  return Response.json({ ok: true });\n}\n"
        }
        ValType::Interval => {
            "export default async function (interval: Interval) {\n  console.log(\"ran at\", interval.lastRunAt);\n}\n"
        }
        ValType::Email => {
            "export default async function (email: Email) {\n  console.log(\"mail from\", email.from);\n}\n"
        }
        ValType::Script | ValType::Unknown => {
            "export function hello() {\n  return \"Hello, world!\";\n}\n"
        }
    }
}

pub struct ValsDir {
    ino: u64,
    ctx: Arc<FsContext>,
    children: Children<ValFile>,
    user_id: OnceCell<String>,
    refresh_gate: Mutex<()>,
    // Serializes create/unlink/rename against a running refresh.
    structure: Mutex<()>,
}

impl ValsDir {
    pub fn new(ctx: Arc<FsContext>) -> Arc<Self> {
        let ino = ctx.inodes.next_ino();
        let dir = Arc::new(Self {
            ino,
            ctx: ctx.clone(),
            children: Children::new(),
            user_id: OnceCell::new(),
            refresh_gate: Mutex::new(()),
            structure: Mutex::new(()),
        });
        ctx.inodes.insert(ino, Node::ValsDir(dir.clone()));
        dir
    }

    async fn user_id(&self) -> FsResult<String> {
        let id = self
            .user_id
            .get_or_try_init(|| async {
                let me = self.ctx.api.me_get().await?;
                info!("vals belong to user {}", me.id);
                Ok::<_, FsError>(me.id)
            })
            .await?;
        Ok(id.clone())
    }

    fn attach_val(&self, node: ValFile) -> ChildEntry<ValFile> {
        let node = Arc::new(node);
        let ino = self.ctx.inodes.allocate(Node::ValFile(node.clone()));
        ChildEntry { ino, node }
    }

    fn parse_name(name: &str) -> FsResult<(String, ValType)> {
        let (base, val_type) = extract_from_val_filename(name);
        if val_type == ValType::Unknown {
            return Err(FsError::Invalid(format!("{} is not a <name>.<S|H|C|E>.tsx filename", name)));
        }
        Ok((base, val_type))
    }

    pub fn child(&self, name: &str) -> Option<ChildEntry<ValFile>> {
        self.children.get(name)
    }
}

impl ChildSink<ValFile> for ValsDir {
    fn attach(&self, remote: ValSummary) -> ChildEntry<ValFile> {
        self.attach_val(ValFile::from_summary(self.ctx.clone(), remote))
    }

    fn detach(&self, name: &str, entry: &ChildEntry<ValFile>) {
        debug!("vals: {} is gone remotely", name);
        self.ctx.inodes.remove(entry.ino);
    }
}

#[async_trait]
impl Container for ValsDir {
    fn ino(&self) -> u64 {
        self.ino
    }

    fn name(&self) -> &'static str {
        VALS_DIR_NAME
    }

    fn lookup(&self, name: &str) -> Option<(u64, Node)> {
        self.children
            .get(name)
            .map(|entry| (entry.ino, Node::ValFile(entry.node)))
    }

    fn entries(&self) -> Vec<(String, u64, Node)> {
        self.children
            .list()
            .into_iter()
            .map(|(name, entry)| (name, entry.ino, Node::ValFile(entry.node)))
            .collect()
    }

    async fn create(&self, name: &str) -> FsResult<(u64, Node)> {
        let (base, val_type) = Self::parse_name(name)?;
        let _structure = self.structure.lock().await;
        if self.children.contains(name) {
            return Err(FsError::Exists(name.to_string()));
        }

        let req = ValCreateRequest {
            code: val_template(val_type).to_string(),
            name: base,
            val_type,
            privacy: ValPrivacy::Unlisted,
        };
        let val = self.ctx.api.val_create(&req).await.map_err(|e| {
            error!("create val {} failed: {}", name, e);
            FsError::from(e)
        })?;
        info!("created val {} as {}", val.id, name);

        let entry = self.attach_val(ValFile::from_val(self.ctx.clone(), val));
        let ino = entry.ino;
        let node = Node::ValFile(entry.node.clone());
        self.children.insert(name.to_string(), entry);
        Ok((ino, node))
    }

    async fn unlink(&self, name: &str) -> FsResult<()> {
        let _structure = self.structure.lock().await;
        let entry = self
            .children
            .get(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        let id = entry.node.id();
        self.ctx.api.val_delete(&id).await.map_err(|e| {
            error!("delete val {} ({}) failed: {}", name, id, e);
            FsError::from(e)
        })?;
        self.children.remove(name);
        self.ctx.inodes.remove(entry.ino);
        info!("deleted val {} ({})", name, id);
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str, new_parent: u64) -> FsResult<()> {
        if new_parent != self.ino {
            return Err(FsError::Invalid(format!("{} cannot leave {}", old, VALS_DIR_NAME)));
        }
        let _structure = self.structure.lock().await;
        let entry = self
            .children
            .get(old)
            .ok_or_else(|| FsError::NotFound(old.to_string()))?;
        if old == new {
            return Ok(());
        }
        let (base, val_type) = Self::parse_name(new)?;
        if self.children.contains(new) {
            return Err(FsError::Exists(new.to_string()));
        }

        entry.node.rename_to(&base, val_type).await?;
        self.children.rename(old, new);
        info!("renamed val {} to {}", old, new);
        Ok(())
    }

    async fn refresh(&self) -> FsResult<Option<RefreshReport>> {
        let Ok(_gate) = self.refresh_gate.try_lock() else {
            debug!("vals: refresh already running");
            return Ok(None);
        };
        let report = {
            let _structure = self.structure.lock().await;
            let user_id = self.user_id().await?;
            let listing = list_all_vals(self.ctx.api.as_ref(), &user_id).await?;
            self.children
                .with_map(|map| reconcile(map, listing, self))?
        };
        if !report.is_empty() {
            debug!("vals: refreshed, {}", report);
        }
        self.ctx.notify_report(self.ino, &report);
        Ok(Some(report))
    }
}
