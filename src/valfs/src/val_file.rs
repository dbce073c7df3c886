use log::{debug, error, warn};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use valtown_lib::{Val, ValSummary, ValType, ValUpdateRequest, ValVersionRequest};

use crate::container::FsContext;
use crate::error::{FsError, FsResult};
use crate::naming::construct_val_filename;
use crate::package::{self, PackageError, FRONTMATTER_OVERHEAD};
use crate::reconcile::SyncedChild;

/// A val as first seen in a listing, or fully fetched with code and readme.
#[derive(Clone, Debug)]
pub enum ValState {
    Lazy(ValSummary),
    Full(Val),
}

impl ValState {
    pub fn id(&self) -> &str {
        match self {
            ValState::Lazy(s) => &s.id,
            ValState::Full(v) => &v.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ValState::Lazy(s) => &s.name,
            ValState::Full(v) => &v.name,
        }
    }

    pub fn val_type(&self) -> ValType {
        match self {
            ValState::Lazy(s) => s.val_type,
            ValState::Full(v) => v.val_type,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            ValState::Lazy(s) => s.version,
            ValState::Full(v) => v.version,
        }
    }
}

pub struct ValStat {
    pub size: u64,
    pub modified_at: SystemTime,
}

pub struct ValFile {
    ctx: Arc<FsContext>,
    state: RwLock<ValState>,
    modified_at: RwLock<SystemTime>,
    // Serializes writes to one val so the two-step publish never interleaves.
    write_lock: Mutex<()>,
}

impl ValFile {
    pub fn from_summary(ctx: Arc<FsContext>, summary: ValSummary) -> Self {
        let modified_at = summary
            .created_at
            .map(SystemTime::from)
            .unwrap_or_else(SystemTime::now);
        Self::with_state(ctx, ValState::Lazy(summary), modified_at)
    }

    pub fn from_val(ctx: Arc<FsContext>, val: Val) -> Self {
        Self::with_state(ctx, ValState::Full(val), SystemTime::now())
    }

    fn with_state(ctx: Arc<FsContext>, state: ValState, modified_at: SystemTime) -> Self {
        Self {
            ctx,
            state: RwLock::new(state),
            modified_at: RwLock::new(modified_at),
            write_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ValState {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_state(&self, state: ValState) {
        if let Ok(mut current) = self.state.write() {
            *current = state;
        }
    }

    fn set_modified_at(&self, at: SystemTime) {
        if let Ok(mut current) = self.modified_at.write() {
            *current = at;
        }
    }

    pub fn modified_at(&self) -> SystemTime {
        self.modified_at
            .read()
            .map(|at| *at)
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    pub fn id(&self) -> String {
        self.state().id().to_string()
    }

    pub fn version(&self) -> u64 {
        self.state().version()
    }

    pub fn file_name(&self) -> String {
        let state = self.state();
        construct_val_filename(state.name(), state.val_type())
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state(), ValState::Full(_))
    }

    pub fn mode(&self) -> u16 {
        if self.ctx.config.executable_vals {
            0o777
        } else {
            0o666
        }
    }

    /// Fetches the full val. `force` re-fetches one that is already loaded.
    pub async fn load(&self, force: bool) -> FsResult<Val> {
        if !force {
            if let ValState::Full(val) = self.state() {
                return Ok(val);
            }
        }
        let id = self.id();
        let val = self.ctx.api.val_get(&id).await.map_err(|e| {
            error!("fetch val {} failed: {}", id, e);
            FsError::from(e)
        })?;
        self.set_state(ValState::Full(val.clone()));
        Ok(val)
    }

    pub async fn open(&self) -> FsResult<()> {
        self.load(self.ctx.config.do_reload).await?;
        Ok(())
    }

    pub fn text(&self, val: &Val) -> FsResult<String> {
        package::to_text(val, &self.ctx.config)
            .map_err(|e| FsError::Io(format!("encode val {} failed: {}", val.id, e)))
    }

    pub async fn read(&self, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let val = self.load(false).await?;
        let text = self.text(&val)?;
        let bytes = text.as_bytes();
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(size as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    /// Size is exact once the code is known; until then code length plus
    /// the largest frontmatter we emit.
    pub fn stat(&self) -> ValStat {
        let size = match self.state() {
            ValState::Full(val) => self
                .text(&val)
                .map(|text| text.len() as u64)
                .unwrap_or(val.code.len() as u64 + FRONTMATTER_OVERHEAD),
            ValState::Lazy(summary) => {
                summary.code.map(|c| c.len() as u64).unwrap_or(0) + FRONTMATTER_OVERHEAD
            }
        };
        ValStat {
            size,
            modified_at: self.modified_at(),
        }
    }

    /// Publishes `data` as the new content of the val: metadata first, then
    /// a new version carrying the code.
    pub async fn write(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        let _guard = self.write_lock.lock().await;
        let mut val = self.load(false).await?;

        let text = std::str::from_utf8(data)
            .map_err(|e| FsError::Invalid(format!("val {} is not utf-8: {}", val.id, e)))?;
        match package::update_val(&mut val, text) {
            Ok(()) => {}
            Err(e) if offset != 0 => {
                debug!("val {}: rejecting partial write at {}: {}", val.id, offset, e);
                return Err(FsError::Invalid(e.to_string()));
            }
            Err(PackageError::InvalidFrontmatter) => {
                debug!("val {}: no frontmatter, replacing code only", val.id);
                val.code = text.to_string();
            }
            Err(e) => return Err(e.into()),
        }

        let update = ValUpdateRequest {
            name: Some(val.name.clone()),
            val_type: (val.val_type != ValType::Unknown).then_some(val.val_type),
            privacy: Some(val.privacy),
            // An empty readme clears it remotely; `None` would leave it as is.
            readme: Some(val.readme.clone().unwrap_or_default()),
        };
        self.ctx.api.val_update(&val.id, &update).await.map_err(|e| {
            error!("update metadata of val {} failed: {}", val.id, e);
            FsError::from(e)
        })?;

        let code = if val.code.is_empty() {
            " ".to_string()
        } else {
            val.code.clone()
        };
        let created = self
            .ctx
            .api
            .val_create_version(&val.id, &ValVersionRequest { code })
            .await
            .map_err(|e| {
                error!("publish new version of val {} failed: {}", val.id, e);
                FsError::from(e)
            })?;
        debug!("val {}: published version {}", val.id, created.version);

        if self.ctx.config.static_meta {
            val.version = created.version;
            let now = SystemTime::now();
            self.set_modified_at(now.checked_sub(Duration::from_secs(1)).unwrap_or(now));
        } else {
            match self.ctx.api.val_get(&val.id).await {
                Ok(fresh) => val = fresh,
                Err(e) => {
                    warn!("reload val {} after write failed, keeping local copy: {}", val.id, e);
                    val.version = created.version;
                }
            }
            self.set_modified_at(SystemTime::now());
        }
        self.set_state(ValState::Full(val.clone()));

        self.ctx.prewarm.schedule(val.links.module.clone());
        Ok(data.len())
    }

    /// Renames the val remotely and refreshes the local copy.
    pub async fn rename_to(&self, name: &str, val_type: ValType) -> FsResult<()> {
        let id = self.id();
        let update = ValUpdateRequest {
            name: Some(name.to_string()),
            val_type: Some(val_type),
            ..Default::default()
        };
        self.ctx.api.val_update(&id, &update).await.map_err(|e| {
            error!("rename val {} to {} failed: {}", id, name, e);
            FsError::from(e)
        })?;

        if let Err(e) = self.load(true).await {
            warn!("val {} renamed, keeping local copy: {}", id, e);
            let state = match self.state() {
                ValState::Lazy(mut s) => {
                    s.name = name.to_string();
                    s.val_type = val_type;
                    ValState::Lazy(s)
                }
                ValState::Full(mut v) => {
                    v.name = name.to_string();
                    v.val_type = val_type;
                    ValState::Full(v)
                }
            };
            self.set_state(state);
        }
        Ok(())
    }
}

impl SyncedChild for ValFile {
    type Remote = ValSummary;

    fn remote_key(remote: &ValSummary) -> String {
        remote.id.clone()
    }

    fn remote_file_name(remote: &ValSummary) -> String {
        construct_val_filename(&remote.name, remote.val_type)
    }

    fn key(&self) -> String {
        self.id()
    }

    fn is_stale(&self, remote: &ValSummary) -> bool {
        remote.version > self.version()
    }

    fn replace_snapshot(&self, remote: ValSummary) {
        self.set_state(ValState::Lazy(remote));
        self.set_modified_at(SystemTime::now());
    }
}
