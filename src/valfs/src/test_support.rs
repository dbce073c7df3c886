use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use valtown_lib::{
    bytes_stream, empty_stream, ApiError, ApiResult, BlobInfo, ByteStream, Method, Page,
    RawResponse, StatusCode, User, Val, ValAuthor, ValCreateRequest, ValLinks, ValPrivacy, ValSummary, ValTownApi,
    ValType, ValUpdateRequest, ValVersionRequest,
};

use crate::blob_upload::UploadTimeouts;
use crate::config::ValfsConfig;
use crate::container::FsContext;
use crate::notify::Invalidator;

pub const TEST_USER_ID: &str = "user-1";

pub struct StoredBlob {
    pub data: Vec<u8>,
    pub modified: DateTime<Utc>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    vals: BTreeMap<String, Val>,
    blobs: BTreeMap<String, StoredBlob>,
    fail_val_update: HashSet<String>,
    fail_val_get: HashSet<String>,
    fail_blob_post: HashSet<String>,
    fail_blob_delete: HashSet<String>,
    posts_in_flight: usize,
    max_posts_in_flight: usize,
    next_id: u64,
}

/// In-memory Val Town. Every call is recorded as `"<op>:<id or key>"`.
#[derive(Default)]
pub struct MockValTown {
    state: Mutex<MockState>,
}

struct InFlight<'a>(&'a Mutex<MockState>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.posts_in_flight -= 1;
        }
    }
}

fn not_found(info: String) -> ApiError {
    ApiError::from_http_status(StatusCode::NOT_FOUND, info)
}

fn server_error(info: String) -> ApiError {
    ApiError::from_http_status(StatusCode::INTERNAL_SERVER_ERROR, info)
}

fn module_link(name: &str, version: u64) -> String {
    format!("https://esm.town/v/tester/{}?v={}", name, version)
}

impl MockValTown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn record(&self, call: String) {
        self.with_state(|s| s.calls.push(call));
    }

    pub fn add_val(&self, id: &str, name: &str, val_type: ValType, code: &str) -> Val {
        let val = Val {
            id: id.to_string(),
            name: name.to_string(),
            val_type,
            privacy: ValPrivacy::Public,
            version: 1,
            code: code.to_string(),
            readme: Some("about".to_string()),
            author: Some(ValAuthor {
                id: TEST_USER_ID.to_string(),
                username: Some("tester".to_string()),
            }),
            links: ValLinks {
                website: format!("https://www.val.town/v/tester/{}", name),
                module: module_link(name, 1),
                endpoint: None,
                email: None,
            },
            created_at: Some(Utc::now()),
        };
        self.with_state(|s| s.vals.insert(id.to_string(), val.clone()));
        val
    }

    pub fn val(&self, id: &str) -> Option<Val> {
        self.with_state(|s| s.vals.get(id).cloned())
    }

    /// Changes a val behind the filesystem's back.
    pub fn edit_val_remotely(&self, id: &str, f: impl FnOnce(&mut Val)) {
        self.with_state(|s| {
            if let Some(val) = s.vals.get_mut(id) {
                f(val);
            }
        });
    }

    pub fn remove_val_remotely(&self, id: &str) {
        self.with_state(|s| s.vals.remove(id));
    }

    pub fn add_blob(&self, key: &str, data: &[u8]) {
        self.with_state(|s| {
            s.blobs.insert(
                key.to_string(),
                StoredBlob {
                    data: data.to_vec(),
                    modified: Utc::now() - ChronoDuration::seconds(60),
                },
            )
        });
    }

    /// Rewrites a blob with a newer modification time.
    pub fn touch_blob_remotely(&self, key: &str, data: &[u8]) {
        self.with_state(|s| {
            s.blobs.insert(
                key.to_string(),
                StoredBlob {
                    data: data.to_vec(),
                    modified: Utc::now() + ChronoDuration::seconds(60),
                },
            )
        });
    }

    pub fn remove_blob_remotely(&self, key: &str) {
        self.with_state(|s| s.blobs.remove(key));
    }

    pub fn blob_data(&self, key: &str) -> Option<Vec<u8>> {
        self.with_state(|s| s.blobs.get(key).map(|b| b.data.clone()))
    }

    pub fn blob_info(&self, key: &str) -> Option<BlobInfo> {
        self.with_state(|s| {
            s.blobs.get(key).map(|blob| BlobInfo {
                key: key.to_string(),
                size: Some(blob.data.len() as u64),
                last_modified: Some(blob.modified),
            })
        })
    }

    pub fn fail_val_update(&self, id: &str) {
        self.with_state(|s| s.fail_val_update.insert(id.to_string()));
    }

    pub fn fail_val_get(&self, id: &str) {
        self.with_state(|s| s.fail_val_get.insert(id.to_string()));
    }

    pub fn fail_blob_post(&self, key: &str) {
        self.with_state(|s| s.fail_blob_post.insert(key.to_string()));
    }

    pub fn fail_blob_delete(&self, key: &str) {
        self.with_state(|s| s.fail_blob_delete.insert(key.to_string()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with_state(|s| s.calls.clear());
    }

    pub fn count_calls(&self, call: &str) -> usize {
        self.with_state(|s| s.calls.iter().filter(|c| c.as_str() == call).count())
    }

    pub fn max_posts_in_flight(&self) -> usize {
        self.with_state(|s| s.max_posts_in_flight)
    }

    async fn post_blob(&self, key: String, body: Option<ByteStream>) -> ApiResult<RawResponse> {
        self.with_state(|s| {
            s.posts_in_flight += 1;
            s.max_posts_in_flight = s.max_posts_in_flight.max(s.posts_in_flight);
        });
        let _in_flight = InFlight(&self.state);

        if self.with_state(|s| s.fail_blob_post.contains(&key)) {
            return Err(server_error(format!("POST /blob/{}", key)));
        }
        let mut data = Vec::new();
        if let Some(mut body) = body {
            while let Some(chunk) = body.next().await {
                data.extend_from_slice(&chunk?);
            }
        }
        self.with_state(|s| {
            s.calls.push(format!("blob_post_done:{}", key));
            s.blobs.insert(
                key,
                StoredBlob {
                    data,
                    modified: Utc::now(),
                },
            );
        });
        Ok(RawResponse {
            status: StatusCode::OK,
            body: empty_stream(),
        })
    }
}

#[async_trait]
impl ValTownApi for MockValTown {
    async fn me_get(&self) -> ApiResult<User> {
        self.record("me_get".to_string());
        Ok(User {
            id: TEST_USER_ID.to_string(),
            username: Some("tester".to_string()),
        })
    }

    async fn vals_list(
        &self,
        user_id: &str,
        offset: u64,
        limit: u64,
    ) -> ApiResult<Page<ValSummary>> {
        self.record(format!("vals_list:{}", offset));
        if user_id != TEST_USER_ID {
            return Err(not_found(format!("user {}", user_id)));
        }
        let data = self.with_state(|s| {
            s.vals
                .values()
                .skip(offset as usize)
                .take(limit as usize)
                .map(ValSummary::from)
                .collect()
        });
        Ok(Page { data })
    }

    async fn val_get(&self, id: &str) -> ApiResult<Val> {
        self.record(format!("val_get:{}", id));
        if self.with_state(|s| s.fail_val_get.contains(id)) {
            return Err(server_error(format!("GET /vals/{}", id)));
        }
        self.val(id).ok_or_else(|| not_found(format!("val {}", id)))
    }

    async fn val_create(&self, req: &ValCreateRequest) -> ApiResult<Val> {
        self.record(format!("val_create:{}", req.name));
        let id = self.with_state(|s| {
            s.next_id += 1;
            format!("new-{}", s.next_id)
        });
        let val = self.add_val(&id, &req.name, req.val_type, &req.code);
        self.edit_val_remotely(&id, |v| {
            v.privacy = req.privacy;
            v.readme = None;
        });
        Ok(self.val(&id).unwrap_or(val))
    }

    async fn val_create_version(&self, id: &str, req: &ValVersionRequest) -> ApiResult<Val> {
        self.record(format!("val_create_version:{}", id));
        self.with_state(|s| -> ApiResult<Val> {
            let val = s
                .vals
                .get_mut(id)
                .ok_or_else(|| not_found(format!("val {}", id)))?;
            val.code = req.code.clone();
            val.version += 1;
            val.links.module = module_link(&val.name, val.version);
            Ok(val.clone())
        })
    }

    async fn val_update(&self, id: &str, req: &ValUpdateRequest) -> ApiResult<()> {
        self.record(format!("val_update:{}", id));
        self.with_state(|s| -> ApiResult<()> {
            if s.fail_val_update.contains(id) {
                return Err(server_error(format!("PUT /vals/{}", id)));
            }
            let val = s
                .vals
                .get_mut(id)
                .ok_or_else(|| not_found(format!("val {}", id)))?;
            if let Some(name) = &req.name {
                val.name = name.clone();
            }
            if let Some(val_type) = req.val_type {
                val.val_type = val_type;
            }
            if let Some(privacy) = req.privacy {
                val.privacy = privacy;
            }
            if let Some(readme) = &req.readme {
                val.readme = (!readme.is_empty()).then(|| readme.clone());
            }
            Ok(())
        })
    }

    async fn val_delete(&self, id: &str) -> ApiResult<()> {
        self.record(format!("val_delete:{}", id));
        self.with_state(|s| {
            s.vals
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| not_found(format!("val {}", id)))
        })
    }

    async fn blobs_list(&self) -> ApiResult<Vec<BlobInfo>> {
        self.record("blobs_list".to_string());
        Ok(self.with_state(|s| {
            s.blobs
                .iter()
                .map(|(key, blob)| BlobInfo {
                    key: key.clone(),
                    size: Some(blob.data.len() as u64),
                    last_modified: Some(blob.modified),
                })
                .collect()
        }))
    }

    async fn blobs_delete(&self, key: &str) -> ApiResult<()> {
        self.record(format!("blob_delete:{}", key));
        self.with_state(|s| {
            if s.fail_blob_delete.contains(key) {
                return Err(server_error(format!("DELETE /blob/{}", key)));
            }
            s.blobs
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| not_found(format!("blob {}", key)))
        })
    }

    async fn raw_request(
        &self,
        method: Method,
        path: &str,
        body: Option<ByteStream>,
    ) -> ApiResult<RawResponse> {
        let encoded = path
            .strip_prefix("/blob/")
            .ok_or_else(|| ApiError::InvalidParam(path.to_string()))?;
        let key = urlencoding::decode(encoded)
            .map_err(|e| ApiError::InvalidParam(e.to_string()))?
            .into_owned();
        if method == Method::GET {
            self.record(format!("blob_get:{}", key));
            let data = self
                .blob_data(&key)
                .ok_or_else(|| not_found(format!("blob {}", key)))?;
            Ok(RawResponse {
                status: StatusCode::OK,
                body: bytes_stream(data),
            })
        } else if method == Method::POST {
            self.record(format!("blob_post:{}", key));
            self.post_blob(key, body).await
        } else {
            Err(ApiError::InvalidParam(format!("{} {}", method, path)))
        }
    }
}

/// Collects kernel notifications as `"entry:<parent>:<name>"` and
/// `"inode:<ino>"`.
#[derive(Clone, Default)]
pub struct RecordingInvalidator {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl RecordingInvalidator {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl Invalidator for RecordingInvalidator {
    fn inval_entry(&self, parent: u64, name: &OsStr) -> io::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("entry:{}:{}", parent, name.to_string_lossy()));
        Ok(())
    }

    fn inval_inode(&self, ino: u64) -> io::Result<()> {
        self.events.lock().unwrap().push(format!("inode:{}", ino));
        Ok(())
    }
}

pub fn test_config() -> ValfsConfig {
    ValfsConfig {
        deno_cache: false,
        auto_refresh: false,
        ..ValfsConfig::default()
    }
}

pub fn short_timeouts() -> UploadTimeouts {
    UploadTimeouts {
        write_idle: Duration::from_millis(100),
        finish: Duration::from_secs(5),
    }
}

/// A context over `api` whose scratch files live in a fresh temp dir.
pub struct TestEnv {
    pub api: Arc<MockValTown>,
    pub ctx: Arc<FsContext>,
    pub scratch: TempDir,
}

impl TestEnv {
    pub fn new(api: Arc<MockValTown>) -> Self {
        Self::with_config(api, test_config(), short_timeouts())
    }

    pub fn with_config(api: Arc<MockValTown>, config: ValfsConfig, timeouts: UploadTimeouts) -> Self {
        let scratch = TempDir::new().unwrap();
        let remote: Arc<dyn ValTownApi> = api.clone();
        let ctx = FsContext::new(remote, config)
            .with_scratch_dir(scratch.path().join("scratch"))
            .with_upload_timeouts(timeouts);
        Self {
            api,
            ctx: Arc::new(ctx),
            scratch,
        }
    }
}
