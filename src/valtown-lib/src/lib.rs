mod blob;
mod client;
mod types;


pub use blob::*;
pub use client::*;
pub use types::*;

pub use reqwest::{Method, StatusCode};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP error: {status} for {info}")]
    Http { status: StatusCode, info: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn from_http_status(status: StatusCode, info: String) -> Self {
        ApiError::Http { status, info }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Http { status, .. } if *status == StatusCode::NOT_FOUND)
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Network(err.to_string())
    }
}

/// Body of a raw request or response. Items are `io::Result` so the stream
/// plugs straight into `ReaderStream` / `StreamReader`.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

pub struct RawResponse {
    pub status: StatusCode,
    pub body: ByteStream,
}

/// Maximum page size accepted by the vals listing endpoint.
pub const PAGE_LIMIT: u64 = 99;

/// The remote operations the filesystem depends on. `ValTownClient` is the
/// HTTP implementation; tests substitute an in-memory one.
#[async_trait]
pub trait ValTownApi: Send + Sync {
    async fn me_get(&self) -> ApiResult<User>;

    async fn vals_list(&self, user_id: &str, offset: u64, limit: u64)
        -> ApiResult<Page<ValSummary>>;

    async fn val_get(&self, id: &str) -> ApiResult<Val>;

    async fn val_create(&self, req: &ValCreateRequest) -> ApiResult<Val>;

    /// Publishes new code only. The returned val carries the bumped version.
    async fn val_create_version(&self, id: &str, req: &ValVersionRequest) -> ApiResult<Val>;

    /// Metadata only. Must not be combined with a code change.
    async fn val_update(&self, id: &str, req: &ValUpdateRequest) -> ApiResult<()>;

    async fn val_delete(&self, id: &str) -> ApiResult<()>;

    async fn blobs_list(&self) -> ApiResult<Vec<BlobInfo>>;

    async fn blobs_delete(&self, key: &str) -> ApiResult<()>;

    /// Streaming escape hatch used for blob bodies. Non-2xx statuses come
    /// back as `ApiError::Http`.
    async fn raw_request(
        &self,
        method: Method,
        path: &str,
        body: Option<ByteStream>,
    ) -> ApiResult<RawResponse>;
}

/// Walks the paginated vals listing until a short page comes back.
pub async fn list_all_vals(api: &dyn ValTownApi, user_id: &str) -> ApiResult<Vec<ValSummary>> {
    let mut all = Vec::new();
    let mut offset = 0u64;
    loop {
        let page = api.vals_list(user_id, offset, PAGE_LIMIT).await?;
        let count = page.data.len() as u64;
        all.extend(page.data);
        if count < PAGE_LIMIT {
            break;
        }
        offset += count;
    }
    Ok(all)
}
