use async_trait::async_trait;
use futures_util::StreamExt;
use log::*;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Body, Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::*;

pub const DEFAULT_API_BASE_URL: &str = "https://api.val.town/v1";

/// HTTP implementation of `ValTownApi`. One `reqwest::Client` is shared by
/// every call; the struct is immutable after construction.
pub struct ValTownClient {
    base_url: String,
    http: Client,
}

impl ValTownClient {
    pub fn new(base_url: &str, api_key: &str) -> ApiResult<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| ApiError::InvalidParam(format!("invalid api key: {}", e)))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        // No overall timeout: blob bodies can take arbitrarily long to stream.
        let http = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ApiError::Internal(format!("Failed to create client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, req: RequestBuilder, info: &str) -> ApiResult<Response> {
        let res = req
            .send()
            .await
            .map_err(|e| ApiError::Network(format!("{} failed: {}", info, e)))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!("{} => {} {}", info, status, body.trim());
            return Err(ApiError::from_http_status(
                status,
                format!("{} {}", info, body.trim()),
            ));
        }
        debug!("{} => {}", info, status);
        Ok(res)
    }

    async fn decode<T: DeserializeOwned>(res: Response, info: &str) -> ApiResult<T> {
        res.json::<T>()
            .await
            .map_err(|e| ApiError::Decode(format!("{}: {}", info, e)))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        let info = format!("GET {}", path);
        let res = self.send(self.http.get(self.url(path)), &info).await?;
        Self::decode(res, &info).await
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> ApiResult<Response> {
        let info = format!("{} {}", method, path);
        let req = self.http.request(method, self.url(path)).json(body);
        self.send(req, &info).await
    }
}

#[async_trait]
impl ValTownApi for ValTownClient {
    async fn me_get(&self) -> ApiResult<User> {
        self.get_json("/me").await
    }

    async fn vals_list(
        &self,
        user_id: &str,
        offset: u64,
        limit: u64,
    ) -> ApiResult<Page<ValSummary>> {
        let path = format!("/users/{}/vals", urlencoding::encode(user_id));
        let info = format!("GET {}?offset={}&limit={}", path, offset, limit);
        let req = self
            .http
            .get(self.url(&path))
            .query(&[("offset", offset), ("limit", limit)]);
        let res = self.send(req, &info).await?;
        Self::decode(res, &info).await
    }

    async fn val_get(&self, id: &str) -> ApiResult<Val> {
        self.get_json(&format!("/vals/{}", urlencoding::encode(id)))
            .await
    }

    async fn val_create(&self, req: &ValCreateRequest) -> ApiResult<Val> {
        let res = self.send_json(Method::POST, "/vals", req).await?;
        Self::decode(res, "POST /vals").await
    }

    async fn val_create_version(&self, id: &str, req: &ValVersionRequest) -> ApiResult<Val> {
        let path = format!("/vals/{}/versions", urlencoding::encode(id));
        let res = self.send_json(Method::POST, &path, req).await?;
        Self::decode(res, &path).await
    }

    async fn val_update(&self, id: &str, req: &ValUpdateRequest) -> ApiResult<()> {
        let path = format!("/vals/{}", urlencoding::encode(id));
        self.send_json(Method::PUT, &path, req).await?;
        Ok(())
    }

    async fn val_delete(&self, id: &str) -> ApiResult<()> {
        let path = format!("/vals/{}", urlencoding::encode(id));
        let info = format!("DELETE {}", path);
        self.send(self.http.delete(self.url(&path)), &info).await?;
        Ok(())
    }

    async fn blobs_list(&self) -> ApiResult<Vec<BlobInfo>> {
        self.get_json("/blob/list").await
    }

    async fn blobs_delete(&self, key: &str) -> ApiResult<()> {
        // The service answers 204 or 200 depending on the deployment.
        let path = blob_path(key);
        let info = format!("DELETE {}", path);
        self.send(self.http.delete(self.url(&path)), &info).await?;
        Ok(())
    }

    async fn raw_request(
        &self,
        method: Method,
        path: &str,
        body: Option<ByteStream>,
    ) -> ApiResult<RawResponse> {
        let info = format!("{} {}", method, path);
        let mut req = self.http.request(method, self.url(path));
        if let Some(body) = body {
            req = req
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(Body::wrap_stream(body));
        }
        let res = self.send(req, &info).await?;
        let status = res.status();
        let body = res
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })
            .boxed();
        Ok(RawResponse { status, body })
    }
}
