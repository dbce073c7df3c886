use bytes::Bytes;
use futures::stream::{self, StreamExt};
use log::debug;
use reqwest::Method;

use crate::{ApiResult, ByteStream, ValTownApi};

pub fn blob_path(key: &str) -> String {
    format!("/blob/{}", urlencoding::encode(key))
}

pub fn empty_stream() -> ByteStream {
    stream::empty::<std::io::Result<Bytes>>().boxed()
}

pub fn bytes_stream(data: Vec<u8>) -> ByteStream {
    stream::once(async move { Ok::<Bytes, std::io::Error>(Bytes::from(data)) }).boxed()
}

/// Opens the blob body as a stream; nothing is buffered.
pub async fn blob_get(api: &dyn ValTownApi, key: &str) -> ApiResult<ByteStream> {
    debug!("GET blob {}", key);
    let resp = api.raw_request(Method::GET, &blob_path(key), None).await?;
    Ok(resp.body)
}

/// Creates or overwrites `key` with the streamed body.
pub async fn blob_put(api: &dyn ValTownApi, key: &str, body: ByteStream) -> ApiResult<()> {
    debug!("POST blob {}", key);
    let resp = api
        .raw_request(Method::POST, &blob_path(key), Some(body))
        .await?;
    debug!("POST blob {} => {}", key, resp.status);
    Ok(())
}
