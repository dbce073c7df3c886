use futures::{stream, StreamExt};
use log::{debug, error, warn};
use std::fs::File;
use std::io::{self, SeekFrom};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use valtown_lib::{blob_put, ApiError, ApiResult, ByteStream, ValTownApi};

use crate::error::{FsError, FsResult};

/// Capacity of the pipe between the scratch file and the POST body.
pub const PIPE_CAPACITY: usize = 24 * 1024 * 1024;
pub const WRITE_IDLE_TIMEOUT: Duration = Duration::from_secs(15);
pub const FINISH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy)]
pub struct UploadTimeouts {
    /// Inactivity after which the pipe is closed and the POST allowed to end.
    pub write_idle: Duration,
    /// How long `finish` waits for the POST to return.
    pub finish: Duration,
}

impl Default for UploadTimeouts {
    fn default() -> Self {
        Self {
            write_idle: WRITE_IDLE_TIMEOUT,
            finish: FINISH_TIMEOUT,
        }
    }
}

struct Streaming {
    key: String,
    cancel: CancellationToken,
    close: Option<oneshot::Sender<()>>,
    feeder: JoinHandle<()>,
    post: JoinHandle<ApiResult<()>>,
    end_of_pipe: u64,
}

/// Turns a run of writes on a blob into one streaming POST whose body is
/// the scratch file. `None` state means idle.
pub struct BlobUpload {
    api: Arc<dyn ValTownApi>,
    timeouts: UploadTimeouts,
    state: Mutex<Option<Streaming>>,
}

impl BlobUpload {
    pub fn new(api: Arc<dyn ValTownApi>, timeouts: UploadTimeouts) -> Self {
        Self {
            api,
            timeouts,
            state: Mutex::new(None),
        }
    }

    /// True while a POST has been started and has not returned yet.
    pub fn ongoing(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state
                .as_ref()
                .map(|s| !s.post.is_finished())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn take_state(&self) -> Option<Streaming> {
        self.state.lock().ok().and_then(|mut state| state.take())
    }

    /// Records a write that already landed in `scratch` at `offset`.
    ///
    /// Every write restarts the upload, even when it continues exactly where
    /// the pipe ended, so the posted body is always the whole scratch file.
    pub async fn write(
        &self,
        key: &str,
        scratch: &File,
        offset: u64,
        data: &[u8],
    ) -> FsResult<()> {
        let previous_end = self
            .state
            .lock()
            .ok()
            .and_then(|state| state.as_ref().map(|s| s.end_of_pipe));
        if previous_end == Some(offset) {
            debug!(
                "blob {}: {} bytes at end of pipe {}, restarting upload",
                key,
                data.len(),
                offset
            );
        }
        self.cancel().await;
        self.start(key, scratch)
    }

    fn start(&self, key: &str, scratch: &File) -> FsResult<()> {
        let source = scratch
            .try_clone()
            .map_err(|e| FsError::Io(format!("clone scratch for {} failed: {}", key, e)))?;
        let end_of_pipe = source.metadata().map(|m| m.len()).unwrap_or(0);

        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let cancel = CancellationToken::new();
        let (close_tx, close_rx) = oneshot::channel();

        let body = cancellable_body(reader, cancel.clone());
        let post = tokio::spawn({
            let api = self.api.clone();
            let key = key.to_string();
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        Err(ApiError::Internal(format!("upload of {} cancelled", key)))
                    }
                    res = blob_put(api.as_ref(), &key, body) => res,
                }
            }
        });

        let feeder = tokio::spawn(feed_pipe(
            key.to_string(),
            tokio::fs::File::from_std(source),
            writer,
            cancel.clone(),
            close_rx,
            self.timeouts.write_idle,
        ));

        debug!("blob {}: upload started, {} bytes", key, end_of_pipe);
        let streaming = Streaming {
            key: key.to_string(),
            cancel,
            close: Some(close_tx),
            feeder,
            post,
            end_of_pipe,
        };
        match self.state.lock() {
            Ok(mut state) => {
                *state = Some(streaming);
                Ok(())
            }
            Err(_) => {
                streaming.cancel.cancel();
                Err(FsError::Io(format!("upload state of {} poisoned", key)))
            }
        }
    }

    /// Aborts the in-flight POST, if any, and waits for its tasks to exit.
    pub async fn cancel(&self) {
        let Some(streaming) = self.take_state() else {
            return;
        };
        streaming.cancel.cancel();
        drop(streaming.close);
        let _ = streaming.feeder.await;
        let _ = streaming.post.await;
        debug!("blob {}: upload cancelled", streaming.key);
    }

    /// Closes the pipe and waits up to the finish timeout for the POST.
    /// On timeout the upload is left to complete on its own and the state
    /// goes back to idle.
    pub async fn finish(&self) -> FsResult<()> {
        let Some(mut streaming) = self.take_state() else {
            return Ok(());
        };
        if let Some(close) = streaming.close.take() {
            let _ = close.send(());
        }

        let waited = tokio::time::timeout(self.timeouts.finish, async {
            let _ = (&mut streaming.feeder).await;
            (&mut streaming.post).await
        })
        .await;

        match waited {
            Ok(Ok(Ok(()))) => {
                debug!("blob {}: upload finished", streaming.key);
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                error!("blob {}: upload failed: {}", streaming.key, e);
                Err(e.into())
            }
            Ok(Err(e)) => {
                error!("blob {}: upload task failed: {}", streaming.key, e);
                Err(FsError::Io(e.to_string()))
            }
            Err(_) => {
                warn!(
                    "blob {}: upload still running after {:?}, no longer waiting",
                    streaming.key, self.timeouts.finish
                );
                Err(FsError::Io(format!("upload of {} timed out", streaming.key)))
            }
        }
    }
}

/// The POST body. Once `cancel` fires the stream ends in an error instead
/// of a clean EOF, so a half-fed body is never committed as the blob.
fn cancellable_body(reader: DuplexStream, cancel: CancellationToken) -> ByteStream {
    let until = cancel.clone();
    ReaderStream::new(reader)
        .take_until(async move { until.cancelled().await })
        .chain(
            stream::once(async move { cancel.is_cancelled() }).filter_map(|cancelled| async move {
                cancelled.then(|| {
                    Err(io::Error::new(io::ErrorKind::Interrupted, "upload cancelled"))
                })
            }),
        )
        .boxed()
}

async fn feed_pipe(
    key: String,
    mut source: tokio::fs::File,
    mut writer: DuplexStream,
    cancel: CancellationToken,
    close: oneshot::Receiver<()>,
    idle: Duration,
) {
    let copy = async {
        source.seek(SeekFrom::Start(0)).await?;
        tokio::io::copy(&mut source, &mut writer).await
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        res = copy => {
            if let Err(e) = res {
                // A dead POST drops the reader; it reports its own error.
                debug!("blob {}: feeding pipe stopped: {}", key, e);
                return;
            }
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        closed = close => {
            // A dropped sender means the upload was abandoned, not finished.
            if closed.is_err() {
                return;
            }
        }
        _ = tokio::time::sleep(idle) => {
            debug!("blob {}: no writes for {:?}, closing pipe", key, idle);
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("blob {}: closing pipe failed: {}", key, e);
    }
}
