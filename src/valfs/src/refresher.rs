use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::container::Container;

/// One ticker per container re-running its refresh until stopped.
pub struct Refresher {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Refresher {
    pub fn start(handle: &Handle, containers: Vec<Arc<dyn Container>>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let workers = containers
            .into_iter()
            .map(|container| handle.spawn(Self::run(container, interval, cancel.clone())))
            .collect();
        info!("auto refresh every {:?}", interval);
        Self { cancel, workers }
    }

    async fn run(container: Arc<dyn Container>, interval: Duration, cancel: CancellationToken) {
        // The mount already ran one refresh; the first tick is one interval out.
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match container.refresh().await {
                Ok(Some(report)) if !report.is_empty() => {
                    debug!("{}: {}", container.name(), report)
                }
                Ok(_) => {}
                Err(e) => warn!("refresh of {} failed: {}", container.name(), e),
            }
        }
        debug!("{}: refresher stopped", container.name());
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
