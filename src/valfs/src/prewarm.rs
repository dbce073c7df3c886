use log::{debug, warn};
use once_cell::sync::Lazy;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::process::Command;

const PREWARM_DELAY: Duration = Duration::from_secs(1);
const PREWARM_MIN_INTERVAL: Duration = Duration::from_secs(1);

// Shared by every mount in the process.
static PREWARM_LIMITER: Lazy<RateLimiter> = Lazy::new(|| RateLimiter::new(PREWARM_MIN_INTERVAL));

pub struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let Ok(mut last) = self.last.lock() else {
            return false;
        };
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Best-effort `deno cache --reload` of a val's module after it was saved,
/// so editors pick up the new version.
pub struct Prewarmer {
    enabled: bool,
}

impl Prewarmer {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn schedule(&self, module: String) {
        if !self.enabled || module.is_empty() {
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(PREWARM_DELAY).await;
            if !PREWARM_LIMITER.try_acquire() {
                debug!("prewarm of {} skipped, rate limited", module);
                return;
            }
            match Command::new("deno")
                .args(["cache", "--reload", module.as_str()])
                .output()
                .await
            {
                Ok(output) if output.status.success() => debug!("prewarmed {}", module),
                Ok(output) => warn!(
                    "prewarm of {} exited with {}: {}",
                    module,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => warn!("prewarm of {} failed to start: {}", module, e),
            }
        });
    }
}
