//! Cache watcher - Polls the cache file and broadcasts changes
//!
//! Secret-store backends touch a sentinel at the cache file path on every
//! write, so one watcher covers every backend.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Notification that the persisted cache changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheChangedEvent {
    /// Cache file that changed
    pub path: PathBuf,
    /// Whether the file exists after the change
    pub exists: bool,
    /// New modification time, if the file exists
    pub modified_at: Option<DateTime<Utc>>,
}

/// Configuration for the cache watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Interval between polls
    pub interval: Duration,
}

impl WatcherConfig {
    /// Shortest poll interval; shorter ones, zero included, are raised to it
    pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

    /// Interval actually used by the polling task
    pub fn effective_interval(&self) -> Duration {
        self.interval.max(Self::MIN_INTERVAL)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    modified: Option<SystemTime>,
    len: u64,
}

async fn snapshot(path: &Path) -> Option<Snapshot> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some(Snapshot {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

/// Background task polling one cache file
pub struct CacheWatcher {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CacheWatcher {
    /// Spawns the polling task on the current tokio runtime
    pub fn spawn(
        path: PathBuf,
        config: WatcherConfig,
        events: broadcast::Sender<CacheChangedEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let interval = config.effective_interval();
        if interval != config.interval {
            tracing::warn!(
                "Watch interval {:?} is too short, using {:?}",
                config.interval,
                interval
            );
        }

        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut last = snapshot(&path).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::debug!("Watching {} every {:?}", path.display(), interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("Cache watcher for {} stopped", path.display());
                        break;
                    }
                    _ = ticker.tick() => {
                        let current = snapshot(&path).await;
                        if current == last {
                            continue;
                        }
                        last = current;

                        let event = CacheChangedEvent {
                            path: path.clone(),
                            exists: current.is_some(),
                            modified_at: current
                                .and_then(|s| s.modified)
                                .map(DateTime::<Utc>::from),
                        };
                        tracing::debug!("Cache file changed: {:?}", event);
                        // No receivers is fine
                        let _ = events.send(event);
                    }
                }
            }
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Returns true while the polling task runs
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops polling and waits for the task to end
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Cache watcher ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for CacheWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
