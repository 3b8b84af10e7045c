use anyhow::Result;
use futures::FutureExt;
use log::{error, info, warn};
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::fetcher::{SeenSet, SegmentFetcher};
use crate::merger::{cleanup_transient, BatchMerger};
use crate::tracker::DeliveryTracker;

/// How long the fetcher gets to acknowledge a stop before it is aborted.
const FETCHER_GRACE: Duration = Duration::from_secs(5);

pub const STATE_FILE: &str = "sent_videos.json";

/// Pipeline tunables for one run.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub playlist_url: Url,
    pub work_dir: PathBuf,
    pub download_concurrency: usize,
    pub poll_interval: Duration,
    pub burst_poll_interval: Duration,
    pub batch_size: usize,
    /// A short tail batch is merged once untouched for this long.
    pub merge_idle_threshold: Duration,
    pub hold_back_count: usize,
    pub hold_back_age: Duration,
    pub upload_retry_delay: Duration,
    pub max_duration: Duration,
    /// Stop once the work directory has not changed for this long.
    pub max_idle: Duration,
    pub loop_interval: Duration,
    pub state_file: PathBuf,
}

impl SessionConfig {
    /// Defaults for everything except the playlist and the work directory.
    pub fn new(playlist_url: Url, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            playlist_url,
            work_dir: work_dir.into(),
            download_concurrency: 4,
            poll_interval: Duration::from_secs(5),
            burst_poll_interval: Duration::from_secs(1),
            batch_size: 5,
            merge_idle_threshold: Duration::from_secs(30),
            hold_back_count: 5,
            hold_back_age: Duration::from_secs(180),
            upload_retry_delay: Duration::from_secs(5),
            max_duration: Duration::from_secs(9000),
            max_idle: Duration::from_secs(9000),
            loop_interval: Duration::from_secs(10),
            state_file: PathBuf::from(STATE_FILE),
        }
    }

    /// Delivery state path; relative names live in the work directory.
    pub fn state_path(&self) -> PathBuf {
        self.work_dir.join(&self.state_file)
    }
}

/// Everything the pipeline stages share for one run.
pub struct SessionContext {
    pub config: SessionConfig,
    /// Set once at shutdown.
    pub shutdown: CancellationToken,
    pub seen: Arc<SeenSet>,
}

impl SessionContext {
    pub fn new(config: SessionConfig, shutdown: CancellationToken) -> Self {
        Self {
            config,
            shutdown,
            seen: Arc::new(SeenSet::new()),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxDuration,
    Idle,
    /// The shutdown token was cancelled from outside (e.g. Ctrl-C).
    Cancelled,
}

/// Drives the fetcher in the background and the merger and tracker in the
/// foreground until a stop condition fires, then cleans up.
pub struct SessionController {
    ctx: SessionContext,
    fetcher: SegmentFetcher,
    merger: BatchMerger,
    tracker: DeliveryTracker,
}

impl SessionController {
    pub fn new(
        ctx: SessionContext,
        fetcher: SegmentFetcher,
        merger: BatchMerger,
        tracker: DeliveryTracker,
    ) -> Self {
        Self {
            ctx,
            fetcher,
            merger,
            tracker,
        }
    }

    /// Runs the session to completion.
    ///
    /// Transient files are removed however the loop ends, including on panic,
    /// which is resumed after cleanup.
    pub async fn run(self) -> Result<StopReason> {
        let Self {
            ctx,
            fetcher,
            merger,
            tracker,
        } = self;
        let config = &ctx.config;
        let shutdown = ctx.shutdown.clone();
        let start = Instant::now();

        let fetch_token = shutdown.child_token();
        let mut fetch_handle = tokio::spawn(fetcher.run(fetch_token.clone()));

        // hard cap also unblocks an upload stuck in its retry loop
        let stage_token = shutdown.child_token();
        let watchdog = {
            let stage_token = stage_token.clone();
            let cap = config.max_duration;
            tokio::spawn(async move {
                tokio::select! {
                    _ = stage_token.cancelled() => {}
                    _ = tokio::time::sleep(cap) => stage_token.cancel(),
                }
            })
        };

        let outcome = AssertUnwindSafe(drive(config, &merger, &tracker, &stage_token, start))
            .catch_unwind()
            .await;

        fetch_token.cancel();
        stage_token.cancel();
        watchdog.abort();
        match tokio::time::timeout(FETCHER_GRACE, &mut fetch_handle).await {
            Ok(_) => {}
            Err(_) => {
                warn!("Segment fetcher did not stop within {:?}, aborting", FETCHER_GRACE);
                fetch_handle.abort();
                let _ = fetch_handle.await;
            }
        }

        match cleanup_transient(&config.work_dir).await {
            Ok(removed) => info!("Cleanup removed {} transient files", removed),
            Err(e) => error!("Cleanup incomplete: {:#}", e),
        }

        let reason = match outcome {
            Ok(reason) => reason,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        // only the watchdog cancels the stage token without the shutdown token
        let reason = if reason == StopReason::Cancelled && !shutdown.is_cancelled() {
            StopReason::MaxDuration
        } else {
            reason
        };
        info!(
            "Session finished after {:?}: {:?}",
            start.elapsed(),
            reason
        );
        Ok(reason)
    }
}

async fn drive(
    config: &SessionConfig,
    merger: &BatchMerger,
    tracker: &DeliveryTracker,
    token: &CancellationToken,
    start: Instant,
) -> StopReason {
    let mut last_activity = start;

    loop {
        if token.is_cancelled() {
            return StopReason::Cancelled;
        }

        let before = snapshot(&config.work_dir).await;

        if let Err(e) = merger.run_once().await {
            error!("Merge pass failed: {:#}", e);
        }
        match tracker.run_once(token).await {
            Ok(sent) if sent > 0 => info!("Delivered {} artifacts", sent),
            Ok(_) => {}
            Err(e) => error!("Delivery pass failed: {:#}", e),
        }

        let after = snapshot(&config.work_dir).await;
        if before != after {
            last_activity = Instant::now();
        }

        let elapsed = start.elapsed();
        if elapsed >= config.max_duration {
            info!("Session reached its {:?} limit", config.max_duration);
            return StopReason::MaxDuration;
        }
        let idle = last_activity.elapsed();
        if idle >= config.max_idle {
            info!("No new files for {:?}, stopping", idle);
            return StopReason::Idle;
        }

        tokio::select! {
            _ = token.cancelled() => return StopReason::Cancelled,
            _ = tokio::time::sleep(config.loop_interval) => {}
        }
    }
}

/// File names currently in `dir`; an unreadable directory reads as empty.
async fn snapshot(dir: &Path) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let Ok(mut read_dir) = fs::read_dir(dir).await else {
        return names;
    };
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        names.insert(entry.file_name().to_string_lossy().into_owned());
    }
    names
}
