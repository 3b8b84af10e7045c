pub mod cli;
pub mod http;
pub mod naming;
pub mod playlist;
pub mod crypto;
pub mod fetcher;
pub mod merger;
pub mod retry;
pub mod telegram;
pub mod tracker;
pub mod session;

use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::cli::Args;
use crate::fetcher::SegmentFetcher;
use crate::http::build_http_client;
use crate::merger::{BatchMerger, FfmpegRemuxer};
use crate::session::{SessionContext, SessionController, StopReason};
use crate::telegram::TelegramUploader;
use crate::tracker::DeliveryTracker;

/// 运行一次镜像会话，直到满足停止条件
///
/// Configuration problems fail before any work starts; everything after that
/// is retried inside the session and only cleanup decides the outcome.
pub async fn run(args: Args, shutdown: CancellationToken) -> Result<StopReason> {
    let config = args.session_config()?;

    fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("failed to create {:?}", config.work_dir))?;
    info!("Working directory: {:?}", config.work_dir);

    let client = Arc::new(build_http_client(&args.headers, Duration::from_secs(args.http_timeout_secs))?);
    let uploader = Arc::new(TelegramUploader::new(args.telegram_config())?);
    let remuxer = Arc::new(FfmpegRemuxer::new(args.ffmpeg_path.as_deref()));

    let ctx = SessionContext::new(config, shutdown);
    let fetcher = SegmentFetcher::new(&ctx, client);
    let merger = BatchMerger::new(&ctx.config, remuxer);
    let tracker = DeliveryTracker::new(&ctx.config, uploader);

    SessionController::new(ctx, fetcher, merger, tracker).run().await
}
