use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::session::SessionConfig;
use crate::telegram::TelegramConfig;

/// Mirrors a live HLS stream into a Telegram chat.
///
/// Every option can also be given through the environment variable named
/// next to it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Telegram bot token.
    #[arg(long, env = "bot_token", hide_env_values = true)]
    pub bot_token: String,

    /// Telegram chat or channel ID to deliver to.
    #[arg(long, env = "channel_id")]
    pub channel_id: String,

    /// The M3U8 playlist URL to mirror.
    #[arg(short, long, env = "m3u8_url")]
    pub url: String,

    /// Working directory for segments, outputs and delivery state.
    #[arg(short, long, env = "WORK_DIR", default_value = ".")]
    pub work_dir: PathBuf,

    /// Path to the FFmpeg executable.
    #[arg(long, env = "FFMPEG_PATH")]
    pub ffmpeg_path: Option<PathBuf>,

    /// Maximum number of concurrent segment downloads per poll.
    #[arg(short, long, env = "THREADS", default_value_t = 4)]
    pub threads: usize,

    /// Segments merged into one output file.
    #[arg(long, env = "BATCH_SIZE", default_value_t = 5)]
    pub batch_size: usize,

    /// Seconds a short final batch must stay untouched before it is merged.
    #[arg(long, env = "MERGE_IDLE_SECS", default_value_t = 30)]
    pub merge_idle_secs: u64,

    /// Hard cap on the session length, in seconds.
    #[arg(long, env = "MAX_DURATION_SECS", default_value_t = 9000)]
    pub max_duration_secs: u64,

    /// Stop after this many seconds without new files.
    #[arg(long, env = "MAX_IDLE_SECS", default_value_t = 9000)]
    pub max_idle_secs: u64,

    /// Pause between merge/delivery passes, in seconds.
    #[arg(long, env = "LOOP_INTERVAL_SECS", default_value_t = 10)]
    pub loop_interval_secs: u64,

    /// Playlist poll interval when nothing new showed up, in seconds.
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// Playlist poll interval right after new segments, in seconds.
    #[arg(long, env = "BURST_POLL_SECS", default_value_t = 1)]
    pub burst_poll_secs: u64,

    /// Newest unsent outputs subject to the hold-back age.
    #[arg(long, env = "HOLD_BACK_COUNT", default_value_t = 5)]
    pub hold_back_count: usize,

    /// Seconds a held-back output must have been known before it is sent.
    #[arg(long, env = "HOLD_BACK_SECS", default_value_t = 180)]
    pub hold_back_secs: u64,

    /// Delay between upload attempts, in seconds.
    #[arg(long, env = "UPLOAD_RETRY_SECS", default_value_t = 5)]
    pub upload_retry_secs: u64,

    /// Timeout for playlist and segment requests, in seconds.
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,

    /// Telegram Bot API root.
    #[arg(long, env = "TELEGRAM_API_BASE", default_value = "https://api.telegram.org")]
    pub api_base: String,

    /// Delivery state file, relative to the working directory.
    #[arg(long, env = "STATE_FILE", default_value = crate::session::STATE_FILE)]
    pub state_file: PathBuf,

    /// Custom HTTP header(s). E.g., -H "Cookie: mycookie"
    #[arg(short = 'H', long = "header", action = clap::ArgAction::Append)]
    pub headers: Vec<String>,
}

impl Args {
    /// Pipeline settings; an unparsable playlist URL is a configuration error.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let playlist_url = Url::parse(&self.url)
            .with_context(|| format!("invalid playlist URL: {}", self.url))?;

        let mut config = SessionConfig::new(playlist_url, self.work_dir.clone());
        config.download_concurrency = self.threads;
        config.batch_size = self.batch_size;
        config.merge_idle_threshold = Duration::from_secs(self.merge_idle_secs);
        config.max_duration = Duration::from_secs(self.max_duration_secs);
        config.max_idle = Duration::from_secs(self.max_idle_secs);
        config.loop_interval = Duration::from_secs(self.loop_interval_secs);
        config.poll_interval = Duration::from_secs(self.poll_interval_secs);
        config.burst_poll_interval = Duration::from_secs(self.burst_poll_secs);
        config.hold_back_count = self.hold_back_count;
        config.hold_back_age = Duration::from_secs(self.hold_back_secs);
        config.upload_retry_delay = Duration::from_secs(self.upload_retry_secs);
        config.state_file = self.state_file.clone();
        Ok(config)
    }

    pub fn telegram_config(&self) -> TelegramConfig {
        TelegramConfig {
            api_base: self.api_base.clone(),
            bot_token: self.bot_token.clone(),
            chat_id: self.channel_id.clone(),
        }
    }
}

pub fn parse_args() -> Args {
    Args::parse()
}
