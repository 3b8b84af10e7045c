use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::crypto::{decrypt_data, sequence_iv, BLOCK_LEN};
use crate::http::{Fetch, Fetched};
use crate::naming::segment_file_name;
use crate::playlist::{fetch_and_parse_playlist, resolve_entries, Encryption, SegmentEntry};
use crate::session::SessionContext;

/// Suffix of a segment that is still being written.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Names of segments that have been claimed for download this session.
///
/// A name stays claimed after a successful download, even if the file is later
/// merged away, so the same segment is never fetched twice.
#[derive(Debug, Default)]
pub struct SeenSet {
    names: Mutex<HashSet<String>>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `name`; false if it was already claimed.
    pub fn try_claim(&self, name: &str) -> bool {
        self.names.lock().insert(name.to_string())
    }

    pub fn release(&self, name: &str) {
        self.names.lock().remove(name);
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
struct Decryption {
    key: Vec<u8>,
    iv: [u8; BLOCK_LEN],
}

/// Polls the playlist and publishes unseen segments into the work directory.
pub struct SegmentFetcher {
    client: Arc<dyn Fetch>,
    playlist_url: Url,
    /// Media playlist resolved from `playlist_url`, reused until a poll fails.
    media_url: Option<Url>,
    work_dir: PathBuf,
    seen: Arc<SeenSet>,
    keys: HashMap<Url, Vec<u8>>,
    max_concurrency: usize,
    poll_interval: Duration,
    burst_interval: Duration,
    /// Interrupts playlist and segment requests in flight.
    token: CancellationToken,
}

impl SegmentFetcher {
    pub fn new(ctx: &SessionContext, client: Arc<dyn Fetch>) -> Self {
        let config = &ctx.config;
        Self {
            client,
            playlist_url: config.playlist_url.clone(),
            media_url: None,
            work_dir: config.work_dir.clone(),
            seen: ctx.seen.clone(),
            keys: HashMap::new(),
            max_concurrency: config.download_concurrency.max(1),
            poll_interval: config.poll_interval,
            burst_interval: config.burst_poll_interval,
            token: ctx.shutdown.child_token(),
        }
    }

    /// Runs poll cycles until `token` is cancelled.
    ///
    /// Waits `burst_interval` after a cycle that published something and
    /// `poll_interval` otherwise.
    pub async fn run(mut self, token: CancellationToken) {
        info!("Segment fetcher started for {}", self.playlist_url);
        self.token = token.clone();

        while !token.is_cancelled() {
            let published = self.poll_once().await;
            let wait = if published > 0 {
                self.burst_interval
            } else {
                self.poll_interval
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Segment fetcher stopped ({} segments seen)", self.seen.len());
    }

    /// One poll cycle. Returns the number of segments newly published.
    ///
    /// Never fails: playlist errors abort the cycle with a warning and the
    /// next cycle starts from scratch.
    ///
    /// Downloads run as tasks owned by this call. On cancellation the pending
    /// requests are dropped and the call returns only after every task has
    /// finished, so no segment is written after it returns.
    pub async fn poll_once(&mut self) -> usize {
        let url = self.media_url.clone().unwrap_or_else(|| self.playlist_url.clone());

        let parsed = tokio::select! {
            _ = self.token.cancelled() => return 0,
            parsed = fetch_and_parse_playlist(self.client.as_ref(), url) => parsed,
        };
        let (playlist, base_url) = match parsed {
            Ok(result) => result,
            Err(e) => {
                warn!("Playlist fetch failed: {:#}", e);
                self.media_url = None;
                return 0;
            }
        };
        self.media_url = Some(base_url.clone());

        let mut jobs = Vec::new();
        for entry in resolve_entries(&playlist, &base_url) {
            let name = segment_file_name(entry.sequence, &entry.url);
            if !self.seen.try_claim(&name) {
                continue;
            }
            match self.decryption_for(&entry).await {
                Ok(decryption) => jobs.push((name, entry.url, decryption)),
                Err(e) => {
                    warn!("Skipping {}: {:#}", entry.url, e);
                    self.seen.release(&name);
                }
            }
        }

        if jobs.is_empty() {
            return 0;
        }
        debug!("{} new segments in playlist", jobs.len());

        let mut jobs = jobs.into_iter();
        let mut downloads = JoinSet::new();
        let mut published = 0;

        loop {
            while downloads.len() < self.max_concurrency && !self.token.is_cancelled() {
                let Some((name, segment_url, decryption)) = jobs.next() else {
                    break;
                };
                let client = self.client.clone();
                let output_path = self.work_dir.join(&name);
                let token = self.token.clone();

                downloads.spawn(async move {
                    let result = download_segment(client.as_ref(), &segment_url, &output_path, decryption.as_ref(), &token).await;
                    (name, segment_url, result)
                });
            }

            let Some(joined) = downloads.join_next().await else {
                break;
            };
            match joined {
                Ok((name, _, Ok(size))) => {
                    info!("Downloaded {} ({} bytes)", name, size);
                    published += 1;
                }
                Ok((name, segment_url, Err(e))) => {
                    if self.token.is_cancelled() {
                        debug!("Download of {} interrupted: {:#}", segment_url, e);
                    } else {
                        warn!("Failed to download {}: {:#}", segment_url, e);
                    }
                    self.seen.release(&name);
                }
                Err(e) => warn!("Tokio task failed: {}", e),
            }
        }

        // claims for entries never started are handed back
        for (name, _, _) in jobs {
            self.seen.release(&name);
        }
        published
    }

    async fn decryption_for(&mut self, entry: &SegmentEntry) -> Result<Option<Decryption>> {
        match &entry.encryption {
            Encryption::None => Ok(None),
            Encryption::Unsupported(method) => Err(anyhow!("unsupported encryption: {}", method)),
            Encryption::Aes128 { key_url, iv } => {
                let key = match self.keys.get(key_url) {
                    Some(key) => key.clone(),
                    None => {
                        let fetched = fetch_unless_cancelled(self.client.as_ref(), key_url, &self.token).await?;
                        if fetched.body.len() != BLOCK_LEN {
                            bail!("key {} has {} bytes", key_url, fetched.body.len());
                        }
                        let key = fetched.body.to_vec();
                        self.keys.insert(key_url.clone(), key.clone());
                        key
                    }
                };
                let iv = iv.unwrap_or_else(|| sequence_iv(entry.sequence));
                Ok(Some(Decryption { key, iv }))
            }
        }
    }
}

/// Path a segment is written to before it is published under `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

async fn fetch_unless_cancelled(client: &dyn Fetch, url: &Url, token: &CancellationToken) -> Result<Fetched> {
    tokio::select! {
        _ = token.cancelled() => Err(anyhow!("cancelled")),
        fetched = client.get(url) => fetched,
    }
}

/// 下载单个分段
///
/// Bytes land in a temporary sibling first and are renamed into place only
/// after a complete write, so readers see the segment whole or not at all.
/// Cancellation interrupts the request; a body already received is still
/// written out.
async fn download_segment(
    client: &dyn Fetch,
    url: &Url,
    path: &Path,
    decryption: Option<&Decryption>,
    token: &CancellationToken,
) -> Result<u64> {
    let tmp = temp_path(path);
    let result = write_segment(client, url, path, &tmp, decryption, token).await;
    if result.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    result
}

async fn write_segment(
    client: &dyn Fetch,
    url: &Url,
    path: &Path,
    tmp: &Path,
    decryption: Option<&Decryption>,
    token: &CancellationToken,
) -> Result<u64> {
    let fetched = fetch_unless_cancelled(client, url, token).await?;
    if fetched.body.is_empty() {
        bail!("empty segment body");
    }

    let data = match decryption {
        Some(d) => decrypt_data(&fetched.body, &d.key, &d.iv)?,
        None => fetched.body.to_vec(),
    };

    let mut file = fs::File::create(tmp).await?;
    file.write_all(&data).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(tmp, path).await?;
    Ok(data.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionConfig, SessionContext};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PLAYLIST: &str = "https://live.test/index.m3u8";

    struct FakeFetch {
        playlist: Mutex<String>,
        failing: Mutex<HashSet<String>>,
        segment_gets: AtomicUsize,
    }

    impl FakeFetch {
        fn new(segments: &[&str]) -> Self {
            let fetch = Self {
                playlist: Mutex::new(String::new()),
                failing: Mutex::new(HashSet::new()),
                segment_gets: AtomicUsize::new(0),
            };
            fetch.set_segments(0, segments);
            fetch
        }

        fn set_segments(&self, media_sequence: u64, segments: &[&str]) {
            let mut body = format!("#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:{}\n", media_sequence);
            for s in segments {
                body.push_str(&format!("#EXTINF:2.0,\n{}\n", s));
            }
            *self.playlist.lock() = body;
        }
    }

    #[async_trait]
    impl Fetch for FakeFetch {
        async fn get(&self, url: &Url) -> Result<Fetched> {
            if url.as_str() == PLAYLIST {
                let body = self.playlist.lock().clone();
                return Ok(Fetched { url: url.clone(), body: Bytes::from(body) });
            }
            self.segment_gets.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().contains(url.as_str()) {
                bail!("503 for {}", url);
            }
            Ok(Fetched { url: url.clone(), body: Bytes::from(format!("data:{}", url)) })
        }
    }

    fn fetcher(dir: &Path, fetch: Arc<FakeFetch>) -> SegmentFetcher {
        let mut config = SessionConfig::new(Url::parse(PLAYLIST).unwrap(), dir);
        config.poll_interval = Duration::from_millis(20);
        config.burst_poll_interval = Duration::from_millis(5);
        let ctx = SessionContext::new(config, CancellationToken::new());
        SegmentFetcher::new(&ctx, fetch)
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn seen_set_claims_once() {
        let seen = SeenSet::new();
        assert!(seen.try_claim("a.ts"));
        assert!(!seen.try_claim("a.ts"));
        seen.release("a.ts");
        assert!(seen.try_claim("a.ts"));
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let seen = Arc::new(SeenSet::new());
        let winners: usize = (0..8)
            .map(|_| {
                let seen = seen.clone();
                std::thread::spawn(move || seen.try_claim("race.ts") as usize)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn publishes_new_segments_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new(&["a.ts", "b.ts"]));
        let mut fetcher = fetcher(dir.path(), fetch.clone());

        assert_eq!(fetcher.poll_once().await, 2);
        assert_eq!(listing(dir.path()), ["000000000000_a.ts", "000000000001_b.ts"]);
        let body = std::fs::read_to_string(dir.path().join("000000000000_a.ts")).unwrap();
        assert_eq!(body, "data:https://live.test/a.ts");

        // removed externally: still not downloaded again
        std::fs::remove_file(dir.path().join("000000000000_a.ts")).unwrap();
        assert_eq!(fetcher.poll_once().await, 0);
        assert_eq!(fetch.segment_gets.load(Ordering::SeqCst), 2);

        fetch.set_segments(1, &["b.ts", "c.ts"]);
        assert_eq!(fetcher.poll_once().await, 1);
        assert_eq!(listing(dir.path()), ["000000000001_b.ts", "000000000002_c.ts"]);
    }

    #[tokio::test]
    async fn failed_download_leaves_nothing_and_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new(&["a.ts"]));
        fetch.failing.lock().insert("https://live.test/a.ts".to_string());
        let mut fetcher = fetcher(dir.path(), fetch.clone());

        assert_eq!(fetcher.poll_once().await, 0);
        assert!(listing(dir.path()).is_empty());
        assert!(fetcher.seen.is_empty());

        fetch.failing.lock().clear();
        assert_eq!(fetcher.poll_once().await, 1);
        assert_eq!(listing(dir.path()), ["000000000000_a.ts"]);
    }

    #[tokio::test]
    async fn unrenamed_temp_file_is_not_a_segment() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("000000000007_x.ts");
        // a crash between write and rename leaves only the temp sibling
        std::fs::write(temp_path(&target), b"partial").unwrap();

        assert!(!target.exists());
        let segments = crate::merger::list_segments(dir.path()).await.unwrap();
        assert!(segments.is_empty());
    }

    #[tokio::test]
    async fn playlist_failure_is_not_fatal() {
        struct Down;
        #[async_trait]
        impl Fetch for Down {
            async fn get(&self, url: &Url) -> Result<Fetched> {
                bail!("connection refused: {}", url)
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::new(Url::parse(PLAYLIST).unwrap(), dir.path());
        let ctx = SessionContext::new(config, CancellationToken::new());
        let mut fetcher = SegmentFetcher::new(&ctx, Arc::new(Down));
        assert_eq!(fetcher.poll_once().await, 0);
        assert!(fetcher.media_url.is_none());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new(&["a.ts"]));
        let token = CancellationToken::new();
        let handle = tokio::spawn(fetcher(dir.path(), fetch).run(token.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(listing(dir.path()), ["000000000000_a.ts"]);
    }

    #[tokio::test]
    async fn cancel_interrupts_downloads_in_flight() {
        struct Stalled;
        #[async_trait]
        impl Fetch for Stalled {
            async fn get(&self, url: &Url) -> Result<Fetched> {
                if url.as_str() != PLAYLIST {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                let body = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\na.ts\n#EXTINF:2.0,\nb.ts\n";
                Ok(Fetched { url: url.clone(), body: Bytes::from(body) })
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::new(Url::parse(PLAYLIST).unwrap(), dir.path());
        let ctx = SessionContext::new(config, CancellationToken::new());
        let mut fetcher = SegmentFetcher::new(&ctx, Arc::new(Stalled));

        let shutdown = ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        });

        let published = tokio::time::timeout(Duration::from_secs(2), fetcher.poll_once()).await.unwrap();
        assert_eq!(published, 0);
        assert!(listing(dir.path()).is_empty());
        assert!(fetcher.seen.is_empty());
    }
}
