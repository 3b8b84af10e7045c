use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use hls2tg::fetcher::SegmentFetcher;
use hls2tg::http::{Fetch, Fetched};
use hls2tg::merger::{cleanup_transient, list_outputs, list_segments, BatchMerger, Remuxer};
use hls2tg::session::{SessionConfig, SessionContext};
use hls2tg::telegram::{UploadError, Uploader};
use hls2tg::tracker::{unix_now, DeliveryStore, DeliveryTracker};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

const PLAYLIST: &str = "https://live.test/channel/index.m3u8";

struct LiveStream {
    segments: usize,
}

#[async_trait]
impl Fetch for LiveStream {
    async fn get(&self, url: &Url) -> Result<Fetched> {
        if url.as_str() == PLAYLIST {
            let mut body = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:100\n");
            for i in 0..self.segments {
                body.push_str(&format!("#EXTINF:2.0,\nseg{}.ts\n", i));
            }
            return Ok(Fetched { url: url.clone(), body: Bytes::from(body) });
        }
        match url.path().strip_prefix("/channel/") {
            Some(name) => Ok(Fetched {
                url: url.clone(),
                body: Bytes::from(format!("[{}]", name)),
            }),
            None => bail!("404 {}", url),
        }
    }
}

struct ConcatRemuxer;

#[async_trait]
impl Remuxer for ConcatRemuxer {
    async fn remux(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let mut data = Vec::new();
        for input in inputs {
            data.extend(tokio::fs::read(input).await?);
        }
        tokio::fs::write(output, data).await?;
        Ok(())
    }
}

#[derive(Default)]
struct Channel {
    received: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl Uploader for Channel {
    async fn upload_file(&self, path: &Path, caption: &str) -> Result<(), UploadError> {
        let data = tokio::fs::read(path).await.map_err(|source| UploadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.received.lock().push((caption.to_string(), data));
        Ok(())
    }
}

#[tokio::test]
async fn twelve_segments_become_three_deliveries() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SessionConfig::new(Url::parse(PLAYLIST).unwrap(), dir.path());
    config.merge_idle_threshold = Duration::from_millis(500);
    let ctx = SessionContext::new(config, CancellationToken::new());

    let mut fetcher = SegmentFetcher::new(&ctx, Arc::new(LiveStream { segments: 12 }));
    let merger = BatchMerger::new(&ctx.config, Arc::new(ConcatRemuxer));
    let channel = Arc::new(Channel::default());
    let tracker = DeliveryTracker::new(&ctx.config, channel.clone());

    assert_eq!(fetcher.poll_once().await, 12);
    assert_eq!(list_segments(dir.path()).await.unwrap().len(), 12);
    // nothing new on the next poll
    assert_eq!(fetcher.poll_once().await, 0);

    let merged = merger.run_once().await.unwrap();
    assert_eq!(merged.len(), 2);
    assert_eq!(
        list_segments(dir.path()).await.unwrap(),
        ["000000000110_seg10.ts", "000000000111_seg11.ts"]
    );

    tokio::time::sleep(Duration::from_millis(700)).await;
    let merged = merger.run_once().await.unwrap();
    assert_eq!(merged, [dir.path().join("000000000110_seg10.mp4")]);
    assert!(list_segments(dir.path()).await.unwrap().is_empty());
    assert_eq!(
        list_outputs(dir.path()).await.unwrap(),
        ["000000000100_seg0.mp4", "000000000105_seg5.mp4", "000000000110_seg10.mp4"]
    );

    let token = CancellationToken::new();
    let now = unix_now();
    assert_eq!(tracker.run_at(&token, now).await.unwrap(), 0);
    assert_eq!(tracker.run_at(&token, now + 181.0).await.unwrap(), 3);
    assert_eq!(tracker.run_at(&token, now + 400.0).await.unwrap(), 0);

    let received = channel.received.lock().clone();
    let captions: Vec<_> = received.iter().map(|(c, _)| c.as_str()).collect();
    assert_eq!(
        captions,
        ["000000000100_seg0.mp4", "000000000105_seg5.mp4", "000000000110_seg10.mp4"]
    );
    assert_eq!(received[2].1, b"[seg10.ts][seg11.ts]");

    let store = DeliveryStore::load(&ctx.config.state_path()).await;
    assert_eq!(store.len(), 3);
    assert!(store.unsent().is_empty());

    cleanup_transient(dir.path()).await.unwrap();
    assert!(list_segments(dir.path()).await.unwrap().is_empty());
    assert_eq!(list_outputs(dir.path()).await.unwrap().len(), 3);
}
