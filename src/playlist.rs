use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use m3u8_rs::{KeyMethod, MediaPlaylist, Playlist};
use url::Url;

use crate::crypto::parse_iv;
use crate::http::Fetch;

const MAX_MASTER_HOPS: usize = 4;

/// How a segment's bytes are protected on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encryption {
    None,
    Aes128 { key_url: Url, iv: Option<[u8; 16]> },
    Unsupported(String),
}

/// One playlist entry resolved to an absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    pub url: Url,
    /// Media sequence number (`#EXT-X-MEDIA-SEQUENCE` + position).
    pub sequence: u64,
    pub encryption: Encryption,
}

/// 获取并解析M3U8播放列表
///
/// Master playlists are followed to their highest-bandwidth variant. Returns
/// the media playlist and the URL it was finally served from.
pub async fn fetch_and_parse_playlist(client: &dyn Fetch, url: Url) -> Result<(MediaPlaylist, Url)> {
    let mut url = url;

    for _ in 0..MAX_MASTER_HOPS {
        debug!("Fetching playlist from {}", url);

        let fetched = client.get(&url).await?;

        let playlist = m3u8_rs::parse_playlist_res(&fetched.body)
            .map_err(|e| anyhow!("Failed to parse M3U8 playlist: {}", e))?;

        match playlist {
            Playlist::MasterPlaylist(pl) => {
                info!("Master playlist found with {} variants.", pl.variants.len());

                let best_variant = pl.variants.iter()
                    .max_by_key(|v| v.bandwidth)
                    .ok_or_else(|| anyhow!("No variants found in master playlist"))?;

                info!("Selected variant with bandwidth: {}", best_variant.bandwidth);

                url = fetched.url.join(&best_variant.uri)?;
            }
            Playlist::MediaPlaylist(pl) => {
                debug!("Media playlist with {} segments.", pl.segments.len());
                return Ok((pl, fetched.url));
            }
        }
    }

    Err(anyhow!("Gave up after {} nested master playlists", MAX_MASTER_HOPS))
}

/// Resolves every entry of `playlist` against `base_url`, in playlist order.
///
/// A key tag applies to its segment and every later one until the next tag.
/// Entries whose URI cannot be joined are dropped with a warning.
pub fn resolve_entries(playlist: &MediaPlaylist, base_url: &Url) -> Vec<SegmentEntry> {
    let mut encryption = Encryption::None;
    let mut entries = Vec::with_capacity(playlist.segments.len());

    for (i, segment) in playlist.segments.iter().enumerate() {
        if let Some(key) = &segment.key {
            encryption = match &key.method {
                KeyMethod::None => Encryption::None,
                KeyMethod::AES128 => aes_encryption(key, base_url),
                other => Encryption::Unsupported(other.to_string()),
            };
        }

        let url = match base_url.join(&segment.uri) {
            Ok(url) => url,
            Err(e) => {
                warn!("无法解析分段URL: {} - 错误: {}", segment.uri, e);
                continue;
            }
        };

        entries.push(SegmentEntry {
            url,
            sequence: playlist.media_sequence + i as u64,
            encryption: encryption.clone(),
        });
    }

    entries
}

fn aes_encryption(key: &m3u8_rs::Key, base_url: &Url) -> Encryption {
    let Some(uri) = key.uri.as_deref() else {
        return Encryption::Unsupported("AES-128 without URI".to_string());
    };
    let key_url = match base_url.join(uri) {
        Ok(url) => url,
        Err(e) => return Encryption::Unsupported(format!("无法解析密钥URL: {} - 错误: {}", uri, e)),
    };
    let iv = match key.iv.as_deref().map(parse_iv).transpose() {
        Ok(iv) => iv,
        Err(e) => return Encryption::Unsupported(e.to_string()),
    };
    Encryption::Aes128 { key_url, iv }
}
