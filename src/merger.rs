use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::fetcher::TEMP_SUFFIX;
use crate::session::SessionConfig;

pub const SEGMENT_EXT: &str = "ts";
pub const OUTPUT_EXT: &str = "mp4";
const PARTIAL_SUFFIX: &str = ".part";
const MANIFEST_SUFFIX: &str = ".concat.txt";

/// Repackages an ordered list of transport-stream files into one container.
#[async_trait]
pub trait Remuxer: Send + Sync {
    async fn remux(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;
}

/// Remuxes through the ffmpeg concat demuxer without re-encoding.
pub struct FfmpegRemuxer {
    ffmpeg: PathBuf,
}

impl FfmpegRemuxer {
    pub fn new(ffmpeg_path: Option<&Path>) -> Self {
        // 默认使用系统PATH中的ffmpeg
        let ffmpeg = match ffmpeg_path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from("ffmpeg"),
        };
        Self { ffmpeg }
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn remux(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let manifest_path = with_suffix(output, MANIFEST_SUFFIX);
        write_manifest(&manifest_path, inputs).await?;

        let result = Command::new(&self.ffmpeg)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(&manifest_path)
            .arg("-c")
            .arg("copy")
            .arg("-bsf:a")
            .arg("aac_adtstoasc")
            .arg("-movflags")
            .arg("+faststart")
            .arg("-f")
            .arg("mp4")
            .arg("-y")
            .arg(output)
            .kill_on_drop(true)
            .output()
            .await;

        // 删除临时文件列表
        let _ = fs::remove_file(&manifest_path).await;

        let out = result.map_err(|e| anyhow!("failed to run {:?}: {}", self.ffmpeg, e))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!(
                "FFmpeg failed with exit code {:?}: {}",
                out.status.code(),
                stderr.trim()
            ));
        }
        Ok(())
    }
}

/// Writes a concat-demuxer manifest listing `inputs` in order.
async fn write_manifest(path: &Path, inputs: &[PathBuf]) -> Result<()> {
    let mut file_list = fs::File::create(path).await?;
    for input in inputs {
        // the demuxer resolves relative entries against the manifest itself
        let name = input
            .file_name()
            .ok_or_else(|| anyhow!("not a file path: {:?}", input))?
            .to_string_lossy()
            .replace('\'', "'\\''");
        file_list.write_all(format!("file '{}'\n", name).as_bytes()).await?;
    }
    file_list.flush().await?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Output artifact name for a batch starting with `first_segment`.
pub fn output_name(first_segment: &str) -> String {
    let stem = first_segment
        .strip_suffix(".ts")
        .unwrap_or(first_segment);
    format!("{}.{}", stem, OUTPUT_EXT)
}

/// Lists published segment files in `dir`, sorted by name.
pub async fn list_segments(dir: &Path) -> Result<Vec<String>> {
    list_with_extension(dir, SEGMENT_EXT).await
}

/// Lists completed output artifacts in `dir`, sorted by name.
pub async fn list_outputs(dir: &Path) -> Result<Vec<String>> {
    list_with_extension(dir, OUTPUT_EXT).await
}

async fn list_with_extension(dir: &Path, ext: &str) -> Result<Vec<String>> {
    let mut read_dir = fs::read_dir(dir).await?;
    let mut names = Vec::new();

    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == ext) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Groups sorted segment names into fixed-size windows; the last may be short.
pub fn plan_batches(segments: &[String], batch_size: usize) -> Vec<&[String]> {
    segments.chunks(batch_size.max(1)).collect()
}

/// Merges on-disk segments into output artifacts, one batch at a time.
pub struct BatchMerger {
    work_dir: PathBuf,
    batch_size: usize,
    idle_threshold: Duration,
    remuxer: Arc<dyn Remuxer>,
    /// Sources of published outputs that could not be deleted yet. They are
    /// kept out of planning and removal is retried on every pass.
    leftovers: Mutex<BTreeSet<String>>,
}

impl BatchMerger {
    pub fn new(config: &SessionConfig, remuxer: Arc<dyn Remuxer>) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            batch_size: config.batch_size.max(1),
            idle_threshold: config.merge_idle_threshold,
            remuxer,
            leftovers: Mutex::new(BTreeSet::new()),
        }
    }

    /// Scans the work directory once and merges every eligible batch.
    ///
    /// Returns the output artifacts written by this call. A failing batch is
    /// logged and left for the next scan; only a failure to list the
    /// directory is returned as an error.
    ///
    /// A window whose output already exists holds sources an earlier pass
    /// merged but never deleted (e.g. after a crash). Those are removed and
    /// the directory is planned again, so newer segments are not stuck behind
    /// them.
    pub async fn run_once(&self) -> Result<Vec<PathBuf>> {
        self.retry_leftovers().await;

        let mut merged = Vec::new();
        'scan: loop {
            let segments = self.pending_segments().await?;
            let batches = plan_batches(&segments, self.batch_size);
            let last = batches.len().saturating_sub(1);

            for (i, batch) in batches.into_iter().enumerate() {
                let output = self.work_dir.join(output_name(&batch[0]));
                if fs::try_exists(&output).await? {
                    self.settle_merged(batch, &output).await;
                    continue 'scan;
                }

                let is_tail = i == last && batch.len() < self.batch_size;
                match self.merge_batch(batch, output, is_tail).await {
                    Ok(Some(output)) => merged.push(output),
                    Ok(None) => {}
                    Err(e) => error!("Failed to merge batch starting at {}: {:#}", batch[0], e),
                }
            }
            return Ok(merged);
        }
    }

    async fn pending_segments(&self) -> Result<Vec<String>> {
        let mut segments = list_segments(&self.work_dir).await?;
        let leftovers = self.leftovers.lock();
        segments.retain(|name| !leftovers.contains(name));
        Ok(segments)
    }

    async fn retry_leftovers(&self) {
        let names: Vec<String> = self.leftovers.lock().iter().cloned().collect();
        for name in names {
            match fs::remove_file(self.work_dir.join(&name)).await {
                Ok(()) => {
                    debug!("Removed leftover segment {}", name);
                    self.leftovers.lock().remove(&name);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    self.leftovers.lock().remove(&name);
                }
                Err(e) => debug!("Leftover segment {} still not removable: {}", name, e),
            }
        }
    }

    /// Deletes the members of `batch` that were already merged into `output`.
    ///
    /// The first member named the output, so it always goes. Later members
    /// go only if they were last written no later than the output.
    async fn settle_merged(&self, batch: &[String], output: &Path) {
        let published = modified(output).await;

        for (i, name) in batch.iter().enumerate() {
            if i > 0 {
                let merged = match (modified(&self.work_dir.join(name)).await, published) {
                    (Some(written), Some(published)) => written <= published,
                    _ => false,
                };
                if !merged {
                    continue;
                }
            }
            info!("{} was already merged into {:?}, removing it", name, output);
            self.remove_source(name).await;
        }
    }

    /// Removes a merged source; a failure is remembered and retried later.
    async fn remove_source(&self, name: &str) {
        match fs::remove_file(self.work_dir.join(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to remove merged segment {}: {}", name, e);
                self.leftovers.lock().insert(name.to_string());
            }
        }
    }

    async fn merge_batch(&self, batch: &[String], output: PathBuf, is_tail: bool) -> Result<Option<PathBuf>> {
        let first = &batch[0];
        let inputs: Vec<PathBuf> = batch.iter().map(|name| self.work_dir.join(name)).collect();

        let Some(newest) = self.check_members(&inputs).await else {
            return Ok(None);
        };

        if is_tail {
            let age = newest.elapsed().unwrap_or(Duration::ZERO);
            if age < self.idle_threshold {
                debug!(
                    "Tail batch {} ({} segments) still growing, last write {:?} ago",
                    first,
                    batch.len(),
                    age
                );
                return Ok(None);
            }
        }

        let partial = with_suffix(&output, PARTIAL_SUFFIX);
        info!("Merging {} segments into {:?}", inputs.len(), output);

        if let Err(e) = self.remuxer.remux(&inputs, &partial).await {
            let _ = fs::remove_file(&partial).await;
            bail!("remux failed, keeping sources: {:#}", e);
        }
        if let Err(e) = fs::rename(&partial, &output).await {
            let _ = fs::remove_file(&partial).await;
            bail!("failed to publish {:?}: {}", output, e);
        }

        for name in batch {
            self.remove_source(name).await;
        }

        info!("Successfully merged segments into {:?}", output);
        Ok(Some(output))
    }

    /// Returns the newest modification time if every member is present and
    /// non-empty.
    async fn check_members(&self, inputs: &[PathBuf]) -> Option<SystemTime> {
        let mut newest = SystemTime::UNIX_EPOCH;
        for input in inputs {
            let meta = match fs::metadata(input).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Segment {:?} not ready: {}", input, e);
                    return None;
                }
            };
            if meta.len() == 0 {
                warn!("Segment {:?} is empty, skipping batch", input);
                return None;
            }
            if let Ok(modified) = meta.modified() {
                newest = newest.max(modified);
            }
        }
        Some(newest)
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).await.ok()?.modified().ok()
}

/// 清理分段文件及未完成的临时文件
///
/// Removes segments, in-progress downloads, partial outputs and manifests.
/// Returns how many files were removed.
pub async fn cleanup_transient(dir: &Path) -> Result<usize> {
    let mut read_dir = fs::read_dir(dir).await?;
    let mut removed = 0;
    let mut errors = Vec::new();

    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let transient = name.ends_with(".ts")
            || name.ends_with(TEMP_SUFFIX)
            || name.ends_with(PARTIAL_SUFFIX)
            || name.ends_with(MANIFEST_SUFFIX);
        if !transient {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => errors.push(format!("Failed to remove {:?}: {}", path, e)),
        }
    }

    if !errors.is_empty() {
        return Err(anyhow!("Failed to remove some files: {}", errors.join(", ")));
    }

    Ok(removed)
}
