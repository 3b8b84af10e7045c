use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::merger::list_outputs;
use crate::retry::RetryPolicy;
use crate::session::SessionConfig;
use crate::telegram::Uploader;

/// Delivery state of one output artifact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Seconds since the Unix epoch when the artifact was first observed.
    pub first_seen: f64,
    pub sent: bool,
}

/// Output artifact name -> delivery record, persisted as one JSON object.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryStore {
    records: BTreeMap<String, DeliveryRecord>,
}

impl DeliveryStore {
    /// Loads the store; a missing or unreadable file yields an empty store.
    pub async fn load(path: &Path) -> Self {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!("Failed to read delivery state {:?}: {}; starting empty", path, e);
                return Self::default();
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(store) => store,
            Err(e) => {
                warn!("Corrupt delivery state {:?}: {}; starting empty", path, e);
                Self::default()
            }
        }
    }

    /// Rewrites the whole store through a temporary sibling.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {:?}", tmp))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to replace {:?}", path))?;
        Ok(())
    }

    /// Records `name` at `now` unless already known. First-seen never moves.
    pub fn observe(&mut self, name: &str, now: f64) -> bool {
        if self.records.contains_key(name) {
            return false;
        }
        self.records.insert(
            name.to_string(),
            DeliveryRecord {
                first_seen: now,
                sent: false,
            },
        );
        true
    }

    pub fn mark_sent(&mut self, name: &str) {
        if let Some(record) = self.records.get_mut(name) {
            record.sent = true;
        }
    }

    pub fn get(&self, name: &str) -> Option<&DeliveryRecord> {
        self.records.get(name)
    }

    /// Unsent artifacts in name order.
    pub fn unsent(&self) -> Vec<(&str, &DeliveryRecord)> {
        self.records
            .iter()
            .filter(|(_, r)| !r.sent)
            .map(|(name, r)| (name.as_str(), r))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Keeps the newest unsent artifacts back until they have settled.
#[derive(Debug, Clone)]
pub struct HoldBack {
    /// How many of the newest unsent artifacts are subject to the age check.
    pub count: usize,
    pub min_age: Duration,
}

/// Picks the artifacts to send now, in name order.
///
/// Everything older than the newest `count` unsent artifacts goes out
/// immediately; the newest `count` go out only once they were first seen more
/// than `min_age` before `now`.
pub fn select_eligible(store: &DeliveryStore, policy: &HoldBack, now: f64) -> Vec<String> {
    let unsent = store.unsent();
    let split = unsent.len().saturating_sub(policy.count);
    let (base, tail) = unsent.split_at(split);
    let min_age = policy.min_age.as_secs_f64();

    base.iter()
        .map(|(name, _)| name.to_string())
        .chain(
            tail.iter()
                .filter(|(_, record)| now - record.first_seen > min_age)
                .map(|(name, _)| name.to_string()),
        )
        .collect()
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Observes output artifacts and drives eligible ones through the uploader.
pub struct DeliveryTracker {
    work_dir: PathBuf,
    state_path: PathBuf,
    policy: HoldBack,
    retry: RetryPolicy,
    uploader: Arc<dyn Uploader>,
}

impl DeliveryTracker {
    pub fn new(config: &SessionConfig, uploader: Arc<dyn Uploader>) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            state_path: config.state_path(),
            policy: HoldBack {
                count: config.hold_back_count,
                min_age: config.hold_back_age,
            },
            retry: RetryPolicy::fixed(config.upload_retry_delay),
            uploader,
        }
    }

    pub async fn run_once(&self, token: &CancellationToken) -> Result<usize> {
        self.run_at(token, unix_now()).await
    }

    /// One tracker cycle as of `now`. Returns how many artifacts were sent.
    ///
    /// Uploads block until they succeed; cancellation ends the cycle early.
    /// The store is persisted once, after the sends, so a crash mid-cycle
    /// re-sends rather than loses an artifact.
    pub async fn run_at(&self, token: &CancellationToken, now: f64) -> Result<usize> {
        let mut store = DeliveryStore::load(&self.state_path).await;

        for name in list_outputs(&self.work_dir).await? {
            if store.observe(&name, now) {
                debug!("New output artifact {}", name);
            }
        }

        let eligible = select_eligible(&store, &self.policy, now);
        let pending = store.unsent().len();
        if pending > 0 {
            debug!("{} unsent artifacts, {} eligible", pending, eligible.len());
        }

        let mut sent = 0;
        for name in eligible {
            let path = self.work_dir.join(&name);
            if !fs::try_exists(&path).await.unwrap_or(false) {
                warn!("Output artifact {:?} disappeared, not sending", path);
                continue;
            }

            let uploader = self.uploader.as_ref();
            let caption = name.as_str();
            let delivered = self
                .retry
                .run(token, |_| uploader.upload_file(&path, caption))
                .await;

            match delivered {
                Some(()) => {
                    info!("Sent {}", name);
                    store.mark_sent(&name);
                    sent += 1;
                }
                None => {
                    warn!("Upload of {} cancelled", name);
                    break;
                }
            }
        }

        store.save(&self.state_path).await?;
        Ok(sent)
    }
}
