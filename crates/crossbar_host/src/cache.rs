use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use crossbar_protocol::{RenderModel, Status};
use crossbar_shared_util::PluginId;
use serde::{Deserialize, Serialize};

use crate::{
    config::PartialOutputPolicy,
    sandbox::ExecutionResult,
    util::{format_duration_short, truncate_chars},
};

const MAX_FAILURE_MESSAGE_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Spawn,
    Timeout,
    ExitCode,
    Parse,
}

/// Why the latest run of a plugin did not produce a usable result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[display("{kind}: {message}")]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        FailureReason { kind, message: truncate_chars(&message.into(), MAX_FAILURE_MESSAGE_CHARS) }
    }

    /// Classify a finished run. Returns `None` for a successful run.
    pub fn from_execution(result: &ExecutionResult) -> Option<Self> {
        if result.timed_out {
            Some(FailureReason::new(FailureKind::Timeout, format!("Timed out after {}", format_duration_short(result.duration))))
        } else if result.spawn_failed() {
            let message = result.stderr_summary().unwrap_or_else(|| "Failed to start".to_string());
            Some(FailureReason::new(FailureKind::Spawn, message))
        } else if result.exit_code != 0 {
            let message = match result.stderr_summary() {
                Some(stderr) => format!("Exited with code {}: {}", result.exit_code, stderr),
                None => format!("Exited with code {}", result.exit_code),
            };
            Some(FailureReason::new(FailureKind::ExitCode, message))
        } else {
            None
        }
    }

    /// Short text shown in place of a title when a plugin never produced a good result.
    pub fn placeholder(&self) -> &'static str {
        match self.kind {
            FailureKind::Timeout => "Timed out",
            FailureKind::Parse => "Parse Error",
            FailureKind::Spawn | FailureKind::ExitCode => "Failed",
        }
    }
}

/// Result of feeding one [`ExecutionResult`] into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunOutcome {
    Success,
    /// The run failed, but its output was kept.
    Degraded,
    Failed,
}

/// What is known about a plugin: its last good output and how its latest runs went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The last good output. `None` until the plugin succeeded once.
    pub model: Option<RenderModel>,
    pub status: Status,
    pub interval: Duration,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub failure: Option<FailureReason>,
    pub consecutive_failures: u32,
}

impl CacheEntry {
    fn new(interval: Duration) -> Self {
        CacheEntry {
            model: None,
            status: Status::Fresh,
            interval,
            last_success: None,
            last_attempt: None,
            failure: None,
            consecutive_failures: 0,
        }
    }

    /// Whether the plugin has not finished a single run yet.
    pub fn is_pending(&self) -> bool {
        self.last_attempt.is_none()
    }

    /// The status as seen at `now`. A good result that has not been renewed for more than two intervals
    /// is stale. This happens while a run hangs or its ticks keep getting dropped.
    fn aged(mut self, now: DateTime<Utc>) -> Self {
        if self.status != Status::Fresh {
            return self;
        }
        let outdated = self
            .last_success
            .and_then(|last_success| (now - last_success).to_std().ok())
            .is_some_and(|age| age > self.interval * 2);
        if outdated {
            self.status = Status::Stale;
            if let Some(model) = self.model.as_mut() {
                model.status = Status::Stale;
            }
        }
        self
    }
}

/// The entries of a cache at one point in time, in display order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub entries: Vec<(PluginId, CacheEntry)>,
}

impl CacheSnapshot {
    pub fn get(&self, id: &PluginId) -> Option<&CacheEntry> {
        self.entries.iter().find(|(entry_id, _)| entry_id == id).map(|(_, entry)| entry)
    }
}

/// Last known result of every plugin.
///
/// Cloning gives another handle to the same cache. Any number of readers can access it at once.
#[derive(Debug, Clone, Default)]
pub struct ResultCache {
    entries: Arc<RwLock<HashMap<PluginId, CacheEntry>>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the cache aware of a plugin before its first run. Existing entries are kept.
    pub fn register(&self, id: &PluginId, interval: Duration) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.entry(id.clone()).or_insert_with(|| CacheEntry::new(interval)).interval = interval;
    }

    pub fn get(&self, id: &PluginId) -> Option<CacheEntry> {
        self.get_at(id, Utc::now())
    }

    fn get_at(&self, id: &PluginId, now: DateTime<Utc>) -> Option<CacheEntry> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).get(id).map(|entry| entry.clone().aged(now))
    }

    pub fn contains(&self, id: &PluginId) -> bool {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).contains_key(id)
    }

    /// Store a good result.
    pub fn put(&self, id: &PluginId, model: RenderModel) {
        self.update(id, |entry| {
            let now = Utc::now();
            entry.model = Some(RenderModel { status: Status::Fresh, ..model });
            entry.status = Status::Fresh;
            entry.last_success = Some(now);
            entry.last_attempt = Some(now);
            entry.failure = None;
            entry.consecutive_failures = 0;
        });
    }

    /// Store output of a failed run that is still worth showing, while remembering the failure.
    pub fn put_degraded(&self, id: &PluginId, model: RenderModel, reason: FailureReason) {
        self.update(id, |entry| {
            let now = Utc::now();
            entry.model = Some(RenderModel { status: Status::Fresh, ..model });
            entry.status = Status::Fresh;
            entry.last_success = Some(now);
            entry.last_attempt = Some(now);
            entry.failure = Some(reason);
            entry.consecutive_failures += 1;
        });
    }

    /// Record a failed run. The last good output stays in place.
    pub fn mark_failed(&self, id: &PluginId, reason: FailureReason) {
        self.mark_failed_at(id, reason, Utc::now());
    }

    pub fn mark_failed_at(&self, id: &PluginId, reason: FailureReason, now: DateTime<Utc>) {
        log::debug!("Plugin {} failed: {}", id, reason);
        self.update(id, |entry| {
            entry.status = Status::Failed;
            if let Some(model) = entry.model.as_mut() {
                model.status = Status::Failed;
            }
            entry.last_attempt = Some(now);
            entry.failure = Some(reason);
            entry.consecutive_failures += 1;
        });
    }

    /// Parse the output of a finished run and store the result according to the partial output policy.
    pub fn record(&self, result: &ExecutionResult, policy: PartialOutputPolicy) -> RunOutcome {
        let id = &result.plugin;
        match FailureReason::from_execution(result) {
            None => match crossbar_protocol::parse(&result.stdout) {
                Ok(model) => {
                    self.put(id, model);
                    RunOutcome::Success
                }
                Err(err) => {
                    self.mark_failed(id, FailureReason::new(FailureKind::Parse, err.to_string()));
                    RunOutcome::Failed
                }
            },
            Some(reason) if reason.kind == FailureKind::ExitCode && policy == PartialOutputPolicy::Keep => {
                match crossbar_protocol::parse(&result.stdout) {
                    Ok(model) if !result.stdout.is_empty() => {
                        self.put_degraded(id, model, reason);
                        RunOutcome::Degraded
                    }
                    _ => {
                        self.mark_failed(id, reason);
                        RunOutcome::Failed
                    }
                }
            }
            Some(reason) => {
                self.mark_failed(id, reason);
                RunOutcome::Failed
            }
        }
    }

    /// Copy the entries of the given plugins, in the given order. Unknown plugins are left out.
    pub fn snapshot(&self, order: &[PluginId]) -> CacheSnapshot {
        self.snapshot_at(order, Utc::now())
    }

    fn snapshot_at(&self, order: &[PluginId], now: DateTime<Utc>) -> CacheSnapshot {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        CacheSnapshot {
            entries: order.iter().filter_map(|id| Some((id.clone(), entries.get(id)?.clone().aged(now)))).collect(),
        }
    }

    /// Forget about all plugins that are not in `ids`.
    pub fn retain(&self, ids: &[PluginId]) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).retain(|id, _| ids.contains(id));
    }

    fn update(&self, id: &PluginId, f: impl FnOnce(&mut CacheEntry)) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(id.clone()).or_insert_with(|| CacheEntry::new(crossbar_protocol::filename::DEFAULT_INTERVAL));
        f(entry);
    }
}
