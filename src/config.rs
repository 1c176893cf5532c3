//! Configuration file and the log-root provider
//!
//! - **Config** (`config.json`): EVE log path, subscribed characters with their
//!   rules, and optional timing overrides. Saved to the platform config
//!   directory (`~/.config/eve-notify/` on Linux,
//!   `~/Library/Application Support/eve-notify/` on macOS).
//!
//! The daemon watches the file and applies changes to the running registry, so
//! `eve-notify subscribe` takes effect without a restart.

use crate::error::{Error, Result};
use crate::monitor::MonitorTiming;
use crate::registry::SubscriptionRegistry;
use crate::{EntityId, NotificationRuleSet};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// EVE log root (the directory containing `Gamelogs/` and `Chatlogs/`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// Subscribed characters and their notification rules.
    #[serde(default)]
    pub characters: BTreeMap<EntityId, NotificationRuleSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

impl Config {
    /// Monitor timing with the overrides from this config applied.
    pub fn timing(&self) -> MonitorTiming {
        let defaults = MonitorTiming::default();
        MonitorTiming {
            discovery_interval: self
                .discovery_interval_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.discovery_interval),
            poll_interval: self
                .poll_interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        }
    }
}

// ---------------------------------------------------------------------------
// Directory helpers
// ---------------------------------------------------------------------------

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("eve-notify"))
}

/// Default location of `config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.json"))
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load config from `path`. A missing file yields the defaults; an unreadable
/// or invalid file is an error.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&contents).map_err(|source| Error::Config {
        path: path.to_path_buf(),
        source,
    })
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    atomic_write(path, json.as_bytes())?;
    Ok(())
}

/// Write bytes to a file atomically: write to a temp file in the same
/// directory, then rename over the target. Prevents partial JSON on crash.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Log root provider
// ---------------------------------------------------------------------------

/// Source of the EVE log root, consulted on every discovery cycle.
pub trait LogRootProvider: Send + Sync {
    /// `None` means "not configured yet".
    fn log_root(&self) -> Option<PathBuf>;
}

/// Log root that can be replaced at runtime (config reload, CLI override).
#[derive(Debug, Clone, Default)]
pub struct SharedLogRoot {
    inner: Arc<RwLock<Option<PathBuf>>>,
}

impl SharedLogRoot {
    pub fn new(path: Option<PathBuf>) -> Self {
        let root = Self::default();
        root.set(path);
        root
    }

    /// Replace the log root. Empty paths count as unset.
    pub fn set(&self, path: Option<PathBuf>) {
        let path = path.filter(|p| !p.as_os_str().is_empty());
        let mut current = self.inner.write();
        if *current != path {
            info!(path = ?path, "EVE log path set");
            *current = path;
        }
    }
}

impl LogRootProvider for SharedLogRoot {
    fn log_root(&self) -> Option<PathBuf> {
        self.inner.read().clone()
    }
}

// ---------------------------------------------------------------------------
// Applying config to the running daemon
// ---------------------------------------------------------------------------

/// Bring the registry in line with `config.characters`: subscribe new
/// characters, update existing ones and unsubscribe removed ones.
pub fn apply_config(config: &Config, registry: &SubscriptionRegistry) -> Result<()> {
    for id in registry.subscribed_ids() {
        if !config.characters.contains_key(&id) {
            registry.unsubscribe(id)?;
        }
    }

    for (id, rules) in &config.characters {
        if !registry.update_settings(*id, *rules) {
            registry.subscribe(*id, *rules)?;
        }
    }
    Ok(())
}

/// Watch `path` and send each successfully re-parsed config to `tx`.
///
/// Watches the parent directory so editor-style saves (write new + rename) and
/// our own atomic writes are seen. Runs until `shutdown` is cancelled or the
/// receiver is dropped.
pub async fn watch_config(
    path: PathBuf,
    tx: mpsc::Sender<Config>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let _ = watch_tx.blocking_send(event);
            }
            Err(e) => debug!(error = %e, "config watcher error"),
        },
        notify::Config::default(),
    )?;

    let watch_dir = path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"))?;
    std::fs::create_dir_all(&watch_dir)?;
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "watching config file");

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = watch_rx.recv() => match event {
                Some(e) => e,
                None => break,
            },
        };

        let affects_config = event.paths.iter().any(|p| p.file_name() == path.file_name());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );
        if !affects_config || !is_write {
            continue;
        }

        match load_config_from(&path) {
            Ok(config) => {
                debug!("config reloaded");
                if tx.send(config).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "failed to reload config; keeping previous"),
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
