//! Log discovery - locating the live log file for a character
//!
//! EVE writes one file per session and category, named
//! `<prefix><YYYYMMDD>_<HHMMSS>_<character id>.txt`. The live file is the most
//! recently modified one.

use crate::error::{Error, Result};
use crate::{Character, EntityId, LogCategory};
use chrono::NaiveDateTime;
use regex::Regex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;
use tracing::{debug, info, warn};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

static GAMELOG_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{8}_\d{6})_(\d+)\.txt$").expect("gamelog name regex"));

/// Most recently modified file in `dir` (non-recursive) matching `category`'s
/// pattern for `entity`.
///
/// Returns `None` if the directory cannot be read or nothing matches. Equal
/// modification times are broken by the lexicographically greatest file name,
/// which for EVE logs is the newest timestamp token.
pub fn find_latest_log(dir: &Path, entity: EntityId, category: LogCategory) -> Option<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %dir.display(), "log directory does not exist yet");
            return None;
        }
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "failed to read log directory");
            return None;
        }
    };

    let pattern = category.file_pattern(entity);
    let mut best: Option<(SystemTime, String, PathBuf)> = None;

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }

        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !pattern.is_match(name) {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };

        match &best {
            Some((best_time, best_name, _))
                if (modified, name) <= (*best_time, best_name.as_str()) => {}
            _ => best = Some((modified, name.to_string(), entry.path())),
        }
    }

    best.map(|(_, _, path)| path)
}

/// Characters that have gamelogs under `log_root`, most recently seen first.
pub fn list_characters(log_root: Option<&Path>) -> Result<Vec<Character>> {
    let log_root = log_root.ok_or(Error::LogPathNotConfigured)?;
    let dir = log_root.join(LogCategory::Gamelog.dir_name());
    info!(path = %dir.display(), "scanning for characters");

    let entries = std::fs::read_dir(&dir).map_err(|source| Error::ReadDir {
        path: dir.clone(),
        source,
    })?;

    let mut latest: HashMap<EntityId, NaiveDateTime> = HashMap::new();
    for entry in entries.flatten() {
        if !entry.file_type().is_ok_and(|t| t.is_file()) {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(caps) = GAMELOG_NAME.captures(name) else {
            continue;
        };

        let Ok(id) = caps[2].parse::<EntityId>() else {
            continue;
        };
        let seen = match NaiveDateTime::parse_from_str(&caps[1], TIMESTAMP_FORMAT) {
            Ok(t) => t,
            Err(e) => {
                warn!(file = name, error = %e, "could not parse timestamp from log file name");
                continue;
            }
        };

        latest
            .entry(id)
            .and_modify(|t| *t = (*t).max(seen))
            .or_insert(seen);
    }

    let mut characters: Vec<Character> = latest
        .into_iter()
        .map(|(id, last_seen)| Character { id, last_seen })
        .collect();
    characters.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.id.cmp(&b.id)));

    info!("found {} unique characters", characters.len());
    Ok(characters)
}
