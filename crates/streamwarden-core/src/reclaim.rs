//! Disk and log reclamation for the resource tier of the escalation ladder.
//!
//! Output segments are a liveness proxy as well as the main disk consumer on
//! a kiosk volume; trimming keeps the newest `keep` by modification time and
//! is a no-op when nothing exceeds the keep count.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::error::Result;

/// Extensions considered output artifacts (HLS segments + playlists).
const ARTIFACT_EXTENSIONS: [&str; 2] = ["ts", "m3u8"];

/// One output artifact, for /status inventory and trim ordering.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ArtifactInfo {
    pub name: String,
    pub size_bytes: u64,
    /// Modification time, epoch milliseconds.
    pub modified_ms: u64,
}

/// List output artifacts in `dir`, newest first by modification time.
///
/// A missing directory is an empty inventory, not an error.
pub fn list_artifacts(dir: &Path) -> Result<Vec<ArtifactInfo>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !is_artifact(&path) {
            continue;
        }
        let meta = entry.metadata()?;
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .and_then(|d| u64::try_from(d.as_millis()).ok())
            .unwrap_or(0);
        artifacts.push(ArtifactInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            size_bytes: meta.len(),
            modified_ms,
        });
    }
    artifacts.sort_by(|a, b| b.modified_ms.cmp(&a.modified_ms));
    Ok(artifacts)
}

fn is_artifact(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ARTIFACT_EXTENSIONS.contains(&ext))
}

/// Age of the newest artifact in `dir`, if any exists.
#[must_use]
pub fn newest_artifact_age(dir: &Path) -> Option<Duration> {
    let artifacts = list_artifacts(dir).ok()?;
    let newest = artifacts.first()?;
    let modified = std::time::UNIX_EPOCH + Duration::from_millis(newest.modified_ms);
    SystemTime::now().duration_since(modified).ok()
}

/// Delete segments beyond the newest `keep` by modification time.
///
/// Returns the number of files removed. Idempotent: a second pass with no
/// new artifacts removes nothing. Playlists are part of the inventory but
/// never trimmed; only `.ts` segments are deleted.
pub fn trim_artifacts(dir: &Path, keep: usize) -> Result<usize> {
    let segments: Vec<ArtifactInfo> = list_artifacts(dir)?
        .into_iter()
        .filter(|a| a.name.ends_with(".ts"))
        .collect();

    let mut removed = 0;
    for victim in segments.iter().skip(keep) {
        let path = dir.join(&victim.name);
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            // Already gone (engine rotated it out from under us) is fine.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove artifact");
            }
        }
    }

    if removed > 0 {
        info!(removed, keep, dir = %dir.display(), "trimmed output artifacts");
    }
    Ok(removed)
}

/// Rotate `path` to `path.1` if it exceeds `max_bytes`, replacing any
/// previous `.1`. Used during emergency disk reclamation for oversized logs.
///
/// Returns whether a rotation happened.
pub fn rotate_log(path: &Path, max_bytes: u64) -> Result<bool> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if meta.len() <= max_bytes {
        return Ok(false);
    }

    let rotated = rotated_path(path);
    fs::rename(path, &rotated)?;
    info!(
        from = %path.display(),
        to = %rotated.display(),
        size_bytes = meta.len(),
        "rotated oversized log"
    );
    Ok(true)
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".1");
    PathBuf::from(name)
}
