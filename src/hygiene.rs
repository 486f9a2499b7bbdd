use crate::error::AppError;
use std::{
    path::{Component, Path, PathBuf},
    time::SystemTime,
};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

#[derive(Debug)]
struct StoredFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

#[derive(Debug, Default, PartialEq)]
pub struct HygieneReport {
    pub total_before: u64,
    pub total_after: u64,
    pub removed: usize,
}

/// Deletes the oldest-modified files under `root` until it holds at most
/// `max_bytes`. `exclude` is never counted or removed.
#[instrument(skip(exclude))]
pub fn enforce_quota(root: &Path, max_bytes: u64, exclude: Option<&Path>) -> Result<HygieneReport, AppError> {
    if is_unsafe_root(root) {
        warn!(event = "hygiene_unsafe_root", root = %root.display());
        return Err(AppError::Config(format!("refusing to clean {}", root.display())));
    }
    if !root.is_dir() {
        return Ok(HygieneReport::default());
    }
    let exclude = exclude.map(|path| path.canonicalize().unwrap_or_else(|_| path.to_path_buf()));

    let mut files = Vec::new();
    let mut total: u64 = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(event = "hygiene_walk_error", error = %err);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(exclude) = &exclude {
            let path = entry.path().canonicalize().unwrap_or_else(|_| entry.path().to_path_buf());
            if &path == exclude {
                continue;
            }
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        total += metadata.len();
        files.push(StoredFile {
            path: entry.into_path(),
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    let mut report = HygieneReport {
        total_before: total,
        total_after: total,
        removed: 0,
    };
    if total <= max_bytes {
        return Ok(report);
    }

    files.sort_by_key(|file| file.modified);
    for file in files {
        if report.total_after <= max_bytes {
            break;
        }
        match std::fs::remove_file(&file.path) {
            Ok(()) => {
                report.total_after -= file.size;
                report.removed += 1;
            }
            Err(err) => debug!(event = "hygiene_remove_failed", path = %file.path.display(), error = %err),
        }
    }
    info!(
        event = "hygiene_evicted",
        removed = report.removed,
        total_before = report.total_before,
        total_after = report.total_after,
        max_bytes
    );
    Ok(report)
}

/// True when `root` names, or resolves to, the working directory itself or a
/// filesystem root.
fn is_unsafe_root(root: &Path) -> bool {
    let cleaned = lexical_clean(root);
    if cleaned.parent().is_none() {
        return true;
    }
    match root.canonicalize() {
        Ok(resolved) => resolved.parent().is_none(),
        Err(_) => false,
    }
}

/// Drops `.` and collapses `name/..` pairs without touching the filesystem.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}
