use crate::{error::AppError, progress::ProgressReporter, session::Variant};
use async_trait::async_trait;
use serde::Deserialize;
use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, error, info, instrument, trace, Instrument};

/// What the fetch pipeline should produce.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FetchTarget {
    Song(String),
    Album(String),
}

impl FetchTarget {
    pub fn id(&self) -> &str {
        match self {
            Self::Song(id) | Self::Album(id) => id,
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, Self::Song(_))
    }

    fn flag(&self) -> &'static str {
        match self {
            Self::Song(_) => "--song",
            Self::Album(_) => "--album",
        }
    }
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Song(id) => write!(f, "song {id}"),
            Self::Album(id) => write!(f, "album {id}"),
        }
    }
}

/// Title and performer shown in the listing a song was picked from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrackHint {
    pub title: String,
    pub performer: String,
}

/// Everything one download needs. Built fresh for every job.
#[derive(Clone, Debug)]
pub struct FetchJob {
    pub target: FetchTarget,
    pub variant: Variant,
    pub output_dir: PathBuf,
    pub hint: Option<TrackHint>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct FetchedTrack {
    pub path: PathBuf,
    #[serde(default)]
    pub track_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub performer: String,
    #[serde(default)]
    pub duration_millis: u64,
}

impl FetchedTrack {
    /// Listing metadata wins over what the pipeline recorded.
    pub fn apply_hint(&mut self, hint: Option<&TrackHint>) {
        let Some(hint) = hint else {
            return;
        };
        if !hint.title.is_empty() {
            self.title = hint.title.clone();
        }
        if !hint.performer.is_empty() {
            self.performer = hint.performer.clone();
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, job: &FetchJob, progress: &ProgressReporter) -> Result<Vec<FetchedTrack>, AppError>;
}

/// Runs the external fetch pipeline executable.
pub struct ExternalFetcher {
    command: PathBuf,
}

impl ExternalFetcher {
    pub fn new(command: PathBuf) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Fetcher for ExternalFetcher {
    #[instrument(skip(self, progress), fields(target = %job.target))]
    async fn fetch(&self, job: &FetchJob, progress: &ProgressReporter) -> Result<Vec<FetchedTrack>, AppError> {
        info!(event = "fetch_start", command = %self.command.display());
        tokio::fs::create_dir_all(&job.output_dir).await?;
        let mut child = Command::new(&self.command)
            .arg(job.target.flag())
            .arg(job.target.id())
            .arg("--output-dir")
            .arg(&job.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(event = "fetch_spawn_failed", error = %e);
                AppError::Fetch(format!("cannot start {}: {e}", self.command.display()))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::MissingOutput("stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::MissingOutput("stderr".into()))?;

        let reporter = progress.clone();
        let stderr_task = tokio::spawn(
            async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    match parse_progress_line(&line) {
                        Some(update) => reporter.update(&update.phase, update.done, update.total),
                        None => trace!(event = "fetch_stderr_line", line = line.as_str()),
                    }
                }
            }
            .in_current_span(),
        );

        let mut tracks = Vec::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Some(line) = reader.next_line().await? {
            if let Some(track) = parse_track_line(&line, &job.output_dir) {
                debug!(event = "fetch_track_produced", path = %track.path.display());
                tracks.push(track);
            }
        }

        let status = child.wait().await?;
        let _ = stderr_task.await;
        if !status.success() {
            error!(event = "fetch_failed_status", status = %status);
            return Err(AppError::FetchFailed(status));
        }
        info!(event = "fetch_complete", files = tracks.len());
        Ok(tracks)
    }
}

#[derive(Debug, PartialEq)]
pub struct ProgressUpdate {
    pub phase: String,
    pub done: u64,
    pub total: u64,
}

/// Parses `PROGRESS <phase> <done> <total>`. The phase may contain spaces.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let rest = line.trim().strip_prefix("PROGRESS ")?;
    let mut fields = rest.rsplitn(3, ' ');
    let total = fields.next()?.parse().ok()?;
    let done = fields.next()?.parse().ok()?;
    let phase = fields.next()?.trim();
    if phase.is_empty() {
        return None;
    }
    Some(ProgressUpdate {
        phase: phase.to_string(),
        done,
        total,
    })
}

fn parse_track_line(line: &str, output_dir: &Path) -> Option<FetchedTrack> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let mut track: FetchedTrack = match serde_json::from_str(line) {
        Ok(track) => track,
        Err(err) => {
            debug!(event = "fetch_stdout_unparsed", error = %err);
            return None;
        }
    };
    if track.path.as_os_str().is_empty() {
        return None;
    }
    if track.path.is_relative() {
        track.path = output_dir.join(&track.path);
    }
    Some(track)
}
