use crate::encode::{AudioEncoder, EncodeError, EncodePlan};
use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use regex::Regex;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    sync::OnceLock,
};
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

const COVER_CANDIDATES: [&str; 4] = ["cover.jpg", "cover.png", "folder.jpg", "folder.png"];
const THUMB_MAX_BYTES: u64 = 200 * 1024;
const STDERR_TAIL_CHARS: usize = 1000;

#[derive(Clone, Debug)]
pub struct FfmpegTools {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTools {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg
    }

    pub async fn is_available(&self) -> bool {
        Command::new(&self.ffmpeg)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Scales a cover image into a JPEG thumbnail small enough for an audio upload.
    #[instrument(skip(self))]
    pub async fn make_thumbnail(&self, cover: &Path, temp_dir: &Path) -> Result<PathBuf, EncodeError> {
        let out = temp_file_path(temp_dir, "jpg");
        let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), cover.into()];
        args.extend(
            [
                "-vf",
                "scale=320:320:force_original_aspect_ratio=decrease",
                "-frames:v",
                "1",
                "-q:v",
                "5",
            ]
            .map(OsString::from),
        );
        args.push(out.clone().into());
        if let Err(err) = run_tool(&self.ffmpeg, &args).await {
            let _ = tokio::fs::remove_file(&out).await;
            return Err(err);
        }
        let size = tokio::fs::metadata(&out).await?.len();
        if size > THUMB_MAX_BYTES {
            let _ = tokio::fs::remove_file(&out).await;
            return Err(EncodeError::ToolFailed {
                tool: "thumbnail".into(),
                status: "too large".into(),
                stderr: format!("{size} bytes"),
            });
        }
        Ok(out)
    }

    /// Converts an ALAC track to FLAC next to it, attaching `cover` when given,
    /// and removes the source once the conversion succeeded.
    #[instrument(skip(self))]
    pub async fn convert_to_flac(&self, src: &Path, cover: Option<PathBuf>) -> Result<PathBuf, EncodeError> {
        let out = src.with_extension("flac");
        let plan = EncodePlan::full_fidelity(cover);
        if let Err(err) = self.encode_flac(src, &out, &plan).await {
            let _ = tokio::fs::remove_file(&out).await;
            return Err(err);
        }
        if let Err(err) = tokio::fs::remove_file(src).await {
            warn!(event = "convert_source_not_removed", error = %err);
        }
        info!(event = "converted_to_flac", out = %out.display());
        Ok(out)
    }

    async fn probe_duration(&self, src: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(src)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|secs| *secs > 0.0)
    }
}

#[async_trait]
impl AudioEncoder for FfmpegTools {
    #[instrument(skip(self, plan))]
    async fn encode_flac(&self, src: &Path, out: &Path, plan: &EncodePlan) -> Result<(), EncodeError> {
        info!(
            event = "ffmpeg_encode_start",
            sample_rate = ?plan.sample_rate,
            channels = ?plan.channels,
            force_16bit = plan.force_16bit
        );
        let args = flac_args(src, out, plan);
        run_tool(&self.ffmpeg, &args).await
    }

    #[instrument(skip(self))]
    async fn duration_seconds(&self, src: &Path) -> Result<f64, EncodeError> {
        if let Some(secs) = self.probe_duration(src).await {
            return Ok(secs);
        }
        debug!(event = "ffprobe_unavailable_fallback");
        // ffmpeg exits non-zero without an output file; the banner still has the duration.
        let output = Command::new(&self.ffmpeg)
            .arg("-i")
            .arg(src)
            .output()
            .await
            .map_err(|e| spawn_error(&self.ffmpeg, e))?;
        let banner = String::from_utf8_lossy(&output.stderr);
        parse_banner_duration(&banner).ok_or_else(|| EncodeError::InvalidDuration(src.display().to_string()))
    }
}

pub fn flac_args(src: &Path, out: &Path, plan: &EncodePlan) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), src.into()];
    match &plan.cover {
        Some(cover) => {
            args.push(OsString::from("-i"));
            args.push(OsString::from(cover));
            args.extend(["-map", "0:a", "-map", "1:v", "-c:v", "mjpeg", "-disposition:v", "attached_pic"].map(OsString::from));
        }
        None => args.extend(["-map", "0:a", "-map", "0:v?"].map(OsString::from)),
    }
    args.extend(["-c:a", "flac", "-compression_level", "12"].map(OsString::from));
    if plan.force_16bit {
        args.extend(["-sample_fmt", "s16"].map(OsString::from));
    }
    if let Some(rate) = plan.sample_rate {
        args.push(OsString::from("-ar"));
        args.push(OsString::from(rate.to_string()));
    }
    if let Some(channels) = plan.channels {
        args.push(OsString::from("-ac"));
        args.push(OsString::from(channels.to_string()));
    }
    args.push(out.into());
    args
}

fn parse_banner_duration(banner: &str) -> Option<f64> {
    static DURATION: OnceLock<Regex> = OnceLock::new();
    let re = DURATION.get_or_init(|| {
        Regex::new(r"Duration:\s+(\d+):(\d+):(\d+(?:\.\d+)?)").expect("duration pattern is valid")
    });
    let caps = re.captures(banner)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

async fn run_tool(tool: &Path, args: &[OsString]) -> Result<(), EncodeError> {
    let output = Command::new(tool)
        .args(args)
        .stdout(Stdio::null())
        .output()
        .await
        .map_err(|e| spawn_error(tool, e))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = tail(stderr.trim(), STDERR_TAIL_CHARS);
    error!(event = "tool_failed", tool = %tool.display(), status = %output.status);
    Err(EncodeError::ToolFailed {
        tool: tool.display().to_string(),
        status: output.status.to_string(),
        stderr,
    })
}

fn spawn_error(tool: &Path, err: std::io::Error) -> EncodeError {
    if err.kind() == std::io::ErrorKind::NotFound {
        warn!(event = "tool_missing", tool = %tool.display());
        EncodeError::ToolMissing(tool.display().to_string())
    } else {
        EncodeError::Io(err)
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// First cover image found next to a produced track.
pub fn find_cover_file(dir: &Path) -> Option<PathBuf> {
    COVER_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

pub fn temp_file_path(dir: &Path, ext: &str) -> PathBuf {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    dir.join(format!("amtg-{suffix}.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn resample_plan_maps_to_flags() {
        let plan = EncodePlan {
            sample_rate: Some(22050),
            channels: Some(1),
            force_16bit: true,
            cover: None,
        };
        let args = strings(&flac_args(Path::new("in.flac"), Path::new("out.flac"), &plan));
        assert_eq!(
            args,
            vec![
                "-y", "-i", "in.flac", "-map", "0:a", "-map", "0:v?", "-c:a", "flac", "-compression_level", "12",
                "-sample_fmt", "s16", "-ar", "22050", "-ac", "1", "out.flac",
            ]
        );
    }

    #[test]
    fn cover_is_attached_as_picture() {
        let plan = EncodePlan::full_fidelity(Some(PathBuf::from("cover.jpg")));
        let args = strings(&flac_args(Path::new("in.m4a"), Path::new("out.flac"), &plan));
        assert!(args.windows(2).any(|w| w == ["-i", "cover.jpg"]));
        assert!(args.windows(2).any(|w| w == ["-disposition:v", "attached_pic"]));
        assert!(!args.contains(&"-ar".to_string()));
    }

    #[test]
    fn banner_duration_is_parsed() {
        let banner = "Input #0, flac, from 'x.flac':\n  Duration: 00:03:25.50, start: 0.000000, bitrate: 1011 kb/s";
        assert_eq!(parse_banner_duration(banner), Some(205.5));
        assert_eq!(parse_banner_duration("no duration here"), None);
    }

    #[test]
    fn cover_lookup_prefers_cover_jpg() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_cover_file(dir.path()), None);
        std::fs::write(dir.path().join("folder.png"), b"png").unwrap();
        std::fs::write(dir.path().join("cover.jpg"), b"jpg").unwrap();
        assert_eq!(find_cover_file(dir.path()), Some(dir.path().join("cover.jpg")));
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }
}
