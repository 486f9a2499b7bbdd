//! Size-constrained FLAC re-encoding.
//!
//! A first pass encodes at full fidelity. If that does not fit the byte budget,
//! a single second pass resamples to the largest ladder rate whose 16-bit PCM
//! rate stays under the budget's bit rate, downmixing to mono when stereo
//! would force the rate below [`STEREO_FLOOR_HZ`]. There is no third pass.

use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{info, instrument, warn};

pub const SAMPLE_RATE_LADDER: [u32; 9] = [48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000];
const STEREO_FLOOR_HZ: f64 = 12000.0;
const BITS_PER_SAMPLE: f64 = 16.0;
const BUDGET_HEADROOM: f64 = 0.95;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("{0} not found")]
    ToolMissing(String),

    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("invalid duration for {0}")]
    InvalidDuration(String),

    #[error("cannot compress below {}MB", .max_bytes / 1024 / 1024)]
    BudgetUnsatisfiable { max_bytes: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for one FLAC encode. `None` keeps the source value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EncodePlan {
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub force_16bit: bool,
    pub cover: Option<PathBuf>,
}

impl EncodePlan {
    pub fn full_fidelity(cover: Option<PathBuf>) -> Self {
        Self {
            cover,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait AudioEncoder: Send + Sync {
    async fn encode_flac(&self, src: &Path, out: &Path, plan: &EncodePlan) -> Result<(), EncodeError>;

    async fn duration_seconds(&self, src: &Path) -> Result<f64, EncodeError>;
}

#[derive(Debug)]
pub struct Shrunk {
    pub path: PathBuf,
    pub plan: EncodePlan,
    pub size_bytes: u64,
}

/// Removes the file on drop unless [`TempOutput::keep`] was called.
struct TempOutput {
    path: PathBuf,
    keep: bool,
}

impl TempOutput {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for TempOutput {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[derive(Clone)]
pub struct Reencoder {
    encoder: Arc<dyn AudioEncoder>,
    temp_dir: PathBuf,
}

impl Reencoder {
    pub fn new(encoder: Arc<dyn AudioEncoder>, temp_dir: PathBuf) -> Self {
        Self { encoder, temp_dir }
    }

    pub fn encoder(&self) -> &Arc<dyn AudioEncoder> {
        &self.encoder
    }

    /// Re-encodes `src` into a temporary FLAC no larger than `max_bytes`.
    /// The caller owns (and must remove) the returned file.
    #[instrument(skip(self, cover))]
    pub async fn shrink_to_fit(&self, src: &Path, max_bytes: u64, cover: Option<PathBuf>) -> Result<Shrunk, EncodeError> {
        let out = TempOutput::new(crate::ffmpeg::temp_file_path(&self.temp_dir, "flac"));

        let plan = EncodePlan::full_fidelity(cover.clone());
        self.encoder.encode_flac(src, &out.path, &plan).await?;
        let size_bytes = tokio::fs::metadata(&out.path).await?.len();
        if size_bytes <= max_bytes {
            info!(event = "shrink_first_pass_fits", size_bytes, max_bytes);
            return Ok(Shrunk {
                path: out.keep(),
                plan,
                size_bytes,
            });
        }

        let duration = self.encoder.duration_seconds(src).await?;
        if duration.is_nan() || duration <= 0.0 {
            return Err(EncodeError::InvalidDuration(display_name(src)));
        }
        let target_bps = target_bits_per_second(max_bytes, duration);
        let (sample_rate, channels) = choose_resample_plan(target_bps);
        let plan = EncodePlan {
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            force_16bit: true,
            cover,
        };
        info!(
            event = "shrink_second_pass",
            first_pass_bytes = size_bytes,
            target_bps,
            sample_rate,
            channels
        );
        self.encoder.encode_flac(src, &out.path, &plan).await?;
        let size_bytes = tokio::fs::metadata(&out.path).await?.len();
        if size_bytes > max_bytes {
            warn!(event = "shrink_budget_unsatisfiable", size_bytes, max_bytes);
            return Err(EncodeError::BudgetUnsatisfiable { max_bytes });
        }
        Ok(Shrunk {
            path: out.keep(),
            plan,
            size_bytes,
        })
    }
}

pub fn target_bits_per_second(max_bytes: u64, duration_seconds: f64) -> f64 {
    BUDGET_HEADROOM * (max_bytes as f64 * 8.0) / duration_seconds
}

/// Returns `(sample_rate, channels)` for a target bit rate.
pub fn choose_resample_plan(target_bps: f64) -> (u32, u8) {
    let mut channels: u8 = 2;
    let mut per_channel_rate = target_bps / (BITS_PER_SAMPLE * f64::from(channels));
    if per_channel_rate < STEREO_FLOOR_HZ {
        channels = 1;
        per_channel_rate = target_bps / (BITS_PER_SAMPLE * f64::from(channels));
    }
    (pick_sample_rate(per_channel_rate), channels)
}

/// Largest ladder rate not above `target`, or the ladder floor.
pub fn pick_sample_rate(target: f64) -> u32 {
    SAMPLE_RATE_LADDER
        .iter()
        .copied()
        .find(|&rate| f64::from(rate) <= target)
        .unwrap_or(SAMPLE_RATE_LADDER[SAMPLE_RATE_LADDER.len() - 1])
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
