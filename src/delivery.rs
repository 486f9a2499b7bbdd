use crate::{
    cache::{calc_bitrate_kbps, ArtifactCache, CachedArtifact},
    catalog::TrackLookup,
    encode::{AudioEncoder, Reencoder},
    error::AppError,
    ffmpeg::{find_cover_file, FfmpegTools},
    fetch::FetchedTrack,
    progress::ProgressReporter,
    session::Variant,
};
use async_trait::async_trait;
use rand::Rng;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use teloxide::{
    prelude::*,
    types::{InputFile, MessageId},
    RequestError,
};
use tokio::time;
use tracing::{info, instrument, warn};

const UPLOAD_MAX_RETRIES: usize = 3;
const UPLOAD_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const UPLOAD_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
const SOURCE_TAG: &str = "AppleMusic";

/// One audio file upload.
#[derive(Clone, Debug)]
pub struct AudioUpload {
    pub chat_id: ChatId,
    pub reply_to: Option<MessageId>,
    pub path: PathBuf,
    pub file_name: String,
    pub caption: String,
    pub duration_secs: u32,
    pub title: String,
    pub performer: String,
    pub thumb: Option<PathBuf>,
}

/// The handle Telegram assigned to an uploaded file.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadedAudio {
    pub file_id: String,
    pub file_size: u64,
}

#[async_trait]
pub trait AudioSender: Send + Sync {
    /// Uploads a local file. `None` when the response carried no audio.
    async fn upload(&self, upload: &AudioUpload) -> Result<Option<UploadedAudio>, AppError>;

    /// Sends a previously uploaded file by handle.
    async fn resend(
        &self,
        chat_id: ChatId,
        reply_to: Option<MessageId>,
        entry: &CachedArtifact,
        caption: String,
    ) -> Result<(), RequestError>;
}

pub struct BotSender {
    bot: Bot,
}

impl BotSender {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl AudioSender for BotSender {
    async fn upload(&self, upload: &AudioUpload) -> Result<Option<UploadedAudio>, AppError> {
        let message = send_audio_with_retry(|| {
            let file = InputFile::file(upload.path.clone()).file_name(upload.file_name.clone());
            let mut request = self
                .bot
                .send_audio(upload.chat_id, file)
                .caption(upload.caption.clone());
            if upload.duration_secs > 0 {
                request = request.duration(upload.duration_secs);
            }
            if !upload.title.is_empty() {
                request = request.title(upload.title.clone());
            }
            if !upload.performer.is_empty() {
                request = request.performer(upload.performer.clone());
            }
            if let Some(thumb) = &upload.thumb {
                request = request.thumb(InputFile::file(thumb.clone()));
            }
            if let Some(reply_to) = upload.reply_to {
                request = request.reply_to_message_id(reply_to);
            }
            request
        })
        .await?;
        Ok(message.audio().map(|audio| UploadedAudio {
            file_id: audio.file.id.clone(),
            file_size: u64::from(audio.file.size),
        }))
    }

    async fn resend(
        &self,
        chat_id: ChatId,
        reply_to: Option<MessageId>,
        entry: &CachedArtifact,
        caption: String,
    ) -> Result<(), RequestError> {
        let mut request = self
            .bot
            .send_audio(chat_id, InputFile::file_id(entry.file_id.clone()))
            .caption(caption);
        if !entry.title.is_empty() {
            request = request.title(entry.title.clone());
        }
        if !entry.performer.is_empty() {
            request = request.performer(entry.performer.clone());
        }
        if let Some(reply_to) = reply_to {
            request = request.reply_to_message_id(reply_to);
        }
        request.await.map(|_| ())
    }
}

/// Sends produced files and cached artifacts to a chat.
#[derive(Clone)]
pub struct Delivery {
    sender: Arc<dyn AudioSender>,
    cache: Arc<ArtifactCache>,
    lookup: Arc<dyn TrackLookup>,
    tools: FfmpegTools,
    reencoder: Reencoder,
    max_file_bytes: u64,
    temp_dir: PathBuf,
}

/// A file that is removed when dropped.
struct Scratch(Option<PathBuf>);

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Delivery {
    /// `tools` renders thumbnails; `encoder` probes durations and shrinks
    /// oversize FLAC.
    pub fn new(
        sender: Arc<dyn AudioSender>,
        cache: Arc<ArtifactCache>,
        lookup: Arc<dyn TrackLookup>,
        tools: FfmpegTools,
        encoder: Arc<dyn AudioEncoder>,
        max_file_bytes: u64,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            sender,
            cache,
            lookup,
            tools,
            reencoder: Reencoder::new(encoder, temp_dir.clone()),
            max_file_bytes,
            temp_dir,
        }
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    /// Uploads one produced track, shrinking FLAC output that exceeds the
    /// ceiling, and records the resulting handle in the cache.
    #[instrument(skip(self, track, progress), fields(path = %track.path.display()))]
    pub async fn send_file(
        &self,
        chat_id: ChatId,
        reply_to: Option<MessageId>,
        track: &FetchedTrack,
        variant: Variant,
        progress: &ProgressReporter,
    ) -> Result<(), AppError> {
        check_extension(&track.path, variant)?;

        let mut send_path = track.path.clone();
        let mut size_bytes = tokio::fs::metadata(&send_path).await?.len();
        let mut compressed = false;
        let mut _shrunk = Scratch(None);
        let cover = track.path.parent().and_then(find_cover_file);

        if size_bytes > self.max_file_bytes {
            if variant != Variant::Flac {
                return Err(AppError::Delivery(oversize_message(self.max_file_bytes)));
            }
            progress.update("Compressing", 0, 0);
            let shrunk = self
                .reencoder
                .shrink_to_fit(&send_path, self.max_file_bytes, cover.clone())
                .await?;
            info!(
                event = "delivery_shrunk",
                from_bytes = size_bytes,
                to_bytes = shrunk.size_bytes,
                sample_rate = ?shrunk.plan.sample_rate,
                channels = ?shrunk.plan.channels
            );
            send_path = shrunk.path.clone();
            size_bytes = shrunk.size_bytes;
            compressed = true;
            _shrunk = Scratch(Some(shrunk.path));
        }

        let mut duration_millis = track.duration_millis;
        let mut bitrate_kbps = calc_bitrate_kbps(size_bytes, duration_millis);
        if bitrate_kbps <= 0.0 {
            match self.reencoder.encoder().duration_seconds(&send_path).await {
                Ok(seconds) if seconds > 0.0 => {
                    duration_millis = (seconds * 1000.0) as u64;
                    bitrate_kbps = calc_bitrate_kbps(size_bytes, duration_millis);
                }
                Ok(_) => {}
                Err(err) => warn!(event = "duration_probe_failed", error = %err),
            }
        }

        progress.update("Uploading", 0, 0);
        let thumb = match &cover {
            Some(cover) => match self.tools.make_thumbnail(cover, &self.temp_dir).await {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(event = "thumbnail_failed", error = %err);
                    None
                }
            },
            None => None,
        };
        let _thumb = Scratch(thumb.clone());

        let upload = AudioUpload {
            chat_id,
            reply_to,
            path: send_path,
            file_name: track
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "audio".to_string()),
            caption: format_caption(size_bytes, bitrate_kbps, variant),
            duration_secs: (duration_millis / 1000) as u32,
            title: track.title.clone(),
            performer: track.performer.clone(),
            thumb,
        };
        let uploaded = self.sender.upload(&upload).await?;

        if let Some(uploaded) = uploaded {
            self.cache
                .put(
                    &track.track_id,
                    CachedArtifact {
                        file_id: uploaded.file_id,
                        file_size: uploaded.file_size,
                        compressed,
                        format: variant,
                        size_bytes,
                        bitrate_kbps,
                        duration_millis,
                        title: track.title.clone(),
                        performer: track.performer.clone(),
                        updated_at: None,
                    },
                )
                .await;
        }
        info!(event = "delivery_sent", chat_id = chat_id.0, size_bytes, compressed);
        Ok(())
    }

    /// Re-sends a cached artifact by handle. Returns `false` when nothing
    /// suitable is cached or the send failed; a handle Telegram rejects is
    /// removed from the cache.
    #[instrument(skip(self))]
    pub async fn send_cached(
        &self,
        chat_id: ChatId,
        reply_to: Option<MessageId>,
        content_id: &str,
        variant: Option<Variant>,
    ) -> bool {
        let Some(entry) = self.cache.get(content_id, variant, self.max_file_bytes).await else {
            return false;
        };
        let entry = self.cache.enrich(content_id, entry, self.lookup.as_ref()).await;
        let caption = format_caption(entry.effective_size(), entry.bitrate_kbps, entry.format);

        match self.sender.resend(chat_id, reply_to, &entry, caption).await {
            Ok(()) => {
                info!(event = "delivery_cache_hit", content_id, variant = %entry.format);
                true
            }
            Err(RequestError::Api(err)) => {
                warn!(event = "delivery_stale_handle", content_id, error = %err);
                self.cache.invalidate(content_id, entry.format, entry.compressed).await;
                false
            }
            Err(err) => {
                warn!(event = "delivery_cache_send_failed", content_id, error = %err);
                false
            }
        }
    }
}

async fn send_audio_with_retry<F, R>(make_request: F) -> Result<Message, AppError>
where
    F: Fn() -> R,
    R: std::future::IntoFuture<Output = Result<Message, RequestError>>,
{
    let mut attempt = 1;
    loop {
        match make_request().await {
            Ok(message) => return Ok(message),
            Err(err) => {
                let Some(delay) = retry_delay_for_upload(&err, attempt) else {
                    return Err(err.into());
                };
                if attempt == UPLOAD_MAX_RETRIES {
                    return Err(err.into());
                }
                if delay > Duration::ZERO {
                    warn!("Upload attempt {attempt} failed; retrying in {delay:?}: {err}");
                    time::sleep(delay).await;
                } else {
                    warn!("Upload attempt {attempt} failed; retrying immediately: {err}");
                }
                attempt += 1;
            }
        }
    }
}

fn retry_delay_for_upload(err: &RequestError, attempt: usize) -> Option<Duration> {
    match err {
        RequestError::RetryAfter(delay) => Some(*delay),
        RequestError::Network(net) if net.is_timeout() || net.is_connect() => Some(backoff_delay(attempt)),
        _ => None,
    }
}

fn backoff_delay(attempt: usize) -> Duration {
    let base_ms = UPLOAD_RETRY_BASE_DELAY.as_millis() as u64;
    let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
    let max_ms = UPLOAD_RETRY_MAX_DELAY.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(factor).min(max_ms);
    let jitter_ms = rand::thread_rng().gen_range(0..=500);
    Duration::from_millis(delay_ms + jitter_ms)
}

pub fn check_extension(path: &Path, variant: Variant) -> Result<(), AppError> {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default();
    if variant.accepts_extension(&ext) {
        return Ok(());
    }
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Err(AppError::Delivery(format!("output is not {}: {name}", variant.label())))
}

pub fn oversize_message(max_file_bytes: u64) -> String {
    format!(
        "ALAC file exceeds Telegram limit ({}MB). Use /settings flac or raise MAX_FILE_MB.",
        max_file_bytes / 1024 / 1024
    )
}

pub fn format_caption(size_bytes: u64, bitrate_kbps: f64, variant: Variant) -> String {
    let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
    format!("#{SOURCE_TAG} #{variant} {size_mb:.2}MB {:.2}kbps", bitrate_kbps.max(0.0))
}
