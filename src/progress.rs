use crate::error::AppError;
use async_trait::async_trait;
use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use teloxide::{
    prelude::*,
    types::MessageId,
    ApiError, RequestError,
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, warn, Instrument};

pub const PROGRESS_TICK: Duration = Duration::from_millis(1500);
pub const MIN_RENDER_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_PHASE: &str = "Working";

/// Where rendered status text goes.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn edit_status(&self, text: &str) -> Result<(), AppError>;
}

/// A status message in a chat, edited in place.
pub struct MessageStatus {
    bot: Bot,
    chat_id: ChatId,
    message_id: MessageId,
}

impl MessageStatus {
    pub fn new(bot: Bot, chat_id: ChatId, message_id: MessageId) -> Self {
        Self {
            bot,
            chat_id,
            message_id,
        }
    }
}

#[async_trait]
impl StatusSink for MessageStatus {
    async fn edit_status(&self, text: &str) -> Result<(), AppError> {
        match self
            .bot
            .edit_message_text(self.chat_id, self.message_id, text)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_message_not_modified(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

pub fn is_message_not_modified(err: &RequestError) -> bool {
    matches!(err, RequestError::Api(ApiError::MessageNotModified))
}

#[derive(Default)]
struct RenderState {
    latest_phase: String,
    latest_done: u64,
    latest_total: u64,
    dirty: bool,
    last_phase: String,
    last_percent: Option<u8>,
    last_text: String,
    last_render: Option<Instant>,
}

struct Shared {
    sink: Arc<dyn StatusSink>,
    state: StdMutex<RenderState>,
    // Serializes renders from the background loop and `update_sync`.
    render_lock: Mutex<()>,
}

/// Coalesces progress updates into rate-limited edits of one status message.
#[derive(Clone)]
pub struct ProgressReporter {
    shared: Arc<Shared>,
    wake: mpsc::Sender<()>,
    stop_tx: watch::Sender<bool>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ProgressReporter {
    pub fn start(sink: Arc<dyn StatusSink>) -> Self {
        let shared = Arc::new(Shared {
            sink,
            state: StdMutex::new(RenderState::default()),
            render_lock: Mutex::new(()),
        });
        // Capacity 1: a pending wake already covers any newer value.
        let (wake, mut wake_rx) = mpsc::channel::<()>(1);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let loop_shared = shared.clone();
        let handle = tokio::spawn(
            async move {
                let mut ticker = time::interval(PROGRESS_TICK);
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        woken = wake_rx.recv() => {
                            if woken.is_none() {
                                break;
                            }
                            loop_shared.flush(false).await;
                        }
                        _ = ticker.tick() => loop_shared.flush(false).await,
                    }
                }
                debug!(event = "progress_renderer_stopped");
            }
            .in_current_span(),
        );

        Self {
            shared,
            wake,
            stop_tx,
            handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Records the latest phase and counters. Never blocks.
    pub fn update(&self, phase: &str, done: u64, total: u64) {
        self.shared.set_latest(phase, done, total);
        let _ = self.wake.try_send(());
    }

    /// Records and renders immediately, bypassing rate limiting.
    pub async fn update_sync(&self, phase: &str, done: u64, total: u64) {
        self.shared.set_latest(phase, done, total);
        self.shared.flush(true).await;
    }

    /// Ends the renderer. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Shared {
    fn set_latest(&self, phase: &str, done: u64, total: u64) {
        let phase = phase.trim();
        let mut state = lock_state(&self.state);
        state.latest_phase = if phase.is_empty() {
            DEFAULT_PHASE.to_string()
        } else {
            phase.to_string()
        };
        state.latest_done = done;
        state.latest_total = total;
        state.dirty = true;
    }

    async fn flush(&self, force: bool) {
        let _render = self.render_lock.lock().await;
        let (phase, done, total, last_phase, last_percent, last_text, last_render) = {
            let mut state = lock_state(&self.state);
            if !state.dirty && !force {
                return;
            }
            state.dirty = false;
            (
                state.latest_phase.clone(),
                state.latest_done,
                state.latest_total,
                state.last_phase.clone(),
                state.last_percent,
                state.last_text.clone(),
                state.last_render,
            )
        };

        let percent = percent_of(done, total);
        let text = format_progress_text(&phase, done, total);
        let now = Instant::now();
        if !force {
            if text == last_text {
                return;
            }
            let phase_changed = phase != last_phase;
            let percent_changed = percent.is_some() && percent != last_percent;
            let recent = last_render.is_some_and(|at| now.duration_since(at) < MIN_RENDER_INTERVAL);
            if !phase_changed && !percent_changed && recent {
                return;
            }
        }

        if let Err(err) = self.sink.edit_status(&text).await {
            warn!(event = "progress_render_failed", error = %err);
            lock_state(&self.state).dirty = true;
            return;
        }
        let mut state = lock_state(&self.state);
        state.last_phase = phase;
        state.last_percent = percent;
        state.last_text = text;
        state.last_render = Some(now);
    }
}

fn lock_state(state: &StdMutex<RenderState>) -> std::sync::MutexGuard<'_, RenderState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn percent_of(done: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let percent = (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
    Some(percent as u8)
}

pub fn format_progress_text(phase: &str, done: u64, total: u64) -> String {
    if let Some(percent) = percent_of(done, total) {
        return format!("{phase}: {} / {} ({percent}%)", format_bytes(done), format_bytes(total));
    }
    if done > 0 {
        return format!("{phase}: {}", format_bytes(done));
    }
    phase.to_string()
}

pub fn format_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if value < 1024 {
        return format!("{value}B");
    }
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    let precision = if unit >= 2 { 2 } else { 1 };
    format!("{size:.precision$}{}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        renders: StdMutex<Vec<String>>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn edit_status(&self, text: &str) -> Result<(), AppError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(AppError::Delivery("edit rejected".into()));
            }
            self.renders.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    impl RecordingSink {
        fn count(&self) -> usize {
            self.renders.lock().unwrap().len()
        }
    }

    #[tokio::test]
    async fn rapid_identical_updates_render_at_most_once() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = ProgressReporter::start(sink.clone());

        for _ in 0..50 {
            reporter.update("Downloading", 512 * 1024, 1024 * 1024);
            tokio::task::yield_now().await;
        }
        time::sleep(Duration::from_millis(100)).await;
        reporter.stop().await;

        assert!(sink.count() <= 1);
    }

    #[tokio::test]
    async fn update_sync_forces_a_render() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = ProgressReporter::start(sink.clone());

        reporter.update_sync("Decrypting", 0, 0).await;
        reporter.update_sync("Decrypting", 0, 0).await;
        reporter.stop().await;

        let renders = sink.renders.lock().unwrap().clone();
        assert_eq!(renders, vec!["Decrypting".to_string(), "Decrypting".to_string()]);
    }

    #[tokio::test]
    async fn failed_render_is_retried_on_next_flush() {
        let sink = Arc::new(RecordingSink::default());
        let shared = Shared {
            sink: sink.clone(),
            state: StdMutex::new(RenderState::default()),
            render_lock: Mutex::new(()),
        };
        sink.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        shared.set_latest("Uploading", 0, 0);
        shared.flush(false).await;
        assert!(lock_state(&shared.state).dirty);

        sink.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        shared.flush(false).await;
        assert_eq!(sink.count(), 1);
        assert!(!lock_state(&shared.state).dirty);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let reporter = ProgressReporter::start(Arc::new(RecordingSink::default()));
        reporter.stop().await;
        reporter.stop().await;
    }

    #[test]
    fn progress_text_shapes() {
        assert_eq!(
            format_progress_text("Downloading", 512 * 1024, 2 * 1024 * 1024),
            "Downloading: 512.0KB / 2.00MB (25%)"
        );
        assert_eq!(format_progress_text("Decrypting", 3 * 1024 * 1024, 0), "Decrypting: 3.00MB");
        assert_eq!(format_progress_text("Converting", 0, 0), "Converting");
    }

    #[test]
    fn byte_units() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.5KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00GB");
    }
}
