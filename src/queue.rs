//! Bounded download backlog drained by a single worker.

use crate::{
    delivery::Delivery,
    error::AppError,
    ffmpeg::{find_cover_file, FfmpegTools},
    fetch::{FetchJob, FetchTarget, FetchedTrack, Fetcher, TrackHint},
    hygiene,
    progress::{MessageStatus, ProgressReporter},
    session::Variant,
};
use async_trait::async_trait;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use teloxide::{prelude::*, types::MessageId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, info, instrument, warn, Instrument};

#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub chat_id: ChatId,
    pub reply_to: Option<MessageId>,
    pub variant: Variant,
    pub target: FetchTarget,
    pub hint: Option<TrackHint>,
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, request: DownloadRequest);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Admission {
    /// 1-based position, counting the job currently running.
    pub position: usize,
    /// Whether the requester is waiting behind other work.
    pub notify: bool,
}

#[derive(Clone)]
pub struct DownloadQueue {
    tx: mpsc::Sender<DownloadRequest>,
    capacity: usize,
    in_progress: Arc<AtomicBool>,
}

impl DownloadQueue {
    /// Spawns the worker and returns the admission handle.
    pub fn start(capacity: usize, runner: Arc<dyn JobRunner>) -> Self {
        let capacity = capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<DownloadRequest>(capacity);
        let in_progress = Arc::new(AtomicBool::new(false));

        let worker_flag = in_progress.clone();
        tokio::spawn(
            async move {
                while let Some(request) = rx.recv().await {
                    worker_flag.store(true, Ordering::SeqCst);
                    info!(event = "job_start", chat_id = request.chat_id.0, target = %request.target);
                    runner.run(request).await;
                    worker_flag.store(false, Ordering::SeqCst);
                }
                info!(event = "download_worker_stopped");
            }
            .in_current_span(),
        );

        Self {
            tx,
            capacity,
            in_progress,
        }
    }

    pub fn enqueue(&self, request: DownloadRequest) -> Result<Admission, AppError> {
        let in_progress = self.in_progress.load(Ordering::SeqCst);
        let queued = self.capacity.saturating_sub(self.tx.capacity());
        let mut position = queued + 1;
        if in_progress {
            position += 1;
        }
        match self.tx.try_send(request) {
            Ok(()) => Ok(Admission {
                position,
                notify: in_progress || queued > 0,
            }),
            Err(TrySendError::Full(request)) => {
                warn!(event = "queue_full", chat_id = request.chat_id.0, capacity = self.capacity);
                Err(AppError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                error!(event = "queue_closed");
                Err(AppError::QueueFull)
            }
        }
    }
}

/// Runs one download end to end against Telegram.
pub struct BotJobRunner {
    bot: Bot,
    fetcher: Arc<dyn Fetcher>,
    delivery: Delivery,
    tools: FfmpegTools,
    download_dir: PathBuf,
    quota_bytes: u64,
    cache_file: PathBuf,
}

impl BotJobRunner {
    pub fn new(
        bot: Bot,
        fetcher: Arc<dyn Fetcher>,
        delivery: Delivery,
        tools: FfmpegTools,
        download_dir: PathBuf,
        quota_bytes: u64,
        cache_file: PathBuf,
    ) -> Self {
        Self {
            bot,
            fetcher,
            delivery,
            tools,
            download_dir,
            quota_bytes,
            cache_file,
        }
    }

    async fn reply(&self, request: &DownloadRequest, text: String) -> Result<Message, AppError> {
        let mut send = self.bot.send_message(request.chat_id, text);
        if let Some(reply_to) = request.reply_to {
            send = send.reply_to_message_id(reply_to);
        }
        Ok(send.await?)
    }

    #[instrument(skip(self, request), fields(chat_id = request.chat_id.0, target = %request.target))]
    async fn run_job(&self, request: &DownloadRequest) -> Result<(), AppError> {
        if request.variant == Variant::Flac && !self.tools.is_available().await {
            let text = format!("ffmpeg not found at '{}'.", self.tools.ffmpeg_path().display());
            self.reply(request, text).await?;
            return Ok(());
        }

        let status = match self.reply(request, "Starting download...".to_string()).await {
            Ok(status) => status,
            Err(err) => {
                self.reply(request, format!("Failed to create status message: {err}")).await?;
                return Ok(());
            }
        };
        let reporter = ProgressReporter::start(Arc::new(MessageStatus::new(
            self.bot.clone(),
            request.chat_id,
            status.id,
        )));

        let sent_any = self.fetch_and_deliver(request, &reporter).await;
        reporter.stop().await;
        if sent_any {
            if let Err(err) = self.bot.delete_message(request.chat_id, status.id).await {
                warn!(event = "status_delete_failed", error = %err);
            }
        }
        Ok(())
    }

    /// Returns whether at least one file reached the chat.
    async fn fetch_and_deliver(&self, request: &DownloadRequest, reporter: &ProgressReporter) -> bool {
        reporter.update("Downloading", 0, 0);
        let job = FetchJob {
            target: request.target.clone(),
            variant: request.variant,
            output_dir: self.download_dir.clone(),
            hint: request.hint.clone(),
        };
        let tracks = match self.fetcher.fetch(&job, reporter).await {
            Ok(tracks) => tracks,
            Err(err) => {
                error!(event = "job_fetch_failed", error = %err);
                reporter.update_sync(&format!("Failed: {err}"), 0, 0).await;
                return false;
            }
        };
        if tracks.is_empty() {
            reporter.update_sync("No files were downloaded.", 0, 0).await;
            return false;
        }

        let mut sent_any = false;
        let mut last_error = None;
        for mut track in tracks {
            if job.target.is_single() {
                track.apply_hint(job.hint.as_ref());
            }
            match self.deliver_track(request, &job, track, reporter).await {
                Ok(()) => sent_any = true,
                Err(err) => {
                    error!(event = "job_delivery_failed", error = %err);
                    reporter.update(&format!("Failed to send audio: {err}"), 0, 0);
                    last_error = Some(err);
                }
            }
        }
        if !sent_any {
            if let Some(err) = last_error {
                reporter.update_sync(&format!("Failed to send audio: {err}"), 0, 0).await;
            }
        }
        sent_any
    }

    async fn deliver_track(
        &self,
        request: &DownloadRequest,
        job: &FetchJob,
        mut track: FetchedTrack,
        reporter: &ProgressReporter,
    ) -> Result<(), AppError> {
        if job.variant == Variant::Flac && Variant::Alac.accepts_extension(&extension_of(&track.path)) {
            reporter.update("Converting", 0, 0);
            let cover = track.path.parent().and_then(find_cover_file);
            track.path = self.tools.convert_to_flac(&track.path, cover).await?;
        }
        self.delivery
            .send_file(request.chat_id, request.reply_to, &track, job.variant, reporter)
            .await
    }

    async fn clean_downloads(&self) -> Result<hygiene::HygieneReport, AppError> {
        let root = self.download_dir.clone();
        let quota = self.quota_bytes;
        let cache_file = self.cache_file.clone();
        tokio::task::spawn_blocking(move || hygiene::enforce_quota(&root, quota, Some(cache_file.as_path()))).await?
    }
}

fn extension_of(path: &std::path::Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl JobRunner for BotJobRunner {
    async fn run(&self, request: DownloadRequest) {
        if let Err(err) = self.run_job(&request).await {
            error!(event = "job_failed", chat_id = request.chat_id.0, error = %err);
        }
        if let Err(err) = self.clean_downloads().await {
            warn!(event = "hygiene_failed", error = %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Mutex, time::Duration};
    use tokio::sync::watch;

    struct GatedRunner {
        gate: watch::Receiver<bool>,
        completed: Mutex<Vec<i64>>,
        done_tx: mpsc::UnboundedSender<i64>,
    }

    #[async_trait]
    impl JobRunner for GatedRunner {
        async fn run(&self, request: DownloadRequest) {
            let mut gate = self.gate.clone();
            while !*gate.borrow() {
                if gate.changed().await.is_err() {
                    break;
                }
            }
            self.completed.lock().unwrap().push(request.chat_id.0);
            let _ = self.done_tx.send(request.chat_id.0);
        }
    }

    fn request(chat: i64) -> DownloadRequest {
        DownloadRequest {
            chat_id: ChatId(chat),
            reply_to: None,
            variant: Variant::Alac,
            target: FetchTarget::Song(chat.to_string()),
            hint: None,
        }
    }

    async fn wait_until_running(queue: &DownloadQueue) {
        for _ in 0..100 {
            if queue.in_progress.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker never picked up the first job");
    }

    #[tokio::test]
    async fn full_backlog_rejects_exactly_one_and_drains_fifo() {
        let (gate_tx, gate_rx) = watch::channel(false);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let runner = Arc::new(GatedRunner {
            gate: gate_rx,
            completed: Mutex::new(Vec::new()),
            done_tx,
        });
        let capacity = 3;
        let queue = DownloadQueue::start(capacity, runner.clone());

        let first = queue.enqueue(request(0)).unwrap();
        assert_eq!(first, Admission { position: 1, notify: false });
        wait_until_running(&queue).await;

        let mut accepted = Vec::new();
        let mut rejected = 0;
        for chat in 1..=(capacity as i64 + 1) {
            match queue.enqueue(request(chat)) {
                Ok(admission) => accepted.push((chat, admission.position)),
                Err(AppError::QueueFull) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(rejected, 1);
        assert_eq!(accepted, vec![(1, 2), (2, 3), (3, 4)]);

        gate_tx.send(true).unwrap();
        for _ in 0..=capacity {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(*runner.completed.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn idle_queue_admits_without_notice() {
        let (gate_tx, gate_rx) = watch::channel(true);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let queue = DownloadQueue::start(
            2,
            Arc::new(GatedRunner {
                gate: gate_rx,
                completed: Mutex::new(Vec::new()),
                done_tx,
            }),
        );
        let admission = queue.enqueue(request(7)).unwrap();
        assert!(!admission.notify);
        assert_eq!(done_rx.recv().await, Some(7));
        drop(gate_tx);
    }
}
