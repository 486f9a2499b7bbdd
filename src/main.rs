mod cache;
mod catalog;
mod config;
mod delivery;
mod encode;
mod error;
mod ffmpeg;
mod fetch;
mod handlers;
mod hygiene;
mod progress;
mod queue;
mod session;

use crate::{
    cache::ArtifactCache,
    catalog::AppleMusicCatalog,
    config::Config,
    delivery::{BotSender, Delivery},
    error::AppError,
    ffmpeg::FfmpegTools,
    fetch::ExternalFetcher,
    queue::{BotJobRunner, DownloadQueue},
};
use handlers::{build_handler, AppServices};
use std::{sync::Arc, time::Duration};
use teloxide::{net::default_reqwest_settings, prelude::*};
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, instrument, warn, Instrument};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    if let Err(err) = run().await {
        eprintln!("fatal error: {err}");
        error!(error = %err, "Application terminated with fatal error");
        return Err(err);
    }
    info!("Application shutdown complete");
    Ok(())
}

#[instrument]
async fn run() -> Result<(), AppError> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Initializing Apple Music Telegram bot");
    let config = Arc::new(Config::from_env()?);
    info!(
        event = "config_loaded",
        allowed_chats = config.allowed_chats.len(),
        max_file_mb = config.max_file_mb(),
        queue_capacity = config.queue_capacity,
        default_variant = %config.default_variant
    );

    let client = default_reqwest_settings()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| {
            error!(error = %e, "Failed to build HTTP client");
            e
        })?;
    info!("HTTP client configured successfully");

    let mut bot = Bot::from_env_with_client(client.clone());
    if let Some(url) = config.api_url.clone() {
        info!(event = "custom_api_url", url = %url);
        bot = bot.set_api_url(url);
    }
    info!("Telegram bot initialized");

    let cache = Arc::new(ArtifactCache::load(config.cache_file.clone()).await);
    let catalog = Arc::new(AppleMusicCatalog::new(
        client,
        config.catalog_token.clone(),
        config.storefront.clone(),
        config.search_language.clone(),
    ));
    let tools = FfmpegTools::new(config.ffmpeg_path.clone(), config.ffprobe_path.clone());
    let delivery = Delivery::new(
        Arc::new(BotSender::new(bot.clone())),
        cache.clone(),
        catalog.clone(),
        tools.clone(),
        Arc::new(tools.clone()),
        config.max_file_bytes,
        std::env::temp_dir(),
    );
    let runner = BotJobRunner::new(
        bot.clone(),
        Arc::new(ExternalFetcher::new(config.fetch_command.clone())),
        delivery.clone(),
        tools,
        config.download_dir.clone(),
        config.download_quota_bytes,
        config.cache_file.clone(),
    );
    let queue = DownloadQueue::start(config.queue_capacity, Arc::new(runner));

    let handler = build_handler();
    let services = AppServices::new(config, catalog.clone(), catalog, cache, delivery, queue);
    info!("Application services initialized");

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![services])
        .build();
    info!("Dispatcher built successfully");

    let shutdown_token = dispatcher.shutdown_token();
    tokio::spawn(
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, initiating graceful shutdown");
            if let Ok(wait) = shutdown_token.shutdown() {
                wait.await;
                info!("Graceful shutdown completed");
            } else {
                warn!("Failed to initiate graceful shutdown");
            }
        }
        .in_current_span(),
    );

    info!("Starting dispatcher event loop");
    dispatcher.dispatch().await;
    info!("Dispatcher stopped");
    Ok(())
}

#[cfg(unix)]
#[instrument]
async fn shutdown_signal() {
    let term = signal(SignalKind::terminate());
    let interrupt = signal(SignalKind::interrupt());
    match (term, interrupt) {
        (Ok(mut term), Ok(mut interrupt)) => {
            tokio::select! {
                _ = term.recv() => info!("Received SIGTERM signal"),
                _ = interrupt.recv() => info!("Received SIGINT signal"),
            }
        }
        (Ok(mut term), Err(err)) => {
            warn!(error = %err, "Failed to register SIGINT handler, falling back to SIGTERM only");
            let _ = term.recv().await;
            info!("Received SIGTERM signal");
        }
        (Err(err), Ok(mut interrupt)) => {
            warn!(error = %err, "Failed to register SIGTERM handler, falling back to SIGINT only");
            let _ = interrupt.recv().await;
            info!("Received SIGINT signal");
        }
        (Err(term_err), Err(int_err)) => {
            error!(sigterm_error = %term_err, sigint_error = %int_err, "Failed to register signal handlers");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C");
        }
    }
}

#[cfg(not(unix))]
#[instrument]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C signal");
}
