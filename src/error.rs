use crate::encode::EncodeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Teloxide request error: {0}")]
    Teloxide(#[from] teloxide::RequestError),

    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Encode(#[from] EncodeError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Catalog request failed: {0}")]
    Catalog(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Missing fetch output: {0}")]
    MissingOutput(String),

    #[error("Fetch failed with exit code: {0}")]
    FetchFailed(std::process::ExitStatus),

    #[error("{0}")]
    Delivery(String),

    #[error("Download queue is full. Please try again later.")]
    QueueFull,

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}
