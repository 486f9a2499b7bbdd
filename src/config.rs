use crate::error::AppError;
use crate::session::Variant;
use std::{collections::HashSet, path::PathBuf, str::FromStr};
use teloxide::types::ChatId;

const DEFAULT_SEARCH_PAGE_SIZE: usize = 8;
const DEFAULT_QUEUE_CAPACITY: usize = 20;
const DEFAULT_MAX_FILE_MB: u64 = 50;
const DEFAULT_DOWNLOAD_QUOTA_GB: u64 = 3;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Runtime settings, read from the environment once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: Option<reqwest::Url>,
    pub allowed_chats: HashSet<ChatId>,
    pub search_page_size: usize,
    pub max_file_bytes: u64,
    pub download_quota_bytes: u64,
    pub default_variant: Variant,
    pub cache_file: PathBuf,
    pub download_dir: PathBuf,
    pub queue_capacity: usize,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub fetch_command: PathBuf,
    pub catalog_token: String,
    pub storefront: String,
    pub search_language: String,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_url = match get("TELEGRAM_API_URL") {
            Some(raw) => {
                let base = format!("{}/", raw.trim_end_matches('/'));
                let url = reqwest::Url::parse(&base)
                    .map_err(|e| AppError::Config(format!("TELEGRAM_API_URL: {e}")))?;
                Some(url)
            }
            None => None,
        };

        let allowed_chats = match get("ALLOWED_CHAT_IDS") {
            Some(raw) => parse_chat_ids(&raw)?,
            None => HashSet::new(),
        };

        let search_page_size: usize = parse_or(&get, "SEARCH_PAGE_SIZE", DEFAULT_SEARCH_PAGE_SIZE)?;
        let queue_capacity: usize = parse_or(&get, "QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?;
        let max_file_mb: u64 = parse_or(&get, "MAX_FILE_MB", DEFAULT_MAX_FILE_MB)?;
        let quota_gb: u64 = parse_or(&get, "DOWNLOAD_QUOTA_GB", DEFAULT_DOWNLOAD_QUOTA_GB)?;

        let default_variant = match get("DEFAULT_FORMAT") {
            Some(raw) => Variant::parse(&raw)
                .ok_or_else(|| AppError::Config(format!("DEFAULT_FORMAT must be alac or flac, got {raw}")))?,
            None => Variant::Alac,
        };

        let storefront = get("STOREFRONT")
            .filter(|sf| sf.len() == 2)
            .unwrap_or_else(|| "us".to_string());

        Ok(Self {
            api_url,
            allowed_chats,
            search_page_size: if search_page_size == 0 { DEFAULT_SEARCH_PAGE_SIZE } else { search_page_size },
            max_file_bytes: to_bytes("MAX_FILE_MB", max_file_mb, DEFAULT_MAX_FILE_MB, MIB)?,
            download_quota_bytes: to_bytes("DOWNLOAD_QUOTA_GB", quota_gb, DEFAULT_DOWNLOAD_QUOTA_GB, GIB)?,
            default_variant,
            cache_file: get("CACHE_FILE").unwrap_or_else(|| "telegram-cache.json".into()).into(),
            download_dir: get("DOWNLOAD_DIR").unwrap_or_else(|| "downloads".into()).into(),
            queue_capacity: queue_capacity.max(1),
            ffmpeg_path: get("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".into()).into(),
            ffprobe_path: get("FFPROBE_PATH").unwrap_or_else(|| "ffprobe".into()).into(),
            fetch_command: get("FETCH_COMMAND").unwrap_or_else(|| "amdl".into()).into(),
            catalog_token: get("CATALOG_TOKEN").unwrap_or_default(),
            storefront,
            search_language: get("SEARCH_LANGUAGE").unwrap_or_default(),
        })
    }

    pub fn is_allowed(&self, chat_id: ChatId) -> bool {
        self.allowed_chats.is_empty() || self.allowed_chats.contains(&chat_id)
    }

    pub fn max_file_mb(&self) -> u64 {
        self.max_file_bytes / MIB
    }
}

/// Zero selects the default.
fn to_bytes(key: &str, value: u64, default: u64, unit: u64) -> Result<u64, AppError> {
    let value = if value == 0 { default } else { value };
    value
        .checked_mul(unit)
        .ok_or_else(|| AppError::Config(format!("{key} is too large: {value}")))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| AppError::Config(format!("{key}: {e}"))),
        None => Ok(default),
    }
}

fn parse_chat_ids(raw: &str) -> Result<HashSet<ChatId>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>()
                .map(ChatId)
                .map_err(|e| AppError::Config(format!("ALLOWED_CHAT_IDS entry {part}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, AppError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.search_page_size, 8);
        assert_eq!(config.max_file_bytes, 50 * MIB);
        assert_eq!(config.download_quota_bytes, 3 * GIB);
        assert_eq!(config.default_variant, Variant::Alac);
        assert_eq!(config.storefront, "us");
        assert!(config.is_allowed(ChatId(42)));
    }

    #[test]
    fn allow_list_restricts_chats() {
        let config = config_from(&[("ALLOWED_CHAT_IDS", "1, -100200")]).unwrap();
        assert!(config.is_allowed(ChatId(1)));
        assert!(config.is_allowed(ChatId(-100200)));
        assert!(!config.is_allowed(ChatId(2)));
    }

    #[test]
    fn rejects_unknown_default_format() {
        let err = config_from(&[("DEFAULT_FORMAT", "mp3")]).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn api_url_is_normalized_to_a_directory() {
        let config = config_from(&[("TELEGRAM_API_URL", "http://localhost:8081/tg//")]).unwrap();
        assert_eq!(config.api_url.unwrap().as_str(), "http://localhost:8081/tg/");
        let config = config_from(&[("STOREFRONT", "japan"), ("QUEUE_CAPACITY", "0")]).unwrap();
        assert_eq!(config.storefront, "us");
        assert_eq!(config.queue_capacity, 1);
    }

    #[test]
    fn oversized_limits_are_rejected() {
        let huge = u64::MAX.to_string();
        let err = config_from(&[("MAX_FILE_MB", huge.as_str())]).unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("MAX_FILE_MB")));
        let err = config_from(&[("DOWNLOAD_QUOTA_GB", "20000000000")]).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        let config = config_from(&[("MAX_FILE_MB", "2000")]).unwrap();
        assert_eq!(config.max_file_bytes, 2000 * MIB);
    }
}
