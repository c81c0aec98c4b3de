use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::dispatch::BackoffPolicy;

/// Application-level constants
pub const APP_NAME: &str = "MedIntel";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable prefix for every setting.
pub const ENV_PREFIX: &str = "MEDINTEL_";

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4";
pub const DEFAULT_WHISPER_MODEL: &str = "whisper-1";
pub const DEFAULT_LANGUAGE_HINT: &str = "pt";
pub const DEFAULT_MAX_AUDIO_BYTES: u64 = 100 * 1024 * 1024;

pub const DEFAULT_ACCEPTED_CONTENT_TYPES: &[&str] = &[
    "audio/wav",
    "audio/mp3",
    "audio/mpeg",
    "audio/m4a",
    "audio/x-m4a",
    "audio/webm",
    "audio/ogg",
];

/// Default tracing filter when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "info,medintel_lib=debug,hyper=warn,reqwest=warn"
}

/// ~/MedIntel/ on all platforms. Falls back to the working directory
/// when no home directory can be determined.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },

    #[error("{0} must be greater than zero")]
    Zero(String),
}

/// Connection settings for the OpenAI-compatible API.
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub chat_model: String,
    pub whisper_model: String,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            api_key: None,
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            whisper_model: DEFAULT_WHISPER_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub audio_root: PathBuf,
    /// `None` uses the system temp directory.
    pub scratch_dir: Option<PathBuf>,
    pub openai: OpenAiSettings,
    /// JSON file of patient details for summarization. `None` summarizes
    /// every consultation anonymously.
    pub patients_file: Option<PathBuf>,
    pub language_hint: String,
    pub stage_timeout: Duration,
    pub worker_count: usize,
    pub queue_poll_interval: Duration,
    pub queue_lease: Duration,
    pub retry: BackoffPolicy,
    pub suggestion_top_n: usize,
    pub max_audio_bytes: u64,
    pub accepted_content_types: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::with_data_dir(app_data_dir())
    }
}

impl Settings {
    /// Defaults with every path derived from `data_dir`.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            database_path: data_dir.join("medintel.db"),
            audio_root: data_dir.join("audio"),
            scratch_dir: None,
            data_dir,
            openai: OpenAiSettings::default(),
            patients_file: None,
            language_hint: DEFAULT_LANGUAGE_HINT.to_string(),
            stage_timeout: Duration::from_secs(300),
            worker_count: 4,
            queue_poll_interval: Duration::from_millis(500),
            queue_lease: Duration::from_secs(3600),
            retry: BackoffPolicy::default(),
            suggestion_top_n: 3,
            max_audio_bytes: DEFAULT_MAX_AUDIO_BYTES,
            accepted_content_types: DEFAULT_ACCEPTED_CONTENT_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Load settings from the process environment, after reading an
    /// optional `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable source. Unset variables keep
    /// their defaults; set-but-unparseable ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| {
            lookup(&format!("{ENV_PREFIX}{key}")).filter(|v| !v.trim().is_empty())
        };

        let data_dir = var("DATA_DIR").map(PathBuf::from).unwrap_or_else(app_data_dir);
        let mut s = Self::with_data_dir(data_dir);

        if let Some(v) = var("DATABASE_PATH") {
            s.database_path = PathBuf::from(v);
        }
        if let Some(v) = var("AUDIO_ROOT") {
            s.audio_root = PathBuf::from(v);
        }
        s.scratch_dir = var("SCRATCH_DIR").map(PathBuf::from);

        if let Some(v) = var("OPENAI_BASE_URL") {
            s.openai.base_url = v;
        }
        // The conventional unprefixed name is honoured as a fallback.
        s.openai.api_key = var("OPENAI_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
        if let Some(v) = var("CHAT_MODEL") {
            s.openai.chat_model = v;
        }
        if let Some(v) = var("WHISPER_MODEL") {
            s.openai.whisper_model = v;
        }
        s.patients_file = var("PATIENTS_FILE").map(PathBuf::from);
        if let Some(v) = var("LANGUAGE") {
            s.language_hint = v;
        }

        if let Some(secs) = parse_var::<u64>(&var, "STAGE_TIMEOUT_SECS")? {
            s.stage_timeout = Duration::from_secs(non_zero("STAGE_TIMEOUT_SECS", secs)?);
        }
        if let Some(n) = parse_var::<usize>(&var, "WORKERS")? {
            s.worker_count = non_zero("WORKERS", n)?;
        }
        if let Some(ms) = parse_var::<u64>(&var, "QUEUE_POLL_MS")? {
            s.queue_poll_interval = Duration::from_millis(non_zero("QUEUE_POLL_MS", ms)?);
        }
        if let Some(secs) = parse_var::<u64>(&var, "QUEUE_LEASE_SECS")? {
            s.queue_lease = Duration::from_secs(non_zero("QUEUE_LEASE_SECS", secs)?);
        }
        if let Some(n) = parse_var::<u32>(&var, "MAX_ATTEMPTS")? {
            s.retry.max_attempts = non_zero("MAX_ATTEMPTS", n)?;
        }
        if let Some(ms) = parse_var::<u64>(&var, "RETRY_BASE_MS")? {
            s.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&var, "RETRY_MAX_SECS")? {
            s.retry.max_delay = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<usize>(&var, "SUGGESTION_TOP_N")? {
            s.suggestion_top_n = non_zero("SUGGESTION_TOP_N", n)?;
        }
        if let Some(n) = parse_var::<u64>(&var, "MAX_AUDIO_BYTES")? {
            s.max_audio_bytes = non_zero("MAX_AUDIO_BYTES", n)?;
        }
        if let Some(v) = var("ACCEPTED_CONTENT_TYPES") {
            s.accepted_content_types = v
                .split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect();
        }

        Ok(s)
    }
}

fn parse_var<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var: format!("{ENV_PREFIX}{key}"),
                value: raw,
                reason: e.to_string(),
            }),
    }
}

fn non_zero<T: Default + PartialEq>(key: &str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Zero(format!("{ENV_PREFIX}{key}")));
    }
    Ok(value)
}
