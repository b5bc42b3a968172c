use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::retry::RetryConfig;

/// Default server address for a local install.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8188";

/// Default overall execution timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound applied to any caller-supplied timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Lower bound applied to any caller-supplied timeout.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Settings for one execution client.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Normalized `http(s)://host[:port][/prefix]`, no trailing slash.
    pub base_url: String,
    /// Overall deadline for submit + poll, also used per request.
    pub timeout: Duration,
    /// Total attempts for retryable operations.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub poll_interval: Duration,
    /// Listen on the server WebSocket for progress events while polling.
    pub stream_progress: bool,
    /// Ask the server to overwrite uploads with the same name.
    pub overwrite_uploads: bool,
}

/// Errors from building or loading an [`ExecutionConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },
}

impl ExecutionConfig {
    /// Config with defaults for everything except the server URL.
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stream_progress: false,
            overwrite_uploads: true,
        })
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                 |
    /// |-------------------------------|-------------------------|
    /// | `COMFYUI_URL`                 | `http://127.0.0.1:8188` |
    /// | `COMFYUI_TIMEOUT_SECS`        | `300`                   |
    /// | `COMFYUI_MAX_RETRIES`         | `3`                     |
    /// | `COMFYUI_RETRY_BASE_DELAY_MS` | `1000`                  |
    /// | `COMFYUI_POLL_INTERVAL_MS`    | `1000`                  |
    /// | `COMFYUI_STREAM_PROGRESS`     | `false`                 |
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("COMFYUI_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        let timeout_secs = non_zero(
            "COMFYUI_TIMEOUT_SECS",
            env_or("COMFYUI_TIMEOUT_SECS", DEFAULT_TIMEOUT.as_secs())?,
        )?;
        let max_retries: u32 = env_or("COMFYUI_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        let retry_base_delay_ms: u64 = env_or(
            "COMFYUI_RETRY_BASE_DELAY_MS",
            DEFAULT_RETRY_BASE_DELAY.as_millis() as u64,
        )?;
        let poll_interval_ms: u64 = env_or(
            "COMFYUI_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL.as_millis() as u64,
        )?;
        let stream_progress: bool = env_or("COMFYUI_STREAM_PROGRESS", false)?;

        Ok(Self::new(&base_url)?
            .with_timeout(Duration::from_secs(timeout_secs))
            .with_max_retries(max_retries)
            .with_retry_base_delay(Duration::from_millis(retry_base_delay_ms))
            .with_poll_interval(Duration::from_millis(poll_interval_ms))
            .with_stream_progress(stream_progress))
    }

    /// Set the overall timeout, clamped to [`MIN_TIMEOUT`]..=[`MAX_TIMEOUT`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);
        self
    }

    /// Set the total attempt count for retryable calls (at least one).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stream_progress(mut self, enabled: bool) -> Self {
        self.stream_progress = enabled;
        self
    }

    pub fn with_overwrite_uploads(mut self, overwrite: bool) -> Self {
        self.overwrite_uploads = overwrite;
        self
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries.max(1),
            base_delay: self.retry_base_delay,
            ..RetryConfig::default()
        }
    }

    /// Parsed base URL. Always succeeds for a config built through [`Self::new`].
    pub fn server_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })
    }

    /// WebSocket endpoint for progress events addressed to `client_id`.
    pub fn ws_url(&self, client_id: &str) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{ws_base}/ws?clientId={client_id}")
    }

    /// Absolute URL for a server-relative path such as `/view?...`.
    pub fn absolute_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

/// Validate an http(s) server URL and strip any trailing slash.
pub fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let invalid = |reason: String| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("URL must not be empty".into()));
    }

    let parsed = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!(
            "scheme must be http or https, got '{}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("URL has no host".into()));
    }

    Ok(trimmed.to_string())
}

fn non_zero(name: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn env_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}
