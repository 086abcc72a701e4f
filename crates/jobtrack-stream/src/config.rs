use std::time::Duration;

use crate::errors::JobtrackError;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// Configuration shared by the stream client and the CRUD read client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the tracker backend (without the `/api` prefix).
    pub base_url: String,
    /// Timeout for CRUD reads. Streams are never timed out.
    pub request_timeout: Duration,
    /// Tick of the completion fallback check.
    pub fallback_poll_interval: Duration,
    /// Maximum number of fallback ticks before the check gives up.
    pub fallback_poll_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            fallback_poll_interval: Duration::from_secs(1),
            fallback_poll_limit: 600,
        }
    }
}

impl ClientConfig {
    /// Creates a config pointing at `base_url` with default timings.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Builds a config from the environment.
    ///
    /// - `JOBTRACK_API_URL`: backend base URL (default `http://127.0.0.1:8000`).
    /// - `JOBTRACK_FALLBACK_POLL_MS`: completion fallback tick in milliseconds.
    /// - `JOBTRACK_FALLBACK_POLL_LIMIT`: maximum fallback ticks.
    pub fn from_env() -> Result<Self, JobtrackError> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("JOBTRACK_API_URL")
            && !url.trim().is_empty()
        {
            config.base_url = url.trim().to_string();
        }
        if let Some(ms) = parse_env::<u64>("JOBTRACK_FALLBACK_POLL_MS")? {
            config.fallback_poll_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = parse_env::<u32>("JOBTRACK_FALLBACK_POLL_LIMIT")? {
            config.fallback_poll_limit = limit;
        }
        config.validate()?;
        Ok(config)
    }

    /// Overrides the backend base URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the CRUD request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overrides the completion fallback tick and limit.
    pub fn fallback_poll(mut self, interval: Duration, limit: u32) -> Self {
        self.fallback_poll_interval = interval;
        self.fallback_poll_limit = limit;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), JobtrackError> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(JobtrackError::Config("base_url must not be empty".into()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(JobtrackError::Config(format!(
                "base_url must start with http:// or https://: {url}"
            )));
        }
        if self.fallback_poll_interval.is_zero() {
            return Err(JobtrackError::Config(
                "fallback_poll_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/{}",
            self.base_url.trim().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, JobtrackError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| JobtrackError::Config(format!("invalid value for {key}: {raw}"))),
        _ => Ok(None),
    }
}
