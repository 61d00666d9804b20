//! Client configuration.
//!
//! Resolved once at startup and handed to the client, which never reads the
//! environment itself. Several differently configured clients can coexist
//! in one process.

use std::time::Duration;

use url::Url;

use crate::retry::RetryPolicy;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("missing environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    InvalidVar { name: &'static str, value: String },
}

/// Immutable settings for one `ResourceClient`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    base_url: String,
    timeout: Duration,
    retry: RetryPolicy,
    default_headers: Vec<(String, String)>,
}

impl ClientConfig {
    /// Validate `base_url` (absolute http/https) and apply defaults.
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        let parsed = Url::parse(base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(ConfigError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: "base URL must not carry a query or fragment".to_string(),
            });
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            default_headers: Vec::new(),
        })
    }

    /// Build from `FHIR_BASE_URL` plus optional `FHIR_TIMEOUT_MS`,
    /// `FHIR_MAX_ATTEMPTS`, `FHIR_BACKOFF_BASE_MS` and `FHIR_BACKOFF_MAX_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = lookup("FHIR_BASE_URL").ok_or(ConfigError::MissingVar("FHIR_BASE_URL"))?;
        let mut config = Self::new(&base_url)?;

        let number = |name: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(name) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidVar { name, value }),
            }
        };

        if let Some(ms) = number("FHIR_TIMEOUT_MS")? {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(n) = number("FHIR_MAX_ATTEMPTS")? {
            config.retry.max_attempts = u32::try_from(n.max(1)).unwrap_or(u32::MAX);
        }
        if let Some(ms) = number("FHIR_BACKOFF_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = number("FHIR_BACKOFF_MAX_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Header sent on every request, before auth decoration.
    pub fn with_default_header(mut self, name: &str, value: &str) -> Self {
        self.default_headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn default_headers(&self) -> &[(String, String)] {
        &self.default_headers
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn trailing_slash_is_stripped() {
        let config = ClientConfig::new("https://fhir.example.org/r4/").unwrap();
        assert_eq!(config.base_url(), "https://fhir.example.org/r4");
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.retry(), &RetryPolicy::default());
    }

    #[test]
    fn rejects_bad_base_urls() {
        assert!(ClientConfig::new("not a url").is_err());
        assert!(ClientConfig::new("ftp://fhir.example.org").is_err());
        assert!(ClientConfig::new("https://fhir.example.org?x=1").is_err());
    }

    #[test]
    fn reads_environment_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("FHIR_BASE_URL", "http://localhost:8080/fhir"),
            ("FHIR_TIMEOUT_MS", "1500"),
            ("FHIR_MAX_ATTEMPTS", "3"),
            ("FHIR_BACKOFF_BASE_MS", "50"),
            ("FHIR_BACKOFF_MAX_MS", "1000"),
        ]))
        .unwrap();
        assert_eq!(config.timeout(), Duration::from_millis(1500));
        assert_eq!(config.retry().max_attempts, 3);
        assert_eq!(config.retry().base_delay, Duration::from_millis(50));
        assert_eq!(config.retry().max_delay, Duration::from_secs(1));
    }

    #[test]
    fn missing_base_url_is_reported() {
        let err = ClientConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("FHIR_BASE_URL")));
    }

    #[test]
    fn non_numeric_override_is_reported() {
        let err = ClientConfig::from_lookup(lookup(&[
            ("FHIR_BASE_URL", "http://localhost"),
            ("FHIR_TIMEOUT_MS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "FHIR_TIMEOUT_MS", .. }));
    }
}
