//! Client configuration, resolved once and passed explicitly.
//!
//! ```toml
//! base_uri = "https://bricata.example.com/api"
//! timeout_ms = 30000
//! concurrency = 5
//!
//! [credentials]
//! username = "analyst"
//! password = "hunter2"
//!
//! [proxy]
//! uri = "proxy.example.com:3128"
//! username = "proxy-user"
//! password = "proxy-pass"
//!
//! [tls]
//! verify = true
//! ca_path = "/etc/ssl/bricata-ca.pem"
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 1250
//! transient_statuses = [429, 503]
//! ```

use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::errors::{BricataError, Result};
use crate::retry::{Jitter, RetryPolicy};

/// Login credentials
#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: SecretString::from(password.to_string()),
        }
    }
}

/// Forward proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    /// Proxy address as `host:port`
    pub uri: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

/// TLS trust settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Verify the server certificate
    pub verify: bool,
    /// Extra PEM root certificate to trust
    pub ca_path: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify: true,
            ca_path: None,
        }
    }
}

/// Retry settings as they appear in configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Randomize backoff delays (full jitter)
    pub jitter: bool,
    pub transient_statuses: Vec<u16>,
    pub retry_transport_errors: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1250,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
            transient_statuses: vec![429, 503],
            retry_transport_errors: true,
        }
    }
}

impl RetrySettings {
    /// Build the [`RetryPolicy`] these settings describe
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.multiplier)
            .with_jitter(if self.jitter { Jitter::Full } else { Jitter::None })
            .with_transient_statuses(self.transient_statuses.iter().copied())
            .with_retry_transport_errors(self.retry_transport_errors)
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_concurrency() -> usize {
    5
}

/// Complete client configuration
///
/// # Example
///
/// ```rust
/// use bricata_api_client::{ClientConfig, Credentials};
/// use url::Url;
///
/// let config = ClientConfig::new(Url::parse("https://bricata.example.com/api").unwrap())
///     .with_credentials(Credentials::new("analyst", "secret"))
///     .with_concurrency(10);
///
/// assert_eq!(config.concurrency, 10);
/// ```
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Base URI every endpoint path is appended to
    pub base_uri: Url,
    pub credentials: Option<Credentials>,
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub tls: TlsConfig,
    /// Per-call HTTP timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Deadline for a whole batch in milliseconds
    pub batch_timeout_ms: Option<u64>,
    /// Simultaneous transport calls per batch
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl ClientConfig {
    pub fn new(base_uri: Url) -> Self {
        Self {
            base_uri,
            credentials: None,
            proxy: None,
            tls: TlsConfig::default(),
            timeout_ms: default_timeout_ms(),
            batch_timeout_ms: None,
            concurrency: default_concurrency(),
            retry: RetrySettings::default(),
        }
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(content).map_err(BricataError::ConfigParse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(BricataError::ConfigIo)?;
        Self::from_toml_str(&content)
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_ms.map(Duration::from_millis)
    }

    /// Check values serde cannot express
    ///
    /// # Errors
    ///
    /// Returns [`BricataError::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(BricataError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(BricataError::InvalidConfig(
                "timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.batch_timeout_ms == Some(0) {
            return Err(BricataError::InvalidConfig(
                "batch_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(BricataError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(BricataError::InvalidConfig(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        if let Some(proxy) = &self.proxy {
            if proxy.uri.is_empty() || proxy.uri.contains("://") {
                return Err(BricataError::InvalidConfig(format!(
                    "proxy.uri must be host:port, got '{}'",
                    proxy.uri
                )));
            }
        }
        Ok(())
    }
}

/// Whole milliseconds, rounding a non-zero sub-millisecond remainder up
fn duration_ms(duration: Duration) -> u64 {
    let millis = duration.as_millis() + u128::from(duration.subsec_nanos() % 1_000_000 != 0);
    u64::try_from(millis).unwrap_or(u64::MAX)
}
