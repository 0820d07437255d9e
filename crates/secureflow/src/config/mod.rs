use std::env;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub workflow: WorkflowConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = LogFormat::from_str(
            &env::var("APP_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()),
        );

        let defaults = WorkflowConfig::default();
        let workflow = WorkflowConfig {
            max_verification_attempts: read_positive(
                "APP_MAX_VERIFICATION_ATTEMPTS",
                defaults.max_verification_attempts,
            )?,
            classifier_timeout: Duration::from_secs(read_number(
                "APP_CLASSIFIER_TIMEOUT_SECS",
                defaults.classifier_timeout.as_secs(),
            )?),
            sync: SyncConfig {
                max_attempts: read_positive("APP_SYNC_MAX_ATTEMPTS", defaults.sync.max_attempts)?,
                backoff_base: Duration::from_millis(read_number(
                    "APP_SYNC_BACKOFF_BASE_MS",
                    defaults.sync.backoff_base.as_millis() as u64,
                )?),
                lease: Duration::from_secs(read_number(
                    "APP_SYNC_LEASE_SECS",
                    defaults.sync.lease.as_secs(),
                )?),
                delivery_timeout: Duration::from_secs(read_number(
                    "APP_SYNC_DELIVERY_TIMEOUT_SECS",
                    defaults.sync.delivery_timeout.as_secs(),
                )?),
            },
            reminders: ReminderConfig {
                enabled: read_flag("APP_REMINDERS_ENABLED", defaults.reminders.enabled)?,
                incomplete_delay: minutes(read_number(
                    "APP_INCOMPLETE_REMINDER_MINUTES",
                    defaults.reminders.incomplete_delay.as_secs() / 60,
                )?),
                signature_delay: minutes(read_number(
                    "APP_SIGNATURE_REMINDER_MINUTES",
                    defaults.reminders.signature_delay.as_secs() / 60,
                )?),
            },
        };

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig {
                log_level,
                log_format,
            },
            workflow,
        })
    }
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

fn read_number(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidNumber { key }),
        Err(_) => Ok(default),
    }
}

fn read_positive(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    let value = read_number(key, u64::from(default))?;
    match u32::try_from(value) {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ConfigError::InvalidNumber { key }),
    }
}

fn read_flag(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidFlag { key }),
        },
        Err(_) => Ok(default),
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Output shape of the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_format: LogFormat,
}

/// Knobs for the submission workflow engine.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowConfig {
    /// Lifetime classification attempts allowed per document.
    pub max_verification_attempts: u32,
    pub classifier_timeout: Duration,
    pub sync: SyncConfig,
    pub reminders: ReminderConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_verification_attempts: 3,
            classifier_timeout: Duration::from_secs(30),
            sync: SyncConfig::default(),
            reminders: ReminderConfig::default(),
        }
    }
}

/// Outbound CRM delivery policy.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub max_attempts: u32,
    /// Retry `n` waits `backoff_base * 2^n`.
    pub backoff_base: Duration,
    /// Age after which a persisted `SYNCING` claim is considered abandoned.
    pub lease: Duration,
    pub delivery_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            lease: Duration::from_secs(300),
            delivery_timeout: Duration::from_secs(30),
        }
    }
}

/// Deferred applicant reminder settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReminderConfig {
    pub enabled: bool,
    pub incomplete_delay: Duration,
    pub signature_delay: Duration,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            incomplete_delay: Duration::from_secs(60 * 60),
            signature_delay: Duration::from_secs(30 * 60),
        }
    }
}

/// Invalid environment input, named by the offending variable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("APP_PORT must be a valid u16")]
    InvalidPort,
    #[error("APP_HOST must parse to an IPv4 or IPv6 address")]
    InvalidHost { source: std::net::AddrParseError },
    #[error("{key} must be a positive integer")]
    InvalidNumber { key: &'static str },
    #[error("{key} must be one of true/false/1/0/yes/no/on/off")]
    InvalidFlag { key: &'static str },
}
