//! Server configuration loaded from environment variables

use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind to
    pub host: String,

    /// Port for the internal pipeline API
    pub port: u16,

    /// Which state store backend to use
    pub store_backend: StoreBackend,

    /// Redis connection string
    pub redis_url: String,

    /// Upper bound on every state store call
    pub store_timeout: Duration,

    /// Shared secret the HTTP layer presents on every pipeline call
    pub warden_secret: String,

    pub rate_limit: RateLimitSettings,
    pub fraud: FraudSettings,
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

/// Rate limiter knobs
#[derive(Debug, Clone, Default)]
pub struct RateLimitSettings {
    /// IPs and user ids that bypass every check
    pub whitelist: HashSet<String>,

    /// IPs and user ids that are always denied
    pub blacklist: HashSet<String>,

    /// User ids of trusted service accounts (highest capacity class)
    pub trusted_accounts: HashSet<String>,
}

/// Fraud detector knobs
#[derive(Debug, Clone)]
pub struct FraudSettings {
    /// Weight of the single highest signal
    pub max_weight: f64,

    /// Weight of the mean of all signals
    pub mean_weight: f64,

    /// Lockout length for `high` aggregate risk
    pub high_lockout: Duration,

    /// Lockout length for `critical` aggregate risk
    pub critical_lockout: Duration,

    /// Distinct accounts per device fingerprint before it is anomalous
    pub device_account_limit: usize,

    /// Distinct IPs per device fingerprint before it is anomalous
    pub device_ip_limit: usize,
}

impl Default for FraudSettings {
    fn default() -> Self {
        Self {
            max_weight: 0.7,
            mean_weight: 0.3,
            high_lockout: Duration::from_secs(15 * 60),
            critical_lockout: Duration::from_secs(60 * 60),
            device_account_limit: 3,
            device_ip_limit: 5,
        }
    }
}

/// Session manager knobs
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Key for session integrity hashes
    pub secret: String,

    /// Session dies after this long without a validated access
    pub idle_timeout: Duration,

    /// Session dies this long after creation regardless of activity
    pub absolute_timeout: Duration,

    /// Maximum concurrent sessions per user
    pub max_concurrent: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            secret: DEV_SESSION_SECRET.to_string(),
            idle_timeout: Duration::from_secs(30 * 60),
            absolute_timeout: Duration::from_secs(12 * 60 * 60),
            max_concurrent: 5,
        }
    }
}

const DEV_WARDEN_SECRET: &str = "dev-warden-secret";
const DEV_SESSION_SECRET: &str = "dev-session-secret";

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let store_backend = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "redis".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "redis" => StoreBackend::Redis,
            "memory" => StoreBackend::Memory,
            _ => return Err(ConfigError::Invalid("STORE_BACKEND")),
        };

        let fraud_defaults = FraudSettings::default();
        let fraud = FraudSettings {
            max_weight: parse_or("FRAUD_MAX_WEIGHT", fraud_defaults.max_weight)?,
            mean_weight: parse_or("FRAUD_MEAN_WEIGHT", fraud_defaults.mean_weight)?,
            high_lockout: Duration::from_secs(60 * parse_or("FRAUD_HIGH_LOCKOUT_MINS", 15u64)?),
            critical_lockout: Duration::from_secs(
                60 * parse_or("FRAUD_CRITICAL_LOCKOUT_MINS", 60u64)?,
            ),
            device_account_limit: parse_or(
                "FRAUD_DEVICE_ACCOUNT_LIMIT",
                fraud_defaults.device_account_limit,
            )?,
            device_ip_limit: parse_or("FRAUD_DEVICE_IP_LIMIT", fraud_defaults.device_ip_limit)?,
        };
        if fraud.max_weight < 0.0 || fraud.mean_weight < 0.0 {
            return Err(ConfigError::Invalid("FRAUD_MAX_WEIGHT/FRAUD_MEAN_WEIGHT"));
        }

        let session = SessionSettings {
            secret: env::var("SESSION_SECRET").unwrap_or_else(|_| DEV_SESSION_SECRET.to_string()),
            idle_timeout: Duration::from_secs(parse_or("SESSION_IDLE_TIMEOUT_SECS", 1800u64)?),
            absolute_timeout: Duration::from_secs(parse_or(
                "SESSION_ABSOLUTE_TIMEOUT_SECS",
                43_200u64,
            )?),
            max_concurrent: parse_or("SESSION_MAX_CONCURRENT", 5usize)?,
        };
        if session.max_concurrent == 0 {
            return Err(ConfigError::Invalid("SESSION_MAX_CONCURRENT"));
        }

        let config = Self {
            port: parse_or("PORT", 8080u16).map_err(|_| ConfigError::InvalidPort)?,
            store_backend,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            store_timeout: Duration::from_millis(parse_or("STORE_TIMEOUT_MS", 150u64)?),
            warden_secret: env::var("WARDEN_SECRET")
                .unwrap_or_else(|_| DEV_WARDEN_SECRET.to_string()),
            rate_limit: RateLimitSettings {
                whitelist: parse_list("RATE_LIMIT_WHITELIST"),
                blacklist: parse_list("RATE_LIMIT_BLACKLIST"),
                trusted_accounts: parse_list("TRUSTED_SERVICE_ACCOUNTS"),
            },
            fraud,
            session,
            host,
        };

        config.warn_on_dev_secrets();
        Ok(config)
    }

    /// Warn loudly if development secrets are used on a non-local bind
    fn warn_on_dev_secrets(&self) {
        let is_prod = self.host != "127.0.0.1" && self.host != "localhost";
        if !is_prod {
            return;
        }
        if self.warden_secret == DEV_WARDEN_SECRET {
            tracing::warn!("SECURITY WARNING: Using default WARDEN_SECRET on a public bind");
        }
        if self.session.secret == DEV_SESSION_SECRET {
            tracing::warn!("SECURITY WARNING: Using default SESSION_SECRET on a public bind");
        }
    }
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

fn parse_list(name: &str) -> HashSet<String> {
    env::var(name)
        .map(|raw| split_list(&raw))
        .unwrap_or_default()
}

fn split_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid port number")]
    InvalidPort,
}
