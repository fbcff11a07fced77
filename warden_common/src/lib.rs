//! Warden Common - Shared types for the request-defense pipeline
//!
//! This crate contains the verdict, risk and audit definitions exchanged
//! between the HTTP layer and the pipeline services, plus the Redis key
//! layout they agree on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregated or per-signal risk level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Numeric score used when combining signals
    pub fn score(self) -> f64 {
        match self {
            RiskLevel::Low => 0.25,
            RiskLevel::Medium => 0.5,
            RiskLevel::High => 0.75,
            RiskLevel::Critical => 1.0,
        }
    }

    /// Bucket a combined score back into a level
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            RiskLevel::Critical
        } else if score >= 0.6 {
            RiskLevel::High
        } else if score >= 0.4 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Whether this level triggers an automated lockout
    pub fn requires_lockout(self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Independent fraud signals evaluated per authentication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    LoginFailure,
    IpReputation,
    DeviceAnomaly,
    RequestBurst,
}

impl SignalType {
    pub const ALL: [SignalType; 4] = [
        SignalType::LoginFailure,
        SignalType::IpReputation,
        SignalType::DeviceAnomaly,
        SignalType::RequestBurst,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::LoginFailure => "login_failure",
            SignalType::IpReputation => "ip_reputation",
            SignalType::DeviceAnomaly => "device_anomaly",
            SignalType::RequestBurst => "request_burst",
        }
    }
}

/// Specificity of a rate limit counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    Endpoint,
    User,
    Ip,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Endpoint => "endpoint",
            RateLimitScope::User => "user",
            RateLimitScope::Ip => "ip",
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle. Every terminal state means "invalid" to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    IdleExpired,
    AbsoluteExpired,
    Revoked,
    Evicted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::IdleExpired => "idle_expired",
            SessionState::AbsoluteExpired => "absolute_expired",
            SessionState::Revoked => "revoked",
            SessionState::Evicted => "evicted",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the HTTP layer hands the pipeline for every request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundRequest {
    /// Resolved user id, if the caller is authenticated
    pub resolved_identity: Option<String>,

    /// Client IP address
    pub ip_address: String,

    /// Request path (without query string)
    pub endpoint_path: String,

    /// HTTP method
    pub http_method: String,

    /// Whether `resolved_identity` was authenticated upstream
    pub is_authenticated: bool,

    /// Raw User-Agent header
    pub user_agent: Option<String>,

    /// All request headers as key-value pairs
    #[serde(default)]
    pub raw_headers: Vec<(String, String)>,

    /// Session token for session-bound requests
    #[serde(default)]
    pub session_id: Option<String>,
}

impl InboundRequest {
    /// Identity used for rate limiting: the user if authenticated, else the IP
    pub fn identity(&self) -> &str {
        match (&self.resolved_identity, self.is_authenticated) {
            (Some(user), true) => user,
            _ => &self.ip_address,
        }
    }

    /// Authenticated user id, if any
    pub fn user_id(&self) -> Option<&str> {
        if self.is_authenticated {
            self.resolved_identity.as_deref()
        } else {
            None
        }
    }

    /// Session token from the dedicated field, else the session header
    pub fn session_token(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .or_else(|| self.header(constants::SESSION_HEADER))
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        if name.eq_ignore_ascii_case("user-agent") {
            if let Some(ua) = self.user_agent.as_deref() {
                return Some(ua);
            }
        }
        self.raw_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The pipeline's answer for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the request may proceed
    pub admit: bool,

    /// HTTP status to return on deny (200 on admit)
    pub http_status: u16,

    /// Seconds the caller should wait before retrying
    pub retry_after: Option<u64>,

    /// Informational headers (quota, reset, retry-after)
    pub advisory_headers: Vec<(String, String)>,

    /// Machine-readable deny reason
    pub reason: Option<DenyReason>,
}

impl Verdict {
    pub fn admit(advisory_headers: Vec<(String, String)>) -> Self {
        Self {
            admit: true,
            http_status: 200,
            retry_after: None,
            advisory_headers,
            reason: None,
        }
    }

    pub fn deny(
        http_status: u16,
        reason: DenyReason,
        retry_after: Option<u64>,
        advisory_headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            admit: false,
            http_status,
            retry_after,
            advisory_headers,
            reason: Some(reason),
        }
    }
}

/// Why a request was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    RateLimited,
    Blacklisted,
    ServiceDegraded,
    AccountLocked,
    RiskThresholdExceeded,
    InvalidFingerprint,
    IntegrityViolation,
    SessionExpired,
}

/// Structured audit events handed to downstream observability
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SecurityEvent {
    LoginSuccess {
        account: String,
        ip: String,
        risk_level: RiskLevel,
        at: DateTime<Utc>,
    },
    LoginFailure {
        account: Option<String>,
        ip: String,
        risk_level: RiskLevel,
        at: DateTime<Utc>,
    },
    RateLimited {
        identity: String,
        ip: String,
        endpoint: String,
        scope: RateLimitScope,
        degraded: bool,
        at: DateTime<Utc>,
    },
    FraudAlertRaised {
        alert_id: String,
        subject: String,
        signal_type: SignalType,
        risk_level: RiskLevel,
        at: DateTime<Utc>,
    },
    AccountLocked {
        subject: String,
        reason: String,
        risk_level: RiskLevel,
        expires_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    SessionCreated {
        session_id: String,
        user_id: String,
        ip: String,
        at: DateTime<Utc>,
    },
    SessionInvalidated {
        session_id: String,
        user_id: String,
        state: SessionState,
        at: DateTime<Utc>,
    },
    IntegrityViolation {
        session_id: String,
        user_id: String,
        risk_level: RiskLevel,
        at: DateTime<Utc>,
    },
}

impl SecurityEvent {
    /// Event name as it appears in the serialized `event` tag
    pub fn name(&self) -> &'static str {
        match self {
            SecurityEvent::LoginSuccess { .. } => "login_success",
            SecurityEvent::LoginFailure { .. } => "login_failure",
            SecurityEvent::RateLimited { .. } => "rate_limited",
            SecurityEvent::FraudAlertRaised { .. } => "fraud_alert_raised",
            SecurityEvent::AccountLocked { .. } => "account_locked",
            SecurityEvent::SessionCreated { .. } => "session_created",
            SecurityEvent::SessionInvalidated { .. } => "session_invalidated",
            SecurityEvent::IntegrityViolation { .. } => "integrity_violation",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Constants shared by the pipeline and its consumers
pub mod constants {
    /// Redis key prefix for rate limit counters
    pub const RATE_LIMIT_PREFIX: &str = "rl:";

    /// Redis key prefixes for authentication attempt histories
    pub const ATTEMPTS_IP_PREFIX: &str = "fraud:attempts:ip:";
    pub const ATTEMPTS_ACCOUNT_PREFIX: &str = "fraud:attempts:acct:";
    pub const ATTEMPTS_DEVICE_PREFIX: &str = "fraud:attempts:dev:";

    /// Redis key prefix for IP reputation scores
    pub const REPUTATION_PREFIX: &str = "fraud:rep:";

    /// Redis key prefixes for fraud alerts and their per-subject index
    pub const ALERT_PREFIX: &str = "fraud:alert:";
    pub const ALERT_INDEX_PREFIX: &str = "fraud:alerts:";

    /// Redis key prefix for lockout records
    pub const LOCKOUT_PREFIX: &str = "fraud:lock:";

    /// Redis key prefixes for sessions and their reverse indexes. Record
    /// and index namespaces are disjoint so no session id can address an index.
    pub const SESSION_PREFIX: &str = "session:rec:";
    pub const USER_SESSIONS_PREFIX: &str = "session:idx:user:";
    pub const DEVICE_SESSIONS_PREFIX: &str = "session:idx:dev:";

    /// Rate limit horizons (seconds)
    pub const MINUTE_SECS: u64 = 60;
    pub const HOUR_SECS: u64 = 3600;
    pub const DAY_SECS: u64 = 86_400;

    /// Fraud alerts live for 7 days
    pub const ALERT_TTL_SECS: u64 = 7 * DAY_SECS;

    /// IP reputation lives for 30 days, the longest TTL in the pipeline
    pub const REPUTATION_TTL_SECS: u64 = 30 * DAY_SECS;

    /// Header carrying the internal shared secret
    pub const WARDEN_SECRET_HEADER: &str = "X-Warden-Secret";

    /// Header carrying the session token on session-bound requests
    pub const SESSION_HEADER: &str = "X-Session-Id";
}
