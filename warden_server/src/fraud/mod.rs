//! Fraud detection for authentication attempts
//!
//! Every attempt is recorded into bounded one-hour histories keyed by IP,
//! account and device fingerprint. Four independent signals are scored from
//! those histories and blended into one risk level, which drives alerts and
//! automated lockouts.
//!
//! A broken store must never let an attacker through, so every store failure
//! here is answered with `Critical` risk or a synthetic lockout.

pub mod reputation;
pub mod signals;

pub use signals::{RiskSignal, RiskWeights};

use crate::audit::AuditLog;
use crate::clock::{chrono_duration, Clock};
use crate::config::FraudSettings;
use crate::error::DefenseError;
use crate::store::{StateStore, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use reputation::Reputation;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use warden_common::{constants, RiskLevel, SecurityEvent, SignalType};

/// Histories cover the last hour
const HISTORY_WINDOW: Duration = Duration::from_secs(constants::HOUR_SECS);

/// Entries kept per history
const HISTORY_MAX_LEN: usize = 1000;

/// Tail of the IP history counted as a burst
const BURST_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Length of the synthetic lockout reported while the store is down
const UNAVAILABLE_LOCKOUT: Duration = Duration::from_secs(30);

/// Alerts kept per subject index; older ones age out with their TTL
const ALERT_INDEX_MAX_LEN: usize = 100;

const ALERT_TTL: Duration = Duration::from_secs(constants::ALERT_TTL_SECS);
const REPUTATION_TTL: Duration = Duration::from_secs(constants::REPUTATION_TTL_SECS);

/// Result of upstream credential verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// Who attempted to authenticate, from where, on which device
#[derive(Debug, Clone, Default)]
pub struct AttemptContext {
    pub account: Option<String>,
    pub ip: String,
    pub device_fingerprint: Option<String>,
}

/// One entry in an attempt history
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttemptRecord {
    at: i64,
    ip: String,
    account: Option<String>,
    device: Option<String>,
    success: bool,
    /// Keeps simultaneous identical attempts distinct in the sorted set
    nonce: String,
}

/// What a lockout or alert is about
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Account(String),
    Ip(String),
}

impl Subject {
    /// Parse `account:<id>` or `ip:<addr>`
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.split_once(':') {
            Some(("account", id)) if !id.is_empty() => Some(Subject::Account(id.to_string())),
            Some(("ip", addr)) if !addr.is_empty() => Some(Subject::Ip(addr.to_string())),
            _ => None,
        }
    }

    fn lockout_key(&self) -> String {
        format!("{}{}", constants::LOCKOUT_PREFIX, self)
    }

    fn alert_index_key(&self) -> String {
        format!("{}{}", constants::ALERT_INDEX_PREFIX, self)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Account(id) => write!(f, "account:{}", id),
            Subject::Ip(addr) => write!(f, "ip:{}", addr),
        }
    }
}

/// A stored, immutable record of one elevated signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudAlert {
    pub alert_id: String,
    pub subject: String,
    pub signal_type: SignalType,
    pub risk_level: RiskLevel,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockoutRecord {
    pub subject: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
    pub risk_level: RiskLevel,
}

impl LockoutRecord {
    /// Seconds until the lockout lifts
    pub fn retry_after(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_seconds().max(1) as u64
    }
}

/// Answer to "may this subject attempt to authenticate?"
#[derive(Debug, Clone)]
pub enum LockoutStatus {
    Clear,
    Locked(LockoutRecord),
    /// The store could not be consulted; carries a synthetic lockout
    Unavailable(LockoutRecord),
}

impl LockoutStatus {
    pub fn is_locked(&self) -> bool {
        !matches!(self, LockoutStatus::Clear)
    }
}

/// Result of evaluating one attempt
#[derive(Debug, Clone)]
pub struct Assessment {
    pub risk_level: RiskLevel,
    pub signals: Vec<RiskSignal>,
    pub alerts: Vec<FraudAlert>,
    pub lockouts: Vec<LockoutRecord>,
    /// The store failed and the risk level is the fail-closed default
    pub degraded: bool,
}

impl Assessment {
    fn fail_closed() -> Self {
        Self {
            risk_level: RiskLevel::Critical,
            signals: Vec::new(),
            alerts: Vec::new(),
            lockouts: Vec::new(),
            degraded: true,
        }
    }
}

#[derive(Clone)]
pub struct FraudDetector {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    settings: FraudSettings,
}

impl FraudDetector {
    /// Build the detector after a liveness probe of the store
    pub async fn init(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        audit: AuditLog,
        settings: FraudSettings,
    ) -> Result<Self, DefenseError> {
        store.ping().await?;
        Ok(Self {
            store,
            clock,
            audit,
            settings,
        })
    }

    fn weights(&self) -> RiskWeights {
        RiskWeights {
            max_weight: self.settings.max_weight,
            mean_weight: self.settings.mean_weight,
        }
    }

    /// Record an attempt, score it, and apply alerts and lockouts
    pub async fn evaluate(&self, ctx: &AttemptContext, outcome: AttemptOutcome) -> Assessment {
        let assessment = match self.assess(ctx, outcome).await {
            Ok(assessment) => assessment,
            Err(e) => {
                tracing::error!(
                    severity = "critical",
                    ip = %ctx.ip,
                    account = ctx.account.as_deref().unwrap_or("-"),
                    "Fraud detector store failure, failing closed: {}",
                    e
                );
                Assessment::fail_closed()
            }
        };

        self.emit_attempt(ctx, outcome, assessment.risk_level);
        assessment
    }

    async fn assess(&self, ctx: &AttemptContext, outcome: AttemptOutcome) -> StoreResult<Assessment> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();

        let record = AttemptRecord {
            at: now_ms,
            ip: ctx.ip.clone(),
            account: ctx.account.clone(),
            device: ctx.device_fingerprint.clone(),
            success: outcome == AttemptOutcome::Success,
            nonce: uuid::Uuid::new_v4().to_string(),
        };
        let member = serde_json::to_string(&record).map_err(|e| StoreError::Corrupt {
            key: "attempt".to_string(),
            reason: e.to_string(),
        })?;

        let ip_key = format!("{}{}", constants::ATTEMPTS_IP_PREFIX, ctx.ip);
        let account_key = ctx
            .account
            .as_ref()
            .map(|a| format!("{}{}", constants::ATTEMPTS_ACCOUNT_PREFIX, a));
        let device_key = ctx
            .device_fingerprint
            .as_ref()
            .map(|d| format!("{}{}", constants::ATTEMPTS_DEVICE_PREFIX, d));

        for key in std::iter::once(&ip_key).chain(account_key.iter()).chain(device_key.iter()) {
            self.store
                .window_push(key, now_ms as f64, &member, HISTORY_WINDOW, HISTORY_MAX_LEN)
                .await?;
        }

        let since = now_ms - HISTORY_WINDOW.as_millis() as i64;
        let ip_history = self.history(&ip_key, since).await?;
        let account_history = match &account_key {
            Some(key) => Some(self.history(key, since).await?),
            None => None,
        };
        let device_history = match &device_key {
            Some(key) => self.history(key, since).await?,
            None => Vec::new(),
        };

        let ip_failures = failures(&ip_history);
        let account_failures = account_history.as_deref().map(failures);
        let burst_since = now_ms - BURST_WINDOW.as_millis() as i64;
        let burst = ip_history.iter().filter(|r| r.at >= burst_since).count();
        let device_accounts: HashSet<&str> = device_history
            .iter()
            .filter_map(|r| r.account.as_deref())
            .collect();
        let device_ips: HashSet<&str> = device_history.iter().map(|r| r.ip.as_str()).collect();

        let rep_key = format!("{}{}", constants::REPUTATION_PREFIX, ctx.ip);
        let stored_reputation = self.load_reputation(&rep_key).await?;
        let reputation = stored_reputation.unwrap_or_else(|| Reputation::neutral(now));
        let prior_score = reputation.decayed(now);

        let login = signals::login_failure(ip_failures, account_failures);
        let rep = signals::ip_reputation(prior_score);
        let device = signals::device_anomaly(
            device_accounts.len(),
            device_ips.len(),
            self.settings.device_account_limit,
            self.settings.device_ip_limit,
        );
        let burst_signal = signals::request_burst(burst);

        // IP-derived findings decide whether the IP itself is locked
        let ip_level = signals::ip_failure_level(ip_failures)
            .max(burst_signal.risk_level)
            .max(rep.risk_level);
        let account_level = account_failures
            .map(signals::account_failure_level)
            .unwrap_or(RiskLevel::Low);

        let all_signals = vec![login, rep, device, burst_signal];
        let risk_level = signals::combine(&all_signals, self.weights());

        let ip_subject = Subject::Ip(ctx.ip.clone());
        let account_subject = ctx.account.clone().map(Subject::Account);

        let mut alerts = Vec::new();
        for signal in all_signals.iter().filter(|s| s.risk_level >= RiskLevel::Medium) {
            let subject = match (signal.signal_type, &account_subject) {
                (SignalType::LoginFailure, Some(account))
                    if account_level >= signals::ip_failure_level(ip_failures) =>
                {
                    account
                }
                (SignalType::DeviceAnomaly, Some(account)) => account,
                _ => &ip_subject,
            };
            alerts.push(self.raise_alert(subject, signal, now).await?);
        }

        if risk_level >= RiskLevel::Medium || stored_reputation.is_none() {
            let updated = reputation.bumped(risk_level, now);
            let raw = serde_json::to_string(&updated).map_err(|e| StoreError::Corrupt {
                key: rep_key.clone(),
                reason: e.to_string(),
            })?;
            self.store.set_ex(&rep_key, &raw, REPUTATION_TTL).await?;
        }

        let mut lockouts = Vec::new();
        if risk_level.requires_lockout() {
            let duration = match risk_level {
                RiskLevel::Critical => self.settings.critical_lockout,
                _ => self.settings.high_lockout,
            };
            let reason = lockout_reason(&all_signals);

            let mut subjects = Vec::new();
            if let Some(account) = &account_subject {
                subjects.push(account.clone());
            }
            if account_subject.is_none() || ip_level >= RiskLevel::High {
                subjects.push(ip_subject.clone());
            }

            for subject in subjects {
                lockouts.push(self.lock(&subject, risk_level, duration, &reason, now).await?);
            }
        }

        tracing::debug!(
            ip = %ctx.ip,
            account = ctx.account.as_deref().unwrap_or("-"),
            risk = %risk_level,
            ip_failures,
            account_failures = account_failures.unwrap_or(0),
            burst,
            reputation = prior_score,
            alerts = alerts.len(),
            lockouts = lockouts.len(),
            "Attempt assessed"
        );

        Ok(Assessment {
            risk_level,
            signals: all_signals,
            alerts,
            lockouts,
            degraded: false,
        })
    }

    /// Parsed history entries newer than `since_ms`
    async fn history(&self, key: &str, since_ms: i64) -> StoreResult<Vec<AttemptRecord>> {
        let members = self
            .store
            .zrange_by_score(key, since_ms as f64, f64::INFINITY)
            .await?;

        Ok(members
            .into_iter()
            .filter_map(|(member, _)| match serde_json::from_str(&member) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(key, "Skipping unreadable attempt record: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn load_reputation(&self, key: &str) -> StoreResult<Option<Reputation>> {
        match self.store.get(key).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(reputation) => Ok(Some(reputation)),
                Err(e) => {
                    tracing::warn!(key, "Resetting unreadable reputation record: {}", e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn raise_alert(
        &self,
        subject: &Subject,
        signal: &RiskSignal,
        now: DateTime<Utc>,
    ) -> StoreResult<FraudAlert> {
        let alert = FraudAlert {
            alert_id: uuid::Uuid::new_v4().to_string(),
            subject: subject.to_string(),
            signal_type: signal.signal_type,
            risk_level: signal.risk_level,
            created_at: now,
            expires_at: now + chrono_duration(ALERT_TTL),
            details: signal.details.clone(),
        };

        let key = format!("{}{}", constants::ALERT_PREFIX, alert.alert_id);
        let raw = serde_json::to_string(&alert).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set_ex(&key, &raw, ALERT_TTL).await?;
        self.store
            .window_push(
                &subject.alert_index_key(),
                now.timestamp_millis() as f64,
                &alert.alert_id,
                ALERT_TTL,
                ALERT_INDEX_MAX_LEN,
            )
            .await?;

        self.audit.emit(SecurityEvent::FraudAlertRaised {
            alert_id: alert.alert_id.clone(),
            subject: alert.subject.clone(),
            signal_type: alert.signal_type,
            risk_level: alert.risk_level,
            at: now,
        });
        Ok(alert)
    }

    async fn lock(
        &self,
        subject: &Subject,
        risk_level: RiskLevel,
        duration: Duration,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<LockoutRecord> {
        let record = LockoutRecord {
            subject: subject.to_string(),
            locked_at: now,
            expires_at: now + chrono_duration(duration),
            reason: reason.to_string(),
            risk_level,
        };

        let key = subject.lockout_key();
        let raw = serde_json::to_string(&record).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set_ex(&key, &raw, duration).await?;

        tracing::warn!(
            subject = %subject,
            risk = %risk_level,
            minutes = duration.as_secs() / 60,
            reason,
            "Lockout applied"
        );
        self.audit.emit(SecurityEvent::AccountLocked {
            subject: record.subject.clone(),
            reason: record.reason.clone(),
            risk_level,
            expires_at: record.expires_at,
            at: now,
        });
        Ok(record)
    }

    /// Whether the account or the IP is locked. Consult before verifying
    /// credentials.
    pub async fn lockout_status(&self, account: Option<&str>, ip: &str) -> LockoutStatus {
        if let Some(account) = account {
            let status = self.subject_lockout(&Subject::Account(account.to_string())).await;
            if status.is_locked() {
                return status;
            }
        }
        self.subject_lockout(&Subject::Ip(ip.to_string())).await
    }

    /// Lockout state of a single subject
    pub async fn subject_lockout(&self, subject: &Subject) -> LockoutStatus {
        let now = self.clock.now();
        match self.store.get(&subject.lockout_key()).await {
            Ok(Some(raw)) => match serde_json::from_str::<LockoutRecord>(&raw) {
                Ok(record) if record.expires_at > now => LockoutStatus::Locked(record),
                Ok(_) => LockoutStatus::Clear,
                Err(e) => {
                    tracing::error!(subject = %subject, "Unreadable lockout record: {}", e);
                    LockoutStatus::Unavailable(self.synthetic_lockout(subject, now))
                }
            },
            Ok(None) => LockoutStatus::Clear,
            Err(e) => {
                tracing::error!(
                    severity = "critical",
                    subject = %subject,
                    "Lockout check store failure, failing closed: {}",
                    e
                );
                LockoutStatus::Unavailable(self.synthetic_lockout(subject, now))
            }
        }
    }

    fn synthetic_lockout(&self, subject: &Subject, now: DateTime<Utc>) -> LockoutRecord {
        LockoutRecord {
            subject: subject.to_string(),
            locked_at: now,
            expires_at: now + chrono_duration(UNAVAILABLE_LOCKOUT),
            reason: "fraud state unavailable".to_string(),
            risk_level: RiskLevel::Critical,
        }
    }

    /// Stored alerts for a subject, newest first
    pub async fn recent_alerts(&self, subject: &Subject) -> Result<Vec<FraudAlert>, DefenseError> {
        let since = self.clock.now() - chrono_duration(ALERT_TTL);
        let ids = self
            .store
            .zrange_by_score(
                &subject.alert_index_key(),
                since.timestamp_millis() as f64,
                f64::INFINITY,
            )
            .await?;

        let mut alerts = Vec::with_capacity(ids.len());
        for (id, _) in ids.into_iter().rev() {
            let key = format!("{}{}", constants::ALERT_PREFIX, id);
            if let Some(raw) = self.store.get(&key).await? {
                match serde_json::from_str(&raw) {
                    Ok(alert) => alerts.push(alert),
                    Err(e) => tracing::warn!(key = %key, "Skipping unreadable alert: {}", e),
                }
            }
        }
        Ok(alerts)
    }

    fn emit_attempt(&self, ctx: &AttemptContext, outcome: AttemptOutcome, risk_level: RiskLevel) {
        let at = self.clock.now();
        let event = match (outcome, &ctx.account) {
            (AttemptOutcome::Success, Some(account)) => SecurityEvent::LoginSuccess {
                account: account.clone(),
                ip: ctx.ip.clone(),
                risk_level,
                at,
            },
            (AttemptOutcome::Success, None) => return,
            (AttemptOutcome::Failure, account) => SecurityEvent::LoginFailure {
                account: account.clone(),
                ip: ctx.ip.clone(),
                risk_level,
                at,
            },
        };
        self.audit.emit(event);
    }
}

fn failures(history: &[AttemptRecord]) -> usize {
    history.iter().filter(|r| !r.success).count()
}

/// Human-readable list of the signals that drove a lockout
fn lockout_reason(signals: &[RiskSignal]) -> String {
    let elevated: Vec<String> = signals
        .iter()
        .filter(|s| s.risk_level >= RiskLevel::Medium)
        .map(|s| format!("{}={}", s.signal_type.as_str(), s.risk_level))
        .collect();
    if elevated.is_empty() {
        "aggregate risk".to_string()
    } else {
        elevated.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::{Fault, MemoryStore};

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        audit: AuditLog,
        detector: FraudDetector,
    }

    async fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let audit = AuditLog::new();
        let detector = FraudDetector::init(
            store.clone(),
            clock.clone(),
            audit.clone(),
            FraudSettings::default(),
        )
        .await
        .unwrap();
        Harness {
            clock,
            store,
            audit,
            detector,
        }
    }

    fn attempt(account: Option<&str>, ip: &str) -> AttemptContext {
        AttemptContext {
            account: account.map(str::to_string),
            ip: ip.to_string(),
            device_fingerprint: None,
        }
    }

    #[tokio::test]
    async fn test_account_locked_after_five_failures() {
        let h = harness().await;
        let ctx = attempt(Some("alice"), "203.0.113.5");

        for _ in 0..4 {
            let assessment = h.detector.evaluate(&ctx, AttemptOutcome::Failure).await;
            assert!(assessment.lockouts.is_empty());
        }
        assert!(!h.detector.lockout_status(Some("alice"), "203.0.113.5").await.is_locked());

        let fifth = h.detector.evaluate(&ctx, AttemptOutcome::Failure).await;
        assert_eq!(fifth.risk_level, RiskLevel::Critical);
        assert!(fifth.lockouts.iter().any(|l| l.subject == "account:alice"));

        let status = h.detector.lockout_status(Some("alice"), "198.51.100.1").await;
        assert!(matches!(status, LockoutStatus::Locked(_)));
    }

    #[tokio::test]
    async fn test_distributed_failures_lock_account_not_ips() {
        let h = harness().await;
        for i in 0..5 {
            let ip = format!("198.51.100.{}", i);
            h.detector
                .evaluate(&attempt(Some("bob"), &ip), AttemptOutcome::Failure)
                .await;
        }

        assert!(h.detector.lockout_status(Some("bob"), "10.0.0.1").await.is_locked());
        assert!(!h.detector.lockout_status(None, "198.51.100.4").await.is_locked());
    }

    #[tokio::test]
    async fn test_anonymous_failures_lock_ip() {
        let h = harness().await;
        let ctx = attempt(None, "192.0.2.50");
        for _ in 0..10 {
            h.detector.evaluate(&ctx, AttemptOutcome::Failure).await;
        }

        let status = h.detector.lockout_status(None, "192.0.2.50").await;
        match status {
            LockoutStatus::Locked(record) => assert_eq!(record.subject, "ip:192.0.2.50"),
            other => panic!("expected an IP lockout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_successes_stay_low() {
        let h = harness().await;
        let ctx = attempt(Some("carol"), "192.0.2.10");
        for _ in 0..4 {
            let assessment = h.detector.evaluate(&ctx, AttemptOutcome::Success).await;
            assert_eq!(assessment.risk_level, RiskLevel::Low);
            assert!(assessment.alerts.is_empty());
        }
    }

    #[tokio::test]
    async fn test_history_window_slides() {
        let h = harness().await;
        let ctx = attempt(Some("dave"), "192.0.2.11");
        for _ in 0..4 {
            h.detector.evaluate(&ctx, AttemptOutcome::Failure).await;
        }

        h.clock.advance(chrono::Duration::minutes(61));
        let assessment = h.detector.evaluate(&ctx, AttemptOutcome::Failure).await;
        let login = &assessment.signals[0];
        assert_eq!(login.signal_type, SignalType::LoginFailure);
        assert_eq!(login.details["account_failures"], 1);
        assert!(assessment.lockouts.is_empty());
    }

    #[tokio::test]
    async fn test_lockout_expires() {
        let h = harness().await;
        let ctx = attempt(Some("erin"), "192.0.2.12");
        for _ in 0..5 {
            h.detector.evaluate(&ctx, AttemptOutcome::Failure).await;
        }
        assert!(h.detector.lockout_status(Some("erin"), "192.0.2.99").await.is_locked());

        h.clock.advance(chrono::Duration::minutes(61));
        assert!(!h.detector.lockout_status(Some("erin"), "192.0.2.99").await.is_locked());
    }

    #[tokio::test]
    async fn test_alerts_indexed_per_subject() {
        let h = harness().await;
        let ctx = attempt(Some("frank"), "192.0.2.13");
        for _ in 0..3 {
            h.detector.evaluate(&ctx, AttemptOutcome::Failure).await;
        }
        h.clock.advance(chrono::Duration::seconds(1));
        h.detector.evaluate(&ctx, AttemptOutcome::Failure).await;

        let alerts = h
            .detector
            .recent_alerts(&Subject::Account("frank".to_string()))
            .await
            .unwrap();
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.signal_type == SignalType::LoginFailure));
        assert!(alerts[0].created_at > alerts[1].created_at);
        assert_eq!(alerts[0].expires_at - alerts[0].created_at, chrono::Duration::days(7));
    }

    #[tokio::test]
    async fn test_alert_index_is_capped() {
        let h = harness().await;
        let subject = Subject::Ip("198.51.100.200".to_string());
        let signal = signals::request_burst(30);

        for _ in 0..ALERT_INDEX_MAX_LEN + 5 {
            h.clock.advance(chrono::Duration::seconds(1));
            h.detector
                .raise_alert(&subject, &signal, h.clock.now())
                .await
                .unwrap();
        }

        let alerts = h.detector.recent_alerts(&subject).await.unwrap();
        assert_eq!(alerts.len(), ALERT_INDEX_MAX_LEN);
        assert_eq!(alerts[0].created_at, h.clock.now());
    }

    #[tokio::test]
    async fn test_device_anomaly_across_accounts() {
        let h = harness().await;
        let mut last = None;
        for i in 0..4 {
            let ctx = AttemptContext {
                account: Some(format!("user{}", i)),
                ip: "192.0.2.14".to_string(),
                device_fingerprint: Some("fp-shared".to_string()),
            };
            last = Some(h.detector.evaluate(&ctx, AttemptOutcome::Success).await);
        }

        let assessment = last.unwrap();
        let device = assessment
            .signals
            .iter()
            .find(|s| s.signal_type == SignalType::DeviceAnomaly)
            .unwrap();
        assert_eq!(device.risk_level, RiskLevel::High);
        assert!(assessment.risk_level >= RiskLevel::High);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let h = harness().await;
        h.store.inject_fault(Fault::Timeout);

        let assessment = h
            .detector
            .evaluate(&attempt(Some("gina"), "192.0.2.15"), AttemptOutcome::Success)
            .await;
        assert_eq!(assessment.risk_level, RiskLevel::Critical);
        assert!(assessment.degraded);

        let status = h.detector.lockout_status(Some("gina"), "192.0.2.15").await;
        assert!(matches!(status, LockoutStatus::Unavailable(_)));
        assert!(status.is_locked());
    }

    #[tokio::test]
    async fn test_lockout_emits_audit_event() {
        let h = harness().await;
        let mut rx = h.audit.subscribe();
        let ctx = attempt(Some("hank"), "192.0.2.16");
        for _ in 0..5 {
            h.detector.evaluate(&ctx, AttemptOutcome::Failure).await;
        }

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"account_locked"));
        assert!(names.contains(&"fraud_alert_raised"));
        assert_eq!(names.iter().filter(|n| **n == "login_failure").count(), 5);
    }

    #[test]
    fn test_subject_parse() {
        assert_eq!(Subject::parse("account:alice"), Some(Subject::Account("alice".into())));
        assert_eq!(Subject::parse("ip:::1"), Some(Subject::Ip("::1".into())));
        assert_eq!(Subject::parse("device:x"), None);
        assert_eq!(Subject::parse("account:"), None);
    }
}
