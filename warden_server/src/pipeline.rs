//! The request-defense pipeline
//!
//! Composes the three services in a fixed order: rate limiting first, then
//! the lockout check for auth-sensitive endpoints, then session validation
//! for session-bound requests. Each service owns its store-failure policy;
//! the pipeline only turns their answers into verdicts.

use crate::abuse::{classify, DecisionBasis, Identity, RateLimitDecision, RateLimiter};
use crate::audit::AuditLog;
use crate::clock::Clock;
use crate::error::DefenseError;
use crate::fraud::{AttemptContext, AttemptOutcome, Assessment, FraudDetector, LockoutStatus};
use crate::session::{fingerprint, Credentials, SessionManager, SessionRecord};
use http::StatusCode;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use warden_common::{DenyReason, InboundRequest, RiskLevel, SecurityEvent, Verdict};

/// Retry-after on a generic degraded deny
const DEGRADED_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Result of a login attempt that got as far as credential verification
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// Credentials valid and risk acceptable; a session was issued
    Authenticated {
        session: SessionRecord,
        risk_level: RiskLevel,
    },
    /// Credentials invalid; the failure was recorded
    Rejected { assessment: Assessment },
}

#[derive(Clone)]
pub struct DefensePipeline {
    pub limiter: RateLimiter,
    pub fraud: FraudDetector,
    pub sessions: SessionManager,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
}

impl DefensePipeline {
    pub fn new(
        limiter: RateLimiter,
        fraud: FraudDetector,
        sessions: SessionManager,
        clock: Arc<dyn Clock>,
        audit: AuditLog,
    ) -> Self {
        Self {
            limiter,
            fraud,
            sessions,
            clock,
            audit,
        }
    }

    /// Decide whether an inbound request is admitted
    pub async fn screen(&self, request: &InboundRequest) -> Verdict {
        let identity = Identity::from_request(request);
        let decision = self.limiter.check(&identity, &request.endpoint_path).await;
        let headers = decision.headers();
        let auth_sensitive = classify(&request.endpoint_path).is_auth_sensitive();
        let account = request.resolved_identity.as_deref();

        if !decision.allowed {
            self.emit_rate_limited(request, &decision);
            // A locked subject learns about the lockout, not the quota
            if auth_sensitive && decision.basis == DecisionBasis::Counted {
                if let Err(e @ DefenseError::AccountLocked { .. }) =
                    self.check_lockout(account, &request.ip_address).await
                {
                    return deny_for(&e, headers, self.clock.now());
                }
            }
            let (status, reason) = match decision.basis {
                DecisionBasis::Blacklisted => (StatusCode::FORBIDDEN, DenyReason::Blacklisted),
                DecisionBasis::Degraded => {
                    (StatusCode::SERVICE_UNAVAILABLE, DenyReason::ServiceDegraded)
                }
                DecisionBasis::Counted | DecisionBasis::Whitelisted => {
                    (StatusCode::TOO_MANY_REQUESTS, DenyReason::RateLimited)
                }
            };
            return Verdict::deny(
                status.as_u16(),
                reason,
                decision.retry_after.map(|d| d.as_secs().max(1)),
                headers,
            );
        }

        if auth_sensitive {
            if let Err(e) = self.check_lockout(account, &request.ip_address).await {
                return deny_for(&e, headers, self.clock.now());
            }
        }

        if let Some(session_id) = request.session_token() {
            if let Err(e) = self.sessions.validate(session_id).await {
                tracing::info!(ip = %request.ip_address, "Session rejected: {}", e);
                return deny_for(&e, headers, self.clock.now());
            }
        }

        Verdict::admit(headers)
    }

    /// Run a login attempt for `account`. The lockout check comes first, so a
    /// locked subject gets `AccountLocked` even when it is also over quota,
    /// and `verify` is never called for it.
    pub async fn login<F, Fut>(
        &self,
        request: &InboundRequest,
        account: &str,
        credentials: &Credentials,
        verify: F,
    ) -> Result<LoginOutcome, DefenseError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        self.check_lockout(Some(account), &request.ip_address).await?;

        let identity = Identity::anonymous(request.ip_address.clone());
        let decision = self.limiter.check(&identity, &request.endpoint_path).await;
        if !decision.allowed {
            self.emit_rate_limited(request, &decision);
            return Err(match decision.basis {
                DecisionBasis::Degraded => {
                    DefenseError::StoreUnavailable("rate limiter failing closed".to_string())
                }
                _ => DefenseError::CapacityExceeded {
                    retry_after: decision.retry_after.unwrap_or(DEGRADED_RETRY_AFTER),
                },
            });
        }

        let outcome = if verify().await {
            AttemptOutcome::Success
        } else {
            AttemptOutcome::Failure
        };

        let ctx = AttemptContext {
            account: Some(account.to_string()),
            ip: request.ip_address.clone(),
            device_fingerprint: fingerprint::derive(request).ok().map(|f| f.hash),
        };
        let assessment = self.fraud.evaluate(&ctx, outcome).await;

        if outcome == AttemptOutcome::Failure {
            return Ok(LoginOutcome::Rejected { assessment });
        }
        if assessment.degraded {
            return Err(DefenseError::StoreUnavailable(
                "fraud assessment unavailable".to_string(),
            ));
        }
        if assessment.risk_level.requires_lockout() {
            tracing::warn!(
                account,
                ip = %request.ip_address,
                risk = %assessment.risk_level,
                "Valid credentials refused on risk"
            );
            return Err(DefenseError::RiskThresholdExceeded(assessment.risk_level));
        }

        let session = self.sessions.create(account, request, credentials).await?;
        Ok(LoginOutcome::Authenticated {
            session,
            risk_level: assessment.risk_level,
        })
    }

    /// Issue a session for an identity verified elsewhere, refusing locked
    /// accounts and IPs
    pub async fn issue_session(
        &self,
        user_id: &str,
        request: &InboundRequest,
        credentials: &Credentials,
    ) -> Result<SessionRecord, DefenseError> {
        self.check_lockout(Some(user_id), &request.ip_address).await?;
        self.sessions.create(user_id, request, credentials).await
    }

    async fn check_lockout(&self, account: Option<&str>, ip: &str) -> Result<(), DefenseError> {
        match self.fraud.lockout_status(account, ip).await {
            LockoutStatus::Clear => Ok(()),
            LockoutStatus::Locked(record) => {
                tracing::info!(subject = %record.subject, ip, "Attempt refused by lockout");
                Err(DefenseError::AccountLocked {
                    until: record.expires_at,
                })
            }
            LockoutStatus::Unavailable(_) => Err(DefenseError::StoreUnavailable(
                "lockout state unavailable".to_string(),
            )),
        }
    }

    fn emit_rate_limited(&self, request: &InboundRequest, decision: &RateLimitDecision) {
        self.audit.emit(SecurityEvent::RateLimited {
            identity: request.identity().to_string(),
            ip: request.ip_address.clone(),
            endpoint: request.endpoint_path.clone(),
            scope: decision.scope,
            degraded: decision.degraded(),
            at: self.clock.now(),
        });
    }
}

/// HTTP status and deny reason for an error
pub fn status_for(error: &DefenseError) -> (StatusCode, DenyReason) {
    match error {
        DefenseError::CapacityExceeded { .. } => {
            (StatusCode::TOO_MANY_REQUESTS, DenyReason::RateLimited)
        }
        DefenseError::AccountLocked { .. } => (StatusCode::LOCKED, DenyReason::AccountLocked),
        DefenseError::RiskThresholdExceeded(_) => {
            (StatusCode::FORBIDDEN, DenyReason::RiskThresholdExceeded)
        }
        DefenseError::InvalidFingerprint(_) => {
            (StatusCode::FORBIDDEN, DenyReason::InvalidFingerprint)
        }
        DefenseError::IntegrityViolation => {
            (StatusCode::UNAUTHORIZED, DenyReason::IntegrityViolation)
        }
        DefenseError::SessionExpired(_) => (StatusCode::UNAUTHORIZED, DenyReason::SessionExpired),
        DefenseError::StoreUnavailable(_)
        | DefenseError::StoreTimeout(_)
        | DefenseError::Misconfigured(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, DenyReason::ServiceDegraded)
        }
    }
}

/// Seconds a caller should wait before retrying after `error`
pub fn retry_after_for(error: &DefenseError, now: chrono::DateTime<chrono::Utc>) -> Option<u64> {
    match error {
        DefenseError::CapacityExceeded { retry_after } => Some(retry_after.as_secs().max(1)),
        DefenseError::AccountLocked { until } => Some((*until - now).num_seconds().max(1) as u64),
        e if e.is_store_failure() => Some(DEGRADED_RETRY_AFTER.as_secs()),
        _ => None,
    }
}

/// Deny verdict for an error
pub fn deny_for(
    error: &DefenseError,
    mut headers: Vec<(String, String)>,
    now: chrono::DateTime<chrono::Utc>,
) -> Verdict {
    let (status, reason) = status_for(error);
    let retry_after = retry_after_for(error, now);
    if let Some(secs) = retry_after {
        headers.retain(|(name, _)| name != "Retry-After");
        headers.push(("Retry-After".to_string(), secs.to_string()));
    }
    Verdict::deny(status.as_u16(), reason, retry_after, headers)
}
