//! Layered rate limiting
//!
//! Uses the shared state store for distributed counters across nodes. Every
//! request increments one counter per (scope, identity, horizon):
//! - scopes: endpoint-specific, user (when authenticated), IP (always)
//! - horizons: 1 minute, 1 hour, 1 day
//!
//! A request is denied if any counter exceeds its capacity.

use super::access_list::{AccessCheck, AccessList};
use super::policy::{classify, normalize_path, EndpointCategory, FailureMode, SubjectClass};
use crate::clock::{chrono_duration, Clock};
use crate::config::RateLimitSettings;
use crate::error::DefenseError;
use crate::store::{Counter, StateStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use warden_common::{constants, InboundRequest, RateLimitScope};

/// Retry-after for blacklisted identities
const BLACKLIST_RETRY_AFTER: Duration = Duration::from_secs(constants::DAY_SECS);

/// Retry-after when a critical endpoint fails closed
const FAIL_CLOSED_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Synthetic quota reported while failing open
const DEGRADED_REMAINING: u32 = 1;

/// Time horizons, shortest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Horizon {
    Minute,
    Hour,
    Day,
}

impl Horizon {
    pub const ALL: [Horizon; 3] = [Horizon::Minute, Horizon::Hour, Horizon::Day];

    pub fn duration(&self) -> Duration {
        Duration::from_secs(match self {
            Horizon::Minute => constants::MINUTE_SECS,
            Horizon::Hour => constants::HOUR_SECS,
            Horizon::Day => constants::DAY_SECS,
        })
    }

    fn suffix(&self) -> &'static str {
        match self {
            Horizon::Minute => "1m",
            Horizon::Hour => "1h",
            Horizon::Day => "1d",
        }
    }
}

/// Who is being limited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub ip: String,
    /// Authenticated user id, `None` for anonymous callers
    pub user_id: Option<String>,
}

impl Identity {
    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_id: None,
        }
    }

    pub fn user(ip: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_id: Some(user_id.into()),
        }
    }

    pub fn from_request(request: &InboundRequest) -> Self {
        Self {
            ip: request.ip_address.clone(),
            user_id: request.user_id().map(str::to_string),
        }
    }

    /// The identity endpoint-scoped counters are keyed by
    fn principal(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.ip)
    }
}

/// How a decision was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionBasis {
    /// Counters were consulted
    Counted,
    Whitelisted,
    Blacklisted,
    /// The store was unreachable and the failure policy decided
    Degraded,
}

/// Result of a rate limit check
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Capacity of the reported window
    pub limit: u32,
    /// Remaining requests in the reported window
    pub remaining: u32,
    /// When the reported window resets
    pub reset_at: DateTime<Utc>,
    /// Scope of the reported window
    pub scope: RateLimitScope,
    /// How long to wait before retrying, on deny
    pub retry_after: Option<Duration>,
    pub basis: DecisionBasis,
}

impl RateLimitDecision {
    pub fn degraded(&self) -> bool {
        self.basis == DecisionBasis::Degraded
    }

    /// Create headers for the rate limit response
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit".to_string(), self.limit.to_string()),
            ("X-RateLimit-Remaining".to_string(), self.remaining.to_string()),
            ("X-RateLimit-Reset".to_string(), self.reset_at.timestamp().to_string()),
            ("X-RateLimit-Scope".to_string(), self.scope.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After".to_string(), retry_after.as_secs().max(1).to_string()));
        }
        if self.degraded() {
            headers.push(("X-RateLimit-Degraded".to_string(), "true".to_string()));
        }
        headers
    }
}

/// One counter consulted for a request
#[derive(Debug, Clone)]
struct Window {
    scope: RateLimitScope,
    key: String,
    limit: u32,
    horizon: Horizon,
}

/// Distributed rate limiter over the shared state store
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    access: AccessList,
    trusted: HashSet<String>,
}

impl RateLimiter {
    /// Build the limiter after a liveness probe of the store
    pub async fn init(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        settings: &RateLimitSettings,
    ) -> Result<Self, DefenseError> {
        store.ping().await?;
        Ok(Self {
            store,
            clock,
            access: AccessList::new(&settings.whitelist, &settings.blacklist),
            trusted: settings.trusted_accounts.clone(),
        })
    }

    fn subject_class(&self, identity: &Identity) -> SubjectClass {
        match &identity.user_id {
            Some(user) if self.trusted.contains(user) => SubjectClass::Trusted,
            Some(_) => SubjectClass::Authenticated,
            None => SubjectClass::Anonymous,
        }
    }

    /// Counters consulted for a request, most specific scope first
    fn windows(&self, identity: &Identity, endpoint: &str, category: EndpointCategory) -> Vec<Window> {
        let class = self.subject_class(identity);
        let path = normalize_path(endpoint);
        let mut scoped = vec![(
            RateLimitScope::Endpoint,
            format!("endpoint:{}:{}", path, identity.principal()),
            category.limits(class),
        )];
        if let Some(user) = &identity.user_id {
            scoped.push((
                RateLimitScope::User,
                format!("user:{}", user),
                EndpointCategory::Default.limits(class),
            ));
        }
        scoped.push((
            RateLimitScope::Ip,
            format!("ip:{}", identity.ip),
            EndpointCategory::Default.limits(class),
        ));

        let mut windows = Vec::with_capacity(scoped.len() * Horizon::ALL.len());
        for (scope, base, limits) in scoped {
            for horizon in Horizon::ALL {
                let limit = match horizon {
                    Horizon::Minute => limits.per_minute,
                    Horizon::Hour => limits.per_hour,
                    Horizon::Day => limits.per_day,
                };
                windows.push(Window {
                    scope,
                    key: format!("{}{}:{}", constants::RATE_LIMIT_PREFIX, base, horizon.suffix()),
                    limit,
                    horizon,
                });
            }
        }
        windows
    }

    /// Check and increment every counter that applies to this request
    pub async fn check(&self, identity: &Identity, endpoint: &str) -> RateLimitDecision {
        let now = self.clock.now();

        match self.access.check(&identity.ip, identity.user_id.as_deref()) {
            AccessCheck::Blacklisted(reason) => {
                tracing::warn!(ip = %identity.ip, endpoint, "Blacklisted identity denied: {}", reason.message());
                return RateLimitDecision {
                    allowed: false,
                    limit: 0,
                    remaining: 0,
                    reset_at: now + chrono_duration(BLACKLIST_RETRY_AFTER),
                    scope: if matches!(reason, super::access_list::BlockReason::ListedUser(_)) {
                        RateLimitScope::User
                    } else {
                        RateLimitScope::Ip
                    },
                    retry_after: Some(BLACKLIST_RETRY_AFTER),
                    basis: DecisionBasis::Blacklisted,
                };
            }
            AccessCheck::Whitelisted(entry) => {
                tracing::trace!(ip = %identity.ip, entry = %entry, "Whitelisted identity bypasses rate limits");
                return RateLimitDecision {
                    allowed: true,
                    limit: u32::MAX,
                    remaining: u32::MAX,
                    reset_at: now,
                    scope: RateLimitScope::Ip,
                    retry_after: None,
                    basis: DecisionBasis::Whitelisted,
                };
            }
            AccessCheck::Neutral => {}
        }

        let category = classify(endpoint);
        let windows = self.windows(identity, endpoint, category);
        let keys: Vec<(String, Duration)> = windows
            .iter()
            .map(|w| (w.key.clone(), w.horizon.duration()))
            .collect();

        match self.store.incr_with_expiry(&keys).await {
            Ok(counters) => {
                let decision = evaluate(&windows, &counters, now);
                if !decision.allowed {
                    tracing::info!(
                        ip = %identity.ip,
                        user = identity.user_id.as_deref().unwrap_or("-"),
                        endpoint,
                        scope = %decision.scope,
                        retry_after = decision.retry_after.map(|d| d.as_secs()).unwrap_or(0),
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => self.fallback(category, identity, endpoint, &e),
        }
    }

    /// Store outage policy for this endpoint category
    fn fallback(
        &self,
        category: EndpointCategory,
        identity: &Identity,
        endpoint: &str,
        error: &StoreError,
    ) -> RateLimitDecision {
        let now = self.clock.now();
        let mode = category.failure_mode();
        tracing::error!(
            severity = "critical",
            ip = %identity.ip,
            endpoint,
            category = category.as_str(),
            mode = ?mode,
            "Rate limiter store failure: {}",
            error
        );

        match mode {
            FailureMode::FailClosed => RateLimitDecision {
                allowed: false,
                limit: 0,
                remaining: 0,
                reset_at: now + chrono_duration(FAIL_CLOSED_RETRY_AFTER),
                scope: RateLimitScope::Endpoint,
                retry_after: Some(FAIL_CLOSED_RETRY_AFTER),
                basis: DecisionBasis::Degraded,
            },
            FailureMode::FailOpen => RateLimitDecision {
                allowed: true,
                limit: DEGRADED_REMAINING,
                remaining: DEGRADED_REMAINING,
                reset_at: now + chrono_duration(Horizon::Minute.duration()),
                scope: RateLimitScope::Endpoint,
                retry_after: None,
                basis: DecisionBasis::Degraded,
            },
        }
    }
}

/// Turn counter states into a decision.
///
/// On deny, report the exceeded window that resets last. On admit, report the
/// passing window with the fewest remaining requests.
fn evaluate(windows: &[Window], counters: &[Counter], now: DateTime<Utc>) -> RateLimitDecision {
    let paired = windows.iter().zip(counters.iter());

    let exceeded = paired
        .clone()
        .filter(|(w, c)| c.count > w.limit as u64)
        .max_by_key(|(_, c)| c.ttl_secs);

    if let Some((window, counter)) = exceeded {
        let retry_after = Duration::from_secs(counter.ttl_secs.max(1));
        return RateLimitDecision {
            allowed: false,
            limit: window.limit,
            remaining: 0,
            reset_at: now + chrono_duration(retry_after),
            scope: window.scope,
            retry_after: Some(retry_after),
            basis: DecisionBasis::Counted,
        };
    }

    let tightest = paired.min_by_key(|(w, c)| (w.limit as u64 - c.count, c.ttl_secs));
    match tightest {
        Some((window, counter)) => RateLimitDecision {
            allowed: true,
            limit: window.limit,
            remaining: (window.limit as u64 - counter.count) as u32,
            reset_at: now + chrono_duration(Duration::from_secs(counter.ttl_secs)),
            scope: window.scope,
            retry_after: None,
            basis: DecisionBasis::Counted,
        },
        None => RateLimitDecision {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_at: now,
            scope: RateLimitScope::Ip,
            retry_after: None,
            basis: DecisionBasis::Counted,
        },
    }
}
