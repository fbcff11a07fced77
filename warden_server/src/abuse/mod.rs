//! Abuse prevention module
//!
//! Provides protection against:
//! - Request floods (layered rate limiting per endpoint, user and IP)
//! - Known-bad callers (static blacklist) and trusted callers (whitelist)
//! - Brute force during store outages (fail-closed policy table)

pub mod access_list;
pub mod policy;
pub mod rate_limit;

pub use policy::{classify, EndpointCategory, FailureMode};
pub use rate_limit::{DecisionBasis, Identity, RateLimitDecision, RateLimiter};
