//! Risk signal scoring
//!
//! Each signal maps a count from recent history onto a [`RiskLevel`]. The
//! signals are combined into one aggregate level by a weighted blend of the
//! single worst signal and the mean of all signals.

use serde::Serialize;
use serde_json::json;
use warden_common::{RiskLevel, SignalType};

/// Failed attempts per IP in the last hour: (medium, high, critical)
const IP_FAILURE_THRESHOLDS: (usize, usize, usize) = (5, 10, 20);

/// Failed attempts per account in the last hour: (medium, critical)
const ACCOUNT_FAILURE_THRESHOLDS: (usize, usize) = (3, 5);

/// Attempts per IP in the 5-minute tail: (medium, high, critical)
const BURST_THRESHOLDS: (usize, usize, usize) = (8, 15, 30);

/// Reputation score: (medium, high, critical)
const REPUTATION_THRESHOLDS: (f64, f64, f64) = (10.0, 25.0, 50.0);

/// One evaluated signal
#[derive(Debug, Clone, Serialize)]
pub struct RiskSignal {
    pub signal_type: SignalType,
    pub risk_level: RiskLevel,
    pub details: serde_json::Value,
}

/// Blend weights for the aggregate risk level
#[derive(Debug, Clone, Copy)]
pub struct RiskWeights {
    pub max_weight: f64,
    pub mean_weight: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            max_weight: 0.7,
            mean_weight: 0.3,
        }
    }
}

pub fn ip_failure_level(failures: usize) -> RiskLevel {
    let (medium, high, critical) = IP_FAILURE_THRESHOLDS;
    if failures >= critical {
        RiskLevel::Critical
    } else if failures >= high {
        RiskLevel::High
    } else if failures >= medium {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

pub fn account_failure_level(failures: usize) -> RiskLevel {
    let (medium, critical) = ACCOUNT_FAILURE_THRESHOLDS;
    if failures >= critical {
        RiskLevel::Critical
    } else if failures >= medium {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Failure velocity by IP and by account, each against its own threshold
pub fn login_failure(ip_failures: usize, account_failures: Option<usize>) -> RiskSignal {
    let ip_level = ip_failure_level(ip_failures);
    let account_level = account_failures
        .map(account_failure_level)
        .unwrap_or(RiskLevel::Low);

    RiskSignal {
        signal_type: SignalType::LoginFailure,
        risk_level: ip_level.max(account_level),
        details: json!({
            "ip_failures": ip_failures,
            "ip_level": ip_level,
            "account_failures": account_failures,
            "account_level": account_level,
        }),
    }
}

pub fn request_burst(attempts: usize) -> RiskSignal {
    let (medium, high, critical) = BURST_THRESHOLDS;
    let risk_level = if attempts >= critical {
        RiskLevel::Critical
    } else if attempts >= high {
        RiskLevel::High
    } else if attempts >= medium {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    RiskSignal {
        signal_type: SignalType::RequestBurst,
        risk_level,
        details: json!({ "attempts_5m": attempts }),
    }
}

/// Too many accounts or IPs behind one device fingerprint
pub fn device_anomaly(
    distinct_accounts: usize,
    distinct_ips: usize,
    account_limit: usize,
    ip_limit: usize,
) -> RiskSignal {
    let account_level = if distinct_accounts > account_limit * 2 {
        RiskLevel::Critical
    } else if distinct_accounts > account_limit {
        RiskLevel::High
    } else {
        RiskLevel::Low
    };
    let ip_level = if distinct_ips > ip_limit * 2 {
        RiskLevel::High
    } else if distinct_ips > ip_limit {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    RiskSignal {
        signal_type: SignalType::DeviceAnomaly,
        risk_level: account_level.max(ip_level),
        details: json!({
            "distinct_accounts": distinct_accounts,
            "distinct_ips": distinct_ips,
        }),
    }
}

pub fn ip_reputation(score: f64) -> RiskSignal {
    let (medium, high, critical) = REPUTATION_THRESHOLDS;
    let risk_level = if score >= critical {
        RiskLevel::Critical
    } else if score >= high {
        RiskLevel::High
    } else if score >= medium {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    RiskSignal {
        signal_type: SignalType::IpReputation,
        risk_level,
        details: json!({ "score": (score * 100.0).round() / 100.0 }),
    }
}

/// Aggregate risk: `max_weight * worst + mean_weight * mean`, bucketed.
///
/// With the default 0.7/0.3 blend one critical signal still buckets as
/// critical when everything else is calm.
pub fn combine(signals: &[RiskSignal], weights: RiskWeights) -> RiskLevel {
    if signals.is_empty() {
        return RiskLevel::Low;
    }

    let scores: Vec<f64> = signals.iter().map(|s| s.risk_level.score()).collect();
    let max = scores.iter().cloned().fold(f64::MIN, f64::max);
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;

    RiskLevel::from_score(weights.max_weight * max + weights.mean_weight * mean)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(levels: &[RiskLevel]) -> Vec<RiskSignal> {
        levels
            .iter()
            .zip(SignalType::ALL)
            .map(|(level, signal_type)| RiskSignal {
                signal_type,
                risk_level: *level,
                details: serde_json::Value::Null,
            })
            .collect()
    }

    #[test]
    fn test_single_critical_dominates() {
        let signals = levels(&[RiskLevel::Critical, RiskLevel::Low, RiskLevel::Low, RiskLevel::Low]);
        assert_eq!(combine(&signals, RiskWeights::default()), RiskLevel::Critical);
    }

    #[test]
    fn test_single_high_stays_high() {
        let signals = levels(&[RiskLevel::Low, RiskLevel::High, RiskLevel::Low, RiskLevel::Low]);
        assert_eq!(combine(&signals, RiskWeights::default()), RiskLevel::High);
    }

    #[test]
    fn test_mediums_escalate_from_low() {
        let calm = levels(&[RiskLevel::Low; 4]);
        assert_eq!(combine(&calm, RiskWeights::default()), RiskLevel::Low);

        let mediums = levels(&[RiskLevel::Medium, RiskLevel::Medium, RiskLevel::Medium, RiskLevel::Low]);
        assert_eq!(combine(&mediums, RiskWeights::default()), RiskLevel::Medium);
    }

    #[test]
    fn test_weights_are_tunable() {
        let signals = levels(&[RiskLevel::Critical, RiskLevel::Low, RiskLevel::Low, RiskLevel::Low]);
        let mean_only = RiskWeights {
            max_weight: 0.0,
            mean_weight: 1.0,
        };
        // Mean of (1.0, 0.25, 0.25, 0.25) = 0.4375
        assert_eq!(combine(&signals, mean_only), RiskLevel::Medium);
    }

    #[test]
    fn test_account_threshold_stricter_than_ip() {
        assert_eq!(account_failure_level(5), RiskLevel::Critical);
        assert_eq!(ip_failure_level(5), RiskLevel::Medium);
        assert_eq!(login_failure(5, Some(5)).risk_level, RiskLevel::Critical);
        assert_eq!(login_failure(5, None).risk_level, RiskLevel::Medium);
        assert_eq!(login_failure(20, Some(0)).risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_device_anomaly_levels() {
        assert_eq!(device_anomaly(1, 1, 3, 5).risk_level, RiskLevel::Low);
        assert_eq!(device_anomaly(4, 1, 3, 5).risk_level, RiskLevel::High);
        assert_eq!(device_anomaly(7, 1, 3, 5).risk_level, RiskLevel::Critical);
        assert_eq!(device_anomaly(1, 6, 3, 5).risk_level, RiskLevel::Medium);
        assert_eq!(device_anomaly(1, 11, 3, 5).risk_level, RiskLevel::High);
    }

    #[test]
    fn test_burst_and_reputation_levels() {
        assert_eq!(request_burst(7).risk_level, RiskLevel::Low);
        assert_eq!(request_burst(30).risk_level, RiskLevel::Critical);
        assert_eq!(ip_reputation(0.0).risk_level, RiskLevel::Low);
        assert_eq!(ip_reputation(26.0).risk_level, RiskLevel::High);
    }
}
