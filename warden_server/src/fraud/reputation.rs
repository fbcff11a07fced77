//! Decaying IP reputation
//!
//! A score per IP that grows with every medium-or-worse assessment and halves
//! every 24 hours. Unknown IPs start neutral at 0.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_common::RiskLevel;

/// Hours for a score to decay to half its value
const HALF_LIFE_HOURS: f64 = 24.0;

/// Scores below this are treated as fully decayed
const FLOOR: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reputation {
    pub score: f64,
    pub updated_at: DateTime<Utc>,
}

impl Reputation {
    pub fn neutral(now: DateTime<Utc>) -> Self {
        Self {
            score: 0.0,
            updated_at: now,
        }
    }

    /// Score as of `now`
    pub fn decayed(&self, now: DateTime<Utc>) -> f64 {
        let hours = (now - self.updated_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
        let score = self.score * 0.5f64.powf(hours / HALF_LIFE_HOURS);
        if score < FLOOR {
            0.0
        } else {
            score
        }
    }

    /// Decay to `now`, then add the increment for an assessment at `level`
    pub fn bumped(&self, level: RiskLevel, now: DateTime<Utc>) -> Self {
        Self {
            score: self.decayed(now) + increment(level),
            updated_at: now,
        }
    }
}

fn increment(level: RiskLevel) -> f64 {
    match level {
        RiskLevel::Low => 0.0,
        RiskLevel::Medium => 5.0,
        RiskLevel::High => 10.0,
        RiskLevel::Critical => 20.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_half_life() {
        let rep = Reputation {
            score: 40.0,
            updated_at: t0(),
        };
        assert_eq!(rep.decayed(t0()), 40.0);
        assert!((rep.decayed(t0() + Duration::hours(24)) - 20.0).abs() < 1e-9);
        assert!((rep.decayed(t0() + Duration::hours(48)) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_bump_applies_decay_first() {
        let rep = Reputation {
            score: 20.0,
            updated_at: t0(),
        };
        let bumped = rep.bumped(RiskLevel::Critical, t0() + Duration::hours(24));
        assert!((bumped.score - 30.0).abs() < 1e-9);
        assert_eq!(bumped.updated_at, t0() + Duration::hours(24));
    }

    #[test]
    fn test_neutral_and_floor() {
        assert_eq!(Reputation::neutral(t0()).decayed(t0()), 0.0);
        let tiny = Reputation {
            score: 5.0,
            updated_at: t0(),
        };
        assert_eq!(tiny.decayed(t0() + Duration::days(30)), 0.0);
        assert_eq!(tiny.bumped(RiskLevel::Low, t0()).score, 5.0);
    }
}
