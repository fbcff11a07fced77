//! Structured audit events
//!
//! The pipeline emits events but does not own their delivery: every event is
//! written to the `warden::audit` tracing target and broadcast to any
//! in-process subscriber (forwarders, tests).

use tokio::sync::broadcast;
use warden_common::{RiskLevel, SecurityEvent};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct AuditLog {
    tx: broadcast::Sender<SecurityEvent>,
}

impl AuditLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SecurityEvent) {
        let payload = event.to_json().unwrap_or_default();

        match severity(&event) {
            Severity::High => {
                tracing::error!(target: "warden::audit", event = event.name(), %payload, "audit")
            }
            Severity::Elevated => {
                tracing::warn!(target: "warden::audit", event = event.name(), %payload, "audit")
            }
            Severity::Normal => {
                tracing::info!(target: "warden::audit", event = event.name(), %payload, "audit")
            }
        }

        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

enum Severity {
    Normal,
    Elevated,
    High,
}

fn severity(event: &SecurityEvent) -> Severity {
    match event {
        SecurityEvent::IntegrityViolation { .. } => Severity::High,
        SecurityEvent::AccountLocked { .. } => Severity::Elevated,
        SecurityEvent::FraudAlertRaised { risk_level, .. } => match risk_level {
            RiskLevel::High | RiskLevel::Critical => Severity::High,
            RiskLevel::Medium => Severity::Elevated,
            RiskLevel::Low => Severity::Normal,
        },
        SecurityEvent::RateLimited { degraded: true, .. } => Severity::Elevated,
        SecurityEvent::LoginFailure { .. }
        | SecurityEvent::LoginSuccess { .. }
        | SecurityEvent::RateLimited { .. }
        | SecurityEvent::SessionCreated { .. }
        | SecurityEvent::SessionInvalidated { .. } => Severity::Normal,
    }
}
