//! Session lifecycle management
//!
//! Sessions are JSON records in the state store, bound to a device
//! fingerprint and sealed with an HMAC over their identifying fields. Two
//! sorted-set indexes (per user, per device) are scored by creation time so
//! the oldest session is the first one evicted at the concurrency ceiling.
//!
//! Every terminal transition (idle, absolute, revoked, evicted, tampered)
//! deletes the record and its index entries.

pub mod fingerprint;
pub mod integrity;

use crate::audit::AuditLog;
use crate::clock::{chrono_duration, Clock};
use crate::config::SessionSettings;
use crate::error::DefenseError;
use crate::store::{StateStore, StoreError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use integrity::IntegrityKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use warden_common::{constants, InboundRequest, RiskLevel, SecurityEvent, SessionState};

/// Random bytes in a session id
const SESSION_ID_BYTES: usize = 32;

/// Unpadded base64url length of a session id
const SESSION_ID_LEN: usize = 43;

/// Records outlive their absolute bound briefly so expiry is classified by
/// the manager rather than silently dropped by the store
const RECORD_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub device_fingerprint: String,
    pub ip_address: String,
    pub auth_method: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Absolute bound, fixed at creation
    pub expires_at: DateTime<Utc>,
    pub integrity_hash: String,
}

impl SessionRecord {
    /// Live state: created until the first validated access, then active
    pub fn state(&self) -> SessionState {
        if self.last_activity_at == self.created_at {
            SessionState::Created
        } else {
            SessionState::Active
        }
    }

    /// First violated bound as of `now`, if any
    fn expiry(&self, now: DateTime<Utc>, idle_timeout: Duration) -> Option<SessionState> {
        if now >= self.expires_at {
            Some(SessionState::AbsoluteExpired)
        } else if now >= self.last_activity_at + chrono_duration(idle_timeout) {
            Some(SessionState::IdleExpired)
        } else {
            None
        }
    }
}

/// What the upstream credential check established
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// e.g. `password`, `oauth`, `sso`
    pub auth_method: String,
}

fn session_key(session_id: &str) -> String {
    format!("{}{}", constants::SESSION_PREFIX, session_id)
}

fn user_index_key(user_id: &str) -> String {
    format!("{}{}", constants::USER_SESSIONS_PREFIX, user_id)
}

fn device_index_key(fingerprint: &str) -> String {
    format!("{}{}", constants::DEVICE_SESSIONS_PREFIX, fingerprint)
}

fn new_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Whether `session_id` has the shape of an id issued by `new_session_id`
fn is_well_formed(session_id: &str) -> bool {
    session_id.len() == SESSION_ID_LEN
        && session_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Outcome of reading a session record
enum Lookup {
    Missing,
    Found(SessionRecord),
    /// Present but unparseable or failing its integrity check
    Tampered(Option<SessionRecord>),
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    integrity: IntegrityKey,
    settings: SessionSettings,
}

impl SessionManager {
    /// Build the manager after a liveness probe of the store
    pub async fn init(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        audit: AuditLog,
        settings: SessionSettings,
    ) -> Result<Self, DefenseError> {
        let integrity = IntegrityKey::new(&settings.secret)
            .map_err(|e| DefenseError::Misconfigured(format!("session secret: {}", e)))?;
        store.ping().await?;
        Ok(Self {
            store,
            clock,
            audit,
            integrity,
            settings,
        })
    }

    /// Issue a session bound to the requesting device, evicting the user's
    /// oldest sessions first if they are at the ceiling
    pub async fn create(
        &self,
        user_id: &str,
        request: &InboundRequest,
        credentials: &Credentials,
    ) -> Result<SessionRecord, DefenseError> {
        let device = fingerprint::derive(request).map_err(|e| {
            tracing::warn!(user_id, ip = %request.ip_address, "Session refused: {}", e);
            DefenseError::InvalidFingerprint(e.to_string())
        })?;
        tracing::debug!(user_id, entropy_bits = device.entropy_bits, "Device fingerprint derived");

        let mut live = self.list(user_id).await?;
        while live.len() >= self.settings.max_concurrent {
            let oldest = live.remove(0);
            tracing::info!(
                user_id,
                session_id = %oldest.session_id,
                max = self.settings.max_concurrent,
                "Evicting oldest session at concurrency ceiling"
            );
            self.terminate(&oldest, SessionState::Evicted).await?;
        }

        let now = self.clock.now();
        let session_id = new_session_id();
        let record = SessionRecord {
            integrity_hash: self.integrity.sign(&session_id, user_id, &device.hash),
            session_id,
            user_id: user_id.to_string(),
            device_fingerprint: device.hash,
            ip_address: request.ip_address.clone(),
            auth_method: credentials.auth_method.clone(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + chrono_duration(self.settings.absolute_timeout),
        };

        let ttl = self.settings.absolute_timeout + RECORD_GRACE;
        self.save(&record, ttl).await?;
        let score = now.timestamp_millis() as f64;
        self.store
            .zadd(&user_index_key(user_id), score, &record.session_id, ttl)
            .await?;
        self.store
            .zadd(&device_index_key(&record.device_fingerprint), score, &record.session_id, ttl)
            .await?;

        tracing::info!(user_id, session_id = %record.session_id, auth_method = %record.auth_method, "Session created");
        self.audit.emit(SecurityEvent::SessionCreated {
            session_id: record.session_id.clone(),
            user_id: record.user_id.clone(),
            ip: record.ip_address.clone(),
            at: now,
        });
        Ok(record)
    }

    /// Check integrity and both timeouts, then refresh the idle clock
    pub async fn validate(&self, session_id: &str) -> Result<SessionRecord, DefenseError> {
        let mut record = match self.lookup(session_id).await? {
            Lookup::Found(record) => record,
            Lookup::Missing => return Err(DefenseError::SessionExpired(SessionState::Revoked)),
            Lookup::Tampered(record) => {
                self.reject_tampered(session_id, record).await?;
                return Err(DefenseError::IntegrityViolation);
            }
        };

        let now = self.clock.now();
        if let Some(state) = record.expiry(now, self.settings.idle_timeout) {
            self.terminate(&record, state).await?;
            return Err(DefenseError::SessionExpired(state));
        }

        // Only refresh a record that still exists, so a concurrent revoke wins
        record.last_activity_at = now;
        let remaining = (record.expires_at - now).to_std().unwrap_or_default();
        if !self.refresh(&record, remaining + RECORD_GRACE).await? {
            tracing::info!(session_id, "Session revoked during validation");
            return Err(DefenseError::SessionExpired(SessionState::Revoked));
        }
        Ok(record)
    }

    /// Revoke one session. Returns whether it existed.
    pub async fn invalidate(&self, session_id: &str) -> Result<bool, DefenseError> {
        match self.lookup(session_id).await? {
            Lookup::Found(record) => {
                self.terminate(&record, SessionState::Revoked).await?;
                Ok(true)
            }
            Lookup::Tampered(record) => {
                self.reject_tampered(session_id, record).await?;
                Ok(true)
            }
            Lookup::Missing => Ok(false),
        }
    }

    /// Revoke every session of a user. Returns how many were revoked.
    pub async fn invalidate_all(&self, user_id: &str) -> Result<usize, DefenseError> {
        let sessions = self.list(user_id).await?;
        for record in &sessions {
            self.terminate(record, SessionState::Revoked).await?;
        }
        self.store.del(&user_index_key(user_id)).await?;

        tracing::info!(user_id, count = sessions.len(), "All sessions revoked");
        Ok(sessions.len())
    }

    /// Live sessions of a user, oldest first. Stale index entries and
    /// sessions past a bound are cleaned up on the way.
    pub async fn list(&self, user_id: &str) -> Result<Vec<SessionRecord>, DefenseError> {
        let index = user_index_key(user_id);
        self.live_sessions(&index).await
    }

    /// Live sessions bound to a device fingerprint, oldest first
    pub async fn sessions_for_device(
        &self,
        fingerprint: &str,
    ) -> Result<Vec<SessionRecord>, DefenseError> {
        let index = device_index_key(fingerprint);
        self.live_sessions(&index).await
    }

    async fn live_sessions(&self, index: &str) -> Result<Vec<SessionRecord>, DefenseError> {
        let now = self.clock.now();
        let ids = self
            .store
            .zrange_by_score(index, f64::NEG_INFINITY, f64::INFINITY)
            .await?;

        let mut live = Vec::with_capacity(ids.len());
        for (session_id, _) in ids {
            match self.lookup(&session_id).await? {
                Lookup::Found(record) => match record.expiry(now, self.settings.idle_timeout) {
                    Some(state) => self.terminate(&record, state).await?,
                    None => live.push(record),
                },
                Lookup::Tampered(record) => self.reject_tampered(&session_id, record).await?,
                Lookup::Missing => {
                    tracing::debug!(index, session_id = %session_id, "Pruning stale index entry");
                    self.store.zrem(index, &session_id).await?;
                }
            }
        }
        Ok(live)
    }

    async fn lookup(&self, session_id: &str) -> Result<Lookup, StoreError> {
        if !is_well_formed(session_id) {
            tracing::debug!("Ignoring malformed session id");
            return Ok(Lookup::Missing);
        }
        let Some(raw) = self.store.get(&session_key(session_id)).await? else {
            return Ok(Lookup::Missing);
        };

        let record: SessionRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(session_id, "Unreadable session record: {}", e);
                return Ok(Lookup::Tampered(None));
            }
        };

        let intact = record.session_id == session_id
            && self.integrity.verify(
                session_id,
                &record.user_id,
                &record.device_fingerprint,
                &record.integrity_hash,
            );
        if intact {
            Ok(Lookup::Found(record))
        } else {
            Ok(Lookup::Tampered(Some(record)))
        }
    }

    async fn save(&self, record: &SessionRecord, ttl: Duration) -> Result<(), StoreError> {
        let (key, raw) = encode(record)?;
        self.store.set_ex(&key, &raw, ttl).await
    }

    /// Rewrite an existing record. Returns false if it was deleted meanwhile.
    async fn refresh(&self, record: &SessionRecord, ttl: Duration) -> Result<bool, StoreError> {
        let (key, raw) = encode(record)?;
        self.store.replace_ex(&key, &raw, ttl).await
    }

    /// Delete a record and its index entries, and announce the transition
    async fn terminate(&self, record: &SessionRecord, state: SessionState) -> Result<(), StoreError> {
        self.store.del(&session_key(&record.session_id)).await?;
        self.store
            .zrem(&user_index_key(&record.user_id), &record.session_id)
            .await?;
        self.store
            .zrem(&device_index_key(&record.device_fingerprint), &record.session_id)
            .await?;

        tracing::info!(
            user_id = %record.user_id,
            session_id = %record.session_id,
            state = %state,
            "Session ended"
        );
        self.audit.emit(SecurityEvent::SessionInvalidated {
            session_id: record.session_id.clone(),
            user_id: record.user_id.clone(),
            state,
            at: self.clock.now(),
        });
        Ok(())
    }

    /// Drop a record that failed its integrity check
    async fn reject_tampered(
        &self,
        session_id: &str,
        record: Option<SessionRecord>,
    ) -> Result<(), StoreError> {
        self.store.del(&session_key(session_id)).await?;
        let user_id = record
            .as_ref()
            .map(|r| r.user_id.clone())
            .unwrap_or_default();
        if let Some(record) = &record {
            // A forged record may name the wrong indexes; the real ones are
            // pruned lazily on the next listing
            self.store.zrem(&user_index_key(&record.user_id), session_id).await?;
            self.store
                .zrem(&device_index_key(&record.device_fingerprint), session_id)
                .await?;
        }

        tracing::error!(session_id, user_id = %user_id, "Session integrity violation");
        self.audit.emit(SecurityEvent::IntegrityViolation {
            session_id: session_id.to_string(),
            user_id,
            risk_level: RiskLevel::High,
            at: self.clock.now(),
        });
        Ok(())
    }
}

fn encode(record: &SessionRecord) -> Result<(String, String), StoreError> {
    let key = session_key(&record.session_id);
    let raw = serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
        key: key.clone(),
        reason: e.to_string(),
    })?;
    Ok((key, raw))
}
