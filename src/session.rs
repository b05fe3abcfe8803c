//! Session state: identity, TTLs, and resource quota accounting.
//!
//! A session is an isolated workspace with its own records and indexes. All
//! durations are nanoseconds; 0 means "no limit". Quota checks are pre-flight
//! (callers check before mutating), so a failed mutation leaves counters
//! untouched.

use serde::{Deserialize, Serialize};

use crate::error::{GibramError, Result};
use crate::types::now_nanos;

/// Quota caps for a session. Zero disables the corresponding cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionQuotas {
    pub max_entities: u64,
    pub max_relationships: u64,
    pub max_documents: u64,
    pub max_memory_bytes: u64,
}

/// Mutable per-session bookkeeping, kept under the engine's session guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Unix nanos.
    pub created_at: i64,
    /// Unix nanos, refreshed by every operation touching the session.
    pub last_access: i64,
    /// Absolute TTL in nanos from creation; 0 = never.
    pub ttl: i64,
    /// Idle TTL in nanos from last access; 0 = never.
    pub idle_ttl: i64,
    pub quotas: SessionQuotas,

    pub document_count: u64,
    pub text_unit_count: u64,
    pub entity_count: u64,
    pub relationship_count: u64,
    pub community_count: u64,
    pub memory_bytes: u64,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = now_nanos();
        Self {
            id: id.into(),
            created_at: now,
            last_access: now,
            ttl: 0,
            idle_ttl: 0,
            quotas: SessionQuotas::default(),
            document_count: 0,
            text_unit_count: 0,
            entity_count: 0,
            relationship_count: 0,
            community_count: 0,
            memory_bytes: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_access = now_nanos();
    }

    /// True when either the absolute or idle TTL deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_nanos())
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        if self.ttl > 0 && self.created_at + self.ttl < now {
            return true;
        }
        if self.idle_ttl > 0 && self.last_access + self.idle_ttl < now {
            return true;
        }
        false
    }

    /// Next expiry deadline in nanos: the earlier of the absolute and idle
    /// deadlines, or 0 when the session never expires.
    pub fn expire_at(&self) -> i64 {
        let mut expire_at = 0i64;
        if self.ttl > 0 {
            expire_at = self.created_at + self.ttl;
        }
        if self.idle_ttl > 0 {
            let idle_deadline = self.last_access + self.idle_ttl;
            if expire_at == 0 || idle_deadline < expire_at {
                expire_at = idle_deadline;
            }
        }
        expire_at
    }

    /// Remaining nanos until expiry, clamped at 0; -1 when never.
    pub fn ttl_remaining(&self) -> i64 {
        let expire_at = self.expire_at();
        if expire_at == 0 {
            return -1;
        }
        (expire_at - now_nanos()).max(0)
    }

    // ------------------------------------------------------------------
    // Quota pre-checks. `delta` is the number of records about to be added.
    // ------------------------------------------------------------------

    pub fn check_entity_quota(&self, delta: u64) -> Result<()> {
        let max = self.quotas.max_entities;
        if max > 0 && self.entity_count + delta > max {
            return Err(GibramError::EntityQuotaExceeded {
                current: self.entity_count,
                delta,
                max,
            });
        }
        Ok(())
    }

    pub fn check_relationship_quota(&self, delta: u64) -> Result<()> {
        let max = self.quotas.max_relationships;
        if max > 0 && self.relationship_count + delta > max {
            return Err(GibramError::RelationshipQuotaExceeded {
                current: self.relationship_count,
                delta,
                max,
            });
        }
        Ok(())
    }

    pub fn check_document_quota(&self, delta: u64) -> Result<()> {
        let max = self.quotas.max_documents;
        if max > 0 && self.document_count + delta > max {
            return Err(GibramError::DocumentQuotaExceeded {
                current: self.document_count,
                delta,
                max,
            });
        }
        Ok(())
    }

    pub fn check_memory_quota(&self, delta_bytes: u64) -> Result<()> {
        let max = self.quotas.max_memory_bytes;
        if max > 0 && self.memory_bytes + delta_bytes > max {
            return Err(GibramError::MemoryQuotaExceeded {
                current: self.memory_bytes,
                delta: delta_bytes,
                max,
            });
        }
        Ok(())
    }

    pub fn add_memory(&mut self, bytes: u64) {
        self.memory_bytes += bytes;
    }

    pub fn sub_memory(&mut self, bytes: u64) {
        self.memory_bytes = self.memory_bytes.saturating_sub(bytes);
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            last_access: self.last_access,
            ttl: self.ttl,
            idle_ttl: self.idle_ttl,
            document_count: self.document_count,
            text_unit_count: self.text_unit_count,
            entity_count: self.entity_count,
            relationship_count: self.relationship_count,
            community_count: self.community_count,
            memory_bytes: self.memory_bytes,
            quotas: self.quotas,
        }
    }
}

/// Read-only session metadata returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: i64,
    pub last_access: i64,
    pub ttl: i64,
    pub idle_ttl: i64,
    pub document_count: u64,
    pub text_unit_count: u64,
    pub entity_count: u64,
    pub relationship_count: u64,
    pub community_count: u64,
    pub memory_bytes: u64,
    pub quotas: SessionQuotas,
}
