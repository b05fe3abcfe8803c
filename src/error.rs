//! Error taxonomy for the engine.
//!
//! Every error carries a stable numeric [`ErrorCode`] so the transport layer
//! can map failures onto wire status codes without string matching. Codes are
//! grouped by range: client 1xxx, server 2xxx, data 3xxx, quota 4xxx,
//! session 5xxx.

use thiserror::Error;

/// Stable error code, grouped by thousand-range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // Client errors (1xxx)
    BadRequest = 1000,
    NotFound = 1003,
    Conflict = 1004,
    PayloadTooLarge = 1006,
    InvalidInput = 1007,

    // Server errors (2xxx)
    Internal = 2000,
    Unavailable = 2001,
    Timeout = 2002,
    ShuttingDown = 2003,

    // Data errors (3xxx)
    InvalidVector = 3000,
    CorruptedData = 3003,
    ChecksumMismatch = 3008,
    WalCorrupt = 3009,
    SnapshotCorrupt = 3010,

    // Quota errors (4xxx)
    EntityQuotaExceeded = 4000,
    RelationshipQuotaExceeded = 4001,
    DocumentQuotaExceeded = 4002,
    MemoryQuotaExceeded = 4003,

    // Session errors (5xxx)
    SessionNotFound = 5000,
    SessionExpired = 5001,
    SessionLimitExceeded = 5002,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ErrorCode::InvalidVector => "INVALID_VECTOR",
            ErrorCode::CorruptedData => "CORRUPTED_DATA",
            ErrorCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ErrorCode::WalCorrupt => "WAL_CORRUPT",
            ErrorCode::SnapshotCorrupt => "SNAPSHOT_CORRUPT",
            ErrorCode::EntityQuotaExceeded => "ENTITY_QUOTA_EXCEEDED",
            ErrorCode::RelationshipQuotaExceeded => "RELATIONSHIP_QUOTA_EXCEEDED",
            ErrorCode::DocumentQuotaExceeded => "DOCUMENT_QUOTA_EXCEEDED",
            ErrorCode::MemoryQuotaExceeded => "MEMORY_QUOTA_EXCEEDED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::SessionLimitExceeded => "SESSION_LIMIT_EXCEEDED",
        }
    }

    /// True for 1xxx codes.
    pub fn is_client(&self) -> bool {
        let v = *self as u16;
        (1000..2000).contains(&v)
    }

    /// True for 4xxx codes. Quota failures must never be auto-retried.
    pub fn is_quota(&self) -> bool {
        let v = *self as u16;
        (4000..5000).contains(&v)
    }
}

/// Engine error: a stable code, a message, and optional structured context
/// (`resource` / `id`) for client diagnosis.
#[derive(Debug, Clone, Error)]
pub enum GibramError {
    #[error("[NOT_FOUND] {resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("[CONFLICT] {0}")]
    Conflict(String),

    #[error("[INVALID_INPUT] {0}")]
    InvalidInput(String),

    #[error("[PAYLOAD_TOO_LARGE] {0}")]
    PayloadTooLarge(String),

    #[error("[INVALID_VECTOR] dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("[INVALID_VECTOR] {0}")]
    InvalidVector(String),

    #[error("[CORRUPTED_DATA] {0}")]
    CorruptedData(String),

    #[error("[CHECKSUM_MISMATCH] stored {stored:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { stored: u64, computed: u64 },

    #[error("[WAL_CORRUPT] {0}")]
    WalCorrupt(String),

    #[error("[SNAPSHOT_CORRUPT] {0}")]
    SnapshotCorrupt(String),

    #[error("[ENTITY_QUOTA_EXCEEDED] entity quota exceeded: {current} + {delta} > {max}")]
    EntityQuotaExceeded { current: u64, delta: u64, max: u64 },

    #[error("[RELATIONSHIP_QUOTA_EXCEEDED] relationship quota exceeded: {current} + {delta} > {max}")]
    RelationshipQuotaExceeded { current: u64, delta: u64, max: u64 },

    #[error("[DOCUMENT_QUOTA_EXCEEDED] document quota exceeded: {current} + {delta} > {max}")]
    DocumentQuotaExceeded { current: u64, delta: u64, max: u64 },

    #[error("[MEMORY_QUOTA_EXCEEDED] memory quota exceeded: {current} + {delta} > {max} bytes")]
    MemoryQuotaExceeded { current: u64, delta: u64, max: u64 },

    #[error("[SESSION_NOT_FOUND] session not found: {0}")]
    SessionNotFound(String),

    #[error("[SESSION_EXPIRED] session expired: {0}")]
    SessionExpired(String),

    #[error("[SESSION_LIMIT_EXCEEDED] session limit reached: {0}")]
    SessionLimitExceeded(usize),

    #[error("[NOT_FOUND] task not found: {0}")]
    TaskNotFound(String),

    #[error("[TIMEOUT] {0}")]
    Timeout(String),

    #[error("[UNAVAILABLE] {0}")]
    Unavailable(String),

    #[error("[SHUTTING_DOWN] {0}")]
    ShuttingDown(&'static str),

    #[error("[INTERNAL] {0}")]
    Internal(String),

    #[error("[INTERNAL] io: {0}")]
    Io(String),
}

impl GibramError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GibramError::NotFound { .. } | GibramError::TaskNotFound(_) => ErrorCode::NotFound,
            GibramError::Conflict(_) => ErrorCode::Conflict,
            GibramError::InvalidInput(_) => ErrorCode::InvalidInput,
            GibramError::PayloadTooLarge(_) => ErrorCode::PayloadTooLarge,
            GibramError::DimensionMismatch { .. } | GibramError::InvalidVector(_) => {
                ErrorCode::InvalidVector
            }
            GibramError::CorruptedData(_) => ErrorCode::CorruptedData,
            GibramError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            GibramError::WalCorrupt(_) => ErrorCode::WalCorrupt,
            GibramError::SnapshotCorrupt(_) => ErrorCode::SnapshotCorrupt,
            GibramError::EntityQuotaExceeded { .. } => ErrorCode::EntityQuotaExceeded,
            GibramError::RelationshipQuotaExceeded { .. } => ErrorCode::RelationshipQuotaExceeded,
            GibramError::DocumentQuotaExceeded { .. } => ErrorCode::DocumentQuotaExceeded,
            GibramError::MemoryQuotaExceeded { .. } => ErrorCode::MemoryQuotaExceeded,
            GibramError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            GibramError::SessionExpired(_) => ErrorCode::SessionExpired,
            GibramError::SessionLimitExceeded(_) => ErrorCode::SessionLimitExceeded,
            GibramError::Timeout(_) => ErrorCode::Timeout,
            GibramError::Unavailable(_) => ErrorCode::Unavailable,
            GibramError::ShuttingDown(_) => ErrorCode::ShuttingDown,
            GibramError::Internal(_) | GibramError::Io(_) => ErrorCode::Internal,
        }
    }

    pub(crate) fn not_found(resource: &'static str, id: impl ToString) -> Self {
        GibramError::NotFound {
            resource,
            id: id.to_string(),
        }
    }
}

impl From<std::io::Error> for GibramError {
    fn from(e: std::io::Error) -> Self {
        GibramError::Io(e.to_string())
    }
}

/// Library-wide result alias.
pub type Result<T> = std::result::Result<T, GibramError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_ranges() {
        assert!(GibramError::Conflict("dup".into()).code().is_client());
        assert!(GibramError::EntityQuotaExceeded {
            current: 3,
            delta: 1,
            max: 3
        }
        .code()
        .is_quota());
        assert_eq!(
            GibramError::SessionExpired("s1".into()).code(),
            ErrorCode::SessionExpired
        );
    }

    #[test]
    fn display_carries_code_and_context() {
        let e = GibramError::not_found("entity", 42u64);
        assert_eq!(e.to_string(), "[NOT_FOUND] entity not found: 42");

        let e = GibramError::DimensionMismatch {
            expected: 1536,
            actual: 4,
        };
        assert!(e.to_string().contains("expected 1536"));
    }
}
