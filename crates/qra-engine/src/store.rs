//! Typed repository boundary for persisted allocations.
//!
//! The engine never enumerates raw storage: keys are structured values,
//! every blob travels inside a schema-versioned envelope, and listing a
//! business/year is an explicit capability on the trait.
//!
//! Key behaviors:
//! - Optimistic concurrency: `set` with an expected record version
//!   fails with `ConflictDetected` when a concurrent writer got there
//!   first; passing `None` keeps plain last-write-wins.
//! - A malformed or foreign-versioned blob decodes to zero allocations
//!   (recovered locally, reason recorded), never an error.
//! - Store unavailability always propagates; the engine performs no
//!   implicit retry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allocation::{ActivityRef, BusinessYear};
use crate::normalize::QraConfigurationRow;

/// Component name for structured events.
pub const STORE_COMPONENT: &str = "allocation_store";

/// Schema version stamped on every stored envelope.
pub const STORE_SCHEMA_VERSION: &str = "qra-engine.stored-allocation.v1";

const ERROR_UNAVAILABLE: &str = "QRA-STOR-0001";
const ERROR_CONFLICT: &str = "QRA-STOR-0002";
const ERROR_SERIALIZATION: &str = "QRA-STOR-0003";

// ---------------------------------------------------------------------------
// StoreKey
// ---------------------------------------------------------------------------

/// Structured storage key.  The canonical string form exists only for
/// backends and is never parsed back.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKey {
    BusinessYear(BusinessYear),
    ActivityConfig(ActivityRef),
}

impl StoreKey {
    pub fn business_year(&self) -> BusinessYear {
        match self {
            Self::BusinessYear(scope) => scope.clone(),
            Self::ActivityConfig(activity) => activity.business_year(),
        }
    }
}

// The canonical forms share a prefix so per-scope listing is a prefix
// scan in simple backends.
impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BusinessYear(scope) => write!(f, "qra/{}/{}", scope.business_id, scope.year),
            Self::ActivityConfig(activity) => write!(
                f,
                "qra/{}/{}/{}",
                activity.business_id, activity.year, activity.activity_id
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// StoredEnvelope
// ---------------------------------------------------------------------------

/// Versioned wrapper around every persisted payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEnvelope {
    pub schema_version: String,
    /// Monotonic per-key record version assigned by the store.
    pub record_version: u64,
    pub payload: serde_json::Value,
}

impl StoredEnvelope {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            schema_version: STORE_SCHEMA_VERSION.to_string(),
            record_version: 0,
            payload,
        }
    }
}

/// Encode a business/year's configuration rows for storage.
pub fn encode_business_year(rows: &[QraConfigurationRow]) -> Result<StoredEnvelope, StoreError> {
    let payload =
        serde_json::to_value(rows).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(StoredEnvelope::new(payload))
}

/// Result of decoding one business/year blob.  Malformed data recovers
/// to zero allocations instead of failing.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedBusinessYear {
    Loaded(Vec<QraConfigurationRow>),
    /// The blob failed to parse or carried a foreign schema version;
    /// treated as having no allocations.
    Recovered { reason: String },
}

impl DecodedBusinessYear {
    pub fn rows(self) -> Vec<QraConfigurationRow> {
        match self {
            Self::Loaded(rows) => rows,
            Self::Recovered { .. } => Vec::new(),
        }
    }

    pub fn was_recovered(&self) -> bool {
        matches!(self, Self::Recovered { .. })
    }
}

/// Decode a stored envelope back into configuration rows.
pub fn decode_business_year(envelope: &StoredEnvelope) -> DecodedBusinessYear {
    if envelope.schema_version != STORE_SCHEMA_VERSION {
        return DecodedBusinessYear::Recovered {
            reason: format!(
                "schema version mismatch: expected {STORE_SCHEMA_VERSION}, got {}",
                envelope.schema_version
            ),
        };
    }
    match serde_json::from_value::<Vec<QraConfigurationRow>>(envelope.payload.clone()) {
        Ok(rows) => DecodedBusinessYear::Loaded(rows),
        Err(error) => DecodedBusinessYear::Recovered {
            reason: format!("malformed stored allocation: {error}"),
        },
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store backend unavailable ({backend}): {detail}")]
    Unavailable { backend: String, detail: String },
    #[error("version conflict: expected {expected}, found {actual}")]
    ConflictDetected { expected: u64, actual: u64 },
    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Stable machine-readable error code.
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => ERROR_UNAVAILABLE,
            Self::ConflictDetected { .. } => ERROR_CONFLICT,
            Self::Serialization(_) => ERROR_SERIALIZATION,
        }
    }
}

// ---------------------------------------------------------------------------
// AllocationStore — the repository contract
// ---------------------------------------------------------------------------

/// Generic persistence contract for allocation data.
pub trait AllocationStore {
    /// Backend identifier for diagnostics.
    fn backend_name(&self) -> &'static str;

    fn get(&self, key: &StoreKey) -> Result<Option<StoredEnvelope>, StoreError>;

    /// Write a payload.  With `expected_version`, the write succeeds
    /// only when the current record version matches (optimistic
    /// concurrency); with `None` it unconditionally overwrites.
    /// Returns the new record version.
    fn set(
        &mut self,
        key: &StoreKey,
        envelope: StoredEnvelope,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    fn delete(&mut self, key: &StoreKey) -> Result<bool, StoreError>;

    /// All activity-config records in one business/year scope, in key
    /// order.  Enumeration is an explicit capability, never implicit.
    fn list_business_year(
        &self,
        scope: &BusinessYear,
    ) -> Result<Vec<(StoreKey, StoredEnvelope)>, StoreError>;
}

// ---------------------------------------------------------------------------
// StoreEvent — recorded operations for diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOperation {
    Get,
    Set,
    Delete,
    List,
}

/// One recorded store operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub component: String,
    pub operation: StoreOperation,
    pub key: String,
    pub outcome: String,
}

// ---------------------------------------------------------------------------
// InMemoryAllocationStore
// ---------------------------------------------------------------------------

/// Deterministic in-memory adapter used by tests and local workflows.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAllocationStore {
    records: BTreeMap<StoreKey, StoredEnvelope>,
    events: Vec<StoreEvent>,
    fail_requests: bool,
}

impl InMemoryAllocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `Unavailable`.
    pub fn set_fail_requests(&mut self, fail: bool) {
        self.fail_requests = fail;
    }

    pub fn events(&self) -> &[StoreEvent] {
        &self.events
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.fail_requests {
            return Err(StoreError::Unavailable {
                backend: self.backend_name().to_string(),
                detail: "backend toggled unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn record(&mut self, operation: StoreOperation, key: String, outcome: &str) {
        self.events.push(StoreEvent {
            component: STORE_COMPONENT.to_string(),
            operation,
            key,
            outcome: outcome.to_string(),
        });
    }
}

impl AllocationStore for InMemoryAllocationStore {
    fn backend_name(&self) -> &'static str {
        "in_memory"
    }

    fn get(&self, key: &StoreKey) -> Result<Option<StoredEnvelope>, StoreError> {
        self.check_available()?;
        Ok(self.records.get(key).cloned())
    }

    fn set(
        &mut self,
        key: &StoreKey,
        mut envelope: StoredEnvelope,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let current = self.records.get(key).map(|e| e.record_version).unwrap_or(0);
        if let Some(expected) = expected_version {
            if expected != current {
                self.record(StoreOperation::Set, key.to_string(), "conflict");
                return Err(StoreError::ConflictDetected {
                    expected,
                    actual: current,
                });
            }
        }
        let next = current + 1;
        envelope.record_version = next;
        self.records.insert(key.clone(), envelope);
        self.record(StoreOperation::Set, key.to_string(), "written");
        Ok(next)
    }

    fn delete(&mut self, key: &StoreKey) -> Result<bool, StoreError> {
        self.check_available()?;
        let removed = self.records.remove(key).is_some();
        self.record(
            StoreOperation::Delete,
            key.to_string(),
            if removed { "deleted" } else { "absent" },
        );
        Ok(removed)
    }

    fn list_business_year(
        &self,
        scope: &BusinessYear,
    ) -> Result<Vec<(StoreKey, StoredEnvelope)>, StoreError> {
        self.check_available()?;
        Ok(self
            .records
            .iter()
            .filter(|(key, _)| match key {
                StoreKey::ActivityConfig(activity) => &activity.business_year() == scope,
                StoreKey::BusinessYear(_) => false,
            })
            .map(|(key, envelope)| (key.clone(), envelope.clone()))
            .collect())
    }
}
