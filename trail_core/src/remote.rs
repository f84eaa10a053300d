//! Remote sync endpoint capability.
//!
//! The remote authority accepts `(idempotency key, entity kind, operation
//! kind, payload)` and acknowledges it. [`LedgerEndpoint`] is a file-backed
//! authority that applies each key at most once; [`OfflineEndpoint`]
//! rejects everything.

use crate::store::{CollectionSpec, Keyed, Store};
use crate::{EntityKind, Error, OperationKind, Result, SyncOperation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// A request as sent over the wire
#[derive(Clone, Debug, Serialize)]
pub struct SyncRequest<'a> {
    pub idempotency_key: Uuid,
    pub entity_kind: EntityKind,
    pub kind: OperationKind,
    pub entity_id: &'a str,
    pub payload: &'a serde_json::Value,
}

impl<'a> From<&'a SyncOperation> for SyncRequest<'a> {
    fn from(op: &'a SyncOperation) -> Self {
        Self {
            idempotency_key: op.id,
            entity_kind: op.entity_kind,
            kind: op.kind,
            entity_id: &op.entity_id,
            payload: &op.payload,
        }
    }
}

/// Acknowledgement from the remote authority
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    Applied,
    /// The key was seen before; nothing was applied again
    AlreadyApplied,
}

pub trait RemoteEndpoint {
    /// Apply a request; failures are reported as `Error::SyncFailed`
    fn apply(&mut self, request: &SyncRequest<'_>) -> Result<Ack>;
}

// ============================================================================
// Ledger endpoint
// ============================================================================

const APPLIED: &str = "applied";

/// An operation applied by the ledger
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub idempotency_key: Uuid,
    pub entity_kind: EntityKind,
    pub kind: OperationKind,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub applied_at: DateTime<Utc>,
}

impl Keyed for LedgerEntry {
    fn key(&self) -> String {
        self.idempotency_key.to_string()
    }
}

/// File-backed remote authority keyed by idempotency key
pub struct LedgerEndpoint {
    store: Store,
}

impl LedgerEndpoint {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let spec = CollectionSpec::new(APPLIED).indexed("entity_id");
        Ok(Self {
            store: Store::open(root, vec![spec])?,
        })
    }

    /// Applied operations in the order they took effect
    pub fn applied(&self) -> Result<Vec<LedgerEntry>> {
        self.store.all(APPLIED)
    }

    pub fn applied_for(&self, entity_id: &str) -> Result<Vec<LedgerEntry>> {
        self.store.query(APPLIED, "entity_id", entity_id)
    }
}

impl RemoteEndpoint for LedgerEndpoint {
    fn apply(&mut self, request: &SyncRequest<'_>) -> Result<Ack> {
        let entry = LedgerEntry {
            idempotency_key: request.idempotency_key,
            entity_kind: request.entity_kind,
            kind: request.kind,
            entity_id: request.entity_id.to_string(),
            payload: request.payload.clone(),
            applied_at: Utc::now(),
        };
        match self.store.put(APPLIED, &entry) {
            Ok(()) => Ok(Ack::Applied),
            Err(Error::DuplicateKey { .. }) => {
                tracing::debug!("Ledger already applied {}", request.idempotency_key);
                Ok(Ack::AlreadyApplied)
            }
            Err(e) => Err(Error::SyncFailed(e.to_string())),
        }
    }
}

/// Endpoint for when no connectivity is available
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflineEndpoint;

impl RemoteEndpoint for OfflineEndpoint {
    fn apply(&mut self, _request: &SyncRequest<'_>) -> Result<Ack> {
        Err(Error::SyncFailed("remote unreachable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replayed_request_applies_once() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut ledger = LedgerEndpoint::open(temp_dir.path()).unwrap();
        let op = SyncOperation::new(
            EntityKind::Session,
            OperationKind::Create,
            "s-1",
            serde_json::json!({"distance_m": 10.0}),
        );

        assert_eq!(ledger.apply(&SyncRequest::from(&op)).unwrap(), Ack::Applied);
        for _ in 0..5 {
            assert_eq!(
                ledger.apply(&SyncRequest::from(&op)).unwrap(),
                Ack::AlreadyApplied
            );
        }
        assert_eq!(ledger.applied().unwrap().len(), 1);

        // The ledger survives reopening
        drop(ledger);
        let mut ledger = LedgerEndpoint::open(temp_dir.path()).unwrap();
        assert_eq!(
            ledger.apply(&SyncRequest::from(&op)).unwrap(),
            Ack::AlreadyApplied
        );
        assert_eq!(ledger.applied_for("s-1").unwrap().len(), 1);
    }

    #[test]
    fn test_offline_endpoint_fails_transiently() {
        let op = SyncOperation::new(
            EntityKind::Task,
            OperationKind::Delete,
            "t-1",
            serde_json::Value::Null,
        );
        let err = OfflineEndpoint.apply(&SyncRequest::from(&op)).unwrap_err();
        assert!(matches!(err, Error::SyncFailed(_)));
        assert!(err.is_transient());
    }
}
