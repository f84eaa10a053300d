//! Durable queue of mutations bound for the remote authority.
//!
//! Operations are drained in creation order per entity: once an operation
//! fails, is backing off, or has errored, every later operation on the same
//! entity waits behind it. Operations on different entities are processed
//! independently.

use crate::config::SyncConfig;
use crate::remote::{Ack, RemoteEndpoint, SyncRequest};
use crate::store::{collections, Store};
use crate::{EntityKind, Error, OperationStatus, Result, SyncOperation};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Exponential backoff between failed attempts
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts after which an operation is marked errored
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            multiplier: config.backoff_multiplier,
        }
    }

    /// Delay before retrying after `attempt` failures (1-based), or `None`
    /// once the budget is exhausted
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay_ms = self.initial_delay.as_millis() as f64 * factor;
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Some(Duration::from_millis(capped_ms as u64))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Outcome of one drain pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DrainReport {
    /// Acknowledged and removed from the queue
    pub confirmed: Vec<Uuid>,
    /// Failed this pass, scheduled for retry
    pub failed: Vec<Uuid>,
    /// Failed this pass and exhausted the retry budget
    pub errored: Vec<Uuid>,
    /// Not attempted: backing off or waiting behind an earlier operation
    pub deferred: usize,
    pub cancelled: bool,
}

pub struct SyncQueue {
    store: Arc<Store>,
    policy: RetryPolicy,
}

impl SyncQueue {
    pub fn new(store: Arc<Store>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Append an operation with a fresh attempt count; never touches the
    /// network
    pub fn enqueue(&self, mut op: SyncOperation) -> Result<()> {
        op.attempts = 0;
        op.last_attempt_at = None;
        op.next_attempt_at = None;
        op.last_error = None;
        op.status = OperationStatus::Pending;
        self.store.put(collections::SYNC_QUEUE, &op)?;
        tracing::debug!(
            "Enqueued {:?} {:?} {} as {}",
            op.kind,
            op.entity_kind,
            op.entity_id,
            op.id
        );
        Ok(())
    }

    /// Operations eligible for automatic drains, in creation order
    pub fn pending(&self) -> Result<Vec<SyncOperation>> {
        self.store
            .query(collections::SYNC_QUEUE, "status", status_key(OperationStatus::Pending))
    }

    /// Operations that exhausted their retries and await inspection
    pub fn errored(&self) -> Result<Vec<SyncOperation>> {
        self.store
            .query(collections::SYNC_QUEUE, "status", status_key(OperationStatus::Errored))
    }

    /// Every queued operation targeting one entity, in creation order
    pub fn for_entity(&self, kind: EntityKind, entity_id: &str) -> Result<Vec<SyncOperation>> {
        let ops: Vec<SyncOperation> =
            self.store
                .query(collections::SYNC_QUEUE, "entity_id", entity_id)?;
        Ok(ops.into_iter().filter(|op| op.entity_kind == kind).collect())
    }

    pub fn len(&self) -> Result<usize> {
        self.store.len(collections::SYNC_QUEUE)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drain against `endpoint` now, without cancellation
    pub fn drain(&self, endpoint: &mut dyn RemoteEndpoint) -> Result<DrainReport> {
        self.drain_with(endpoint, Utc::now(), None)
    }

    /// Process queued operations one at a time in creation order
    ///
    /// `cancel` is checked between operations: an operation is either
    /// confirmed and deleted, or left queued for the next drain.
    pub fn drain_with(
        &self,
        endpoint: &mut dyn RemoteEndpoint,
        now: DateTime<Utc>,
        cancel: Option<&AtomicBool>,
    ) -> Result<DrainReport> {
        let ops: Vec<SyncOperation> = self.store.all(collections::SYNC_QUEUE)?;
        let mut report = DrainReport::default();
        let mut blocked: HashSet<(EntityKind, String)> = HashSet::new();

        for mut op in ops {
            if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                report.cancelled = true;
                tracing::info!("Drain cancelled");
                break;
            }

            let entity = (op.entity_kind, op.entity_id.clone());
            if blocked.contains(&entity) {
                report.deferred += 1;
                continue;
            }
            if op.status == OperationStatus::Errored {
                blocked.insert(entity);
                continue;
            }
            if op.next_attempt_at.is_some_and(|next| next > now) {
                blocked.insert(entity);
                report.deferred += 1;
                continue;
            }

            match endpoint.apply(&SyncRequest::from(&op)) {
                Ok(ack) => {
                    if ack == Ack::AlreadyApplied {
                        tracing::debug!("Operation {} was already applied remotely", op.id);
                    }
                    self.store.delete(collections::SYNC_QUEUE, &op.id.to_string())?;
                    report.confirmed.push(op.id);
                }
                Err(e) => {
                    op.attempts += 1;
                    op.last_attempt_at = Some(now);
                    op.last_error = Some(e.to_string());
                    match self.policy.delay_for_attempt(op.attempts) {
                        Some(delay) => {
                            let backoff = chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                            op.next_attempt_at = Some(now + backoff);
                            tracing::warn!(
                                "Sync of {} failed (attempt {}), retrying in {:?}: {}",
                                op.id,
                                op.attempts,
                                delay,
                                e
                            );
                            report.failed.push(op.id);
                        }
                        None => {
                            op.status = OperationStatus::Errored;
                            op.next_attempt_at = None;
                            tracing::warn!(
                                "{}",
                                Error::SyncErrored {
                                    id: op.id.to_string(),
                                    attempts: op.attempts
                                }
                            );
                            report.errored.push(op.id);
                        }
                    }
                    self.store.upsert(collections::SYNC_QUEUE, &op)?;
                    blocked.insert(entity);
                }
            }
        }

        if !report.confirmed.is_empty() || !report.failed.is_empty() || !report.errored.is_empty() {
            tracing::info!(
                "Drain: {} confirmed, {} failed, {} errored, {} deferred",
                report.confirmed.len(),
                report.failed.len(),
                report.errored.len(),
                report.deferred
            );
        }
        Ok(report)
    }

    /// Return an errored operation to automatic retries with a fresh budget
    pub fn retry(&self, id: Uuid) -> Result<()> {
        let mut op: SyncOperation = self
            .store
            .get(collections::SYNC_QUEUE, &id.to_string())?
            .ok_or_else(|| Error::NotFound(format!("sync operation {}", id)))?;
        op.status = OperationStatus::Pending;
        op.attempts = 0;
        op.next_attempt_at = None;
        self.store.upsert(collections::SYNC_QUEUE, &op)?;
        tracing::info!("Operation {} returned to the pending queue", id);
        Ok(())
    }

    /// Drop an operation without sending it; returns whether it existed
    pub fn discard(&self, id: Uuid) -> Result<bool> {
        let removed = self.store.delete(collections::SYNC_QUEUE, &id.to_string())?;
        if removed {
            tracing::warn!("Discarded sync operation {}", id);
        }
        Ok(removed)
    }
}

fn status_key(status: OperationStatus) -> &'static str {
    match status {
        OperationStatus::Pending => "pending",
        OperationStatus::Errored => "errored",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{LedgerEndpoint, OfflineEndpoint};
    use crate::OperationKind;
    use std::collections::HashMap;

    /// Records applied keys in order; fails listed keys a set number of times
    #[derive(Default)]
    struct ScriptedEndpoint {
        applied: Vec<Uuid>,
        failures: HashMap<Uuid, u32>,
        cancel_after_first: Option<Arc<AtomicBool>>,
    }

    impl RemoteEndpoint for ScriptedEndpoint {
        fn apply(&mut self, request: &SyncRequest<'_>) -> Result<Ack> {
            if let Some(remaining) = self.failures.get_mut(&request.idempotency_key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::SyncFailed("503".into()));
                }
            }
            self.applied.push(request.idempotency_key);
            if let Some(flag) = &self.cancel_after_first {
                flag.store(true, Ordering::SeqCst);
            }
            Ok(Ack::Applied)
        }
    }

    fn queue(dir: &std::path::Path, max_attempts: u32) -> SyncQueue {
        let store = Arc::new(Store::open_default(dir).unwrap());
        let policy = RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        };
        SyncQueue::new(store, policy)
    }

    fn op(entity: &str, n: i64) -> SyncOperation {
        SyncOperation::new(
            EntityKind::Session,
            OperationKind::Update,
            entity,
            serde_json::json!({ "n": n }),
        )
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay_for_attempt(4), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_for_attempt(5), None);
    }

    #[test]
    fn test_enqueue_resets_attempt_metadata() {
        let temp_dir = tempfile::tempdir().unwrap();
        let queue = queue(temp_dir.path(), 3);
        let mut operation = op("s-1", 1);
        operation.attempts = 4;
        operation.last_error = Some("stale".into());
        queue.enqueue(operation.clone()).unwrap();

        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 0);
        assert_eq!(pending[0].last_error, None);

        // Same identifier cannot be enqueued twice
        assert!(matches!(queue.enqueue(operation), Err(Error::DuplicateKey { .. })));
    }

    #[test]
    fn test_same_entity_waits_behind_failed_operation() {
        crate::logging::init_test();
        let temp_dir = tempfile::tempdir().unwrap();
        let queue = queue(temp_dir.path(), 5);
        let (a, b, c) = (op("s-1", 1), op("s-1", 2), op("s-1", 3));
        let other = op("s-2", 1);
        for o in [&a, &b, &other, &c] {
            queue.enqueue(o.clone()).unwrap();
        }

        let mut endpoint = ScriptedEndpoint::default();
        endpoint.failures.insert(b.id, 1);

        let now = Utc::now();
        let report = queue.drain_with(&mut endpoint, now, None).unwrap();
        assert_eq!(report.confirmed, vec![a.id, other.id]);
        assert_eq!(report.failed, vec![b.id]);
        assert_eq!(report.deferred, 1);

        // Still backing off: nothing on s-1 moves
        let report = queue.drain_with(&mut endpoint, now, None).unwrap();
        assert!(report.confirmed.is_empty());
        assert_eq!(report.deferred, 2);

        let later = now + chrono::Duration::seconds(60);
        let report = queue.drain_with(&mut endpoint, later, None).unwrap();
        assert_eq!(report.confirmed, vec![b.id, c.id]);
        assert_eq!(endpoint.applied, vec![a.id, other.id, b.id, c.id]);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_retry_updates_the_same_record() {
        let temp_dir = tempfile::tempdir().unwrap();
        let queue = queue(temp_dir.path(), 5);
        let operation = op("s-1", 1);
        queue.enqueue(operation.clone()).unwrap();

        let now = Utc::now();
        queue.drain_with(&mut OfflineEndpoint, now, None).unwrap();

        let stored = queue.pending().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, operation.id);
        assert_eq!(stored[0].attempts, 1);
        assert_eq!(stored[0].last_attempt_at, Some(now));
        assert!(stored[0].last_error.as_deref().unwrap().contains("unreachable"));
        assert_eq!(
            stored[0].next_attempt_at,
            Some(now + chrono::Duration::seconds(2))
        );
    }

    #[test]
    fn test_exhausted_operation_is_errored_and_blocks_entity() {
        let temp_dir = tempfile::tempdir().unwrap();
        let queue = queue(temp_dir.path(), 3);
        let first = op("s-1", 1);
        let second = op("s-1", 2);
        queue.enqueue(first.clone()).unwrap();
        queue.enqueue(second.clone()).unwrap();

        let mut now = Utc::now();
        let mut errored = Vec::new();
        for _ in 0..3 {
            let report = queue.drain_with(&mut OfflineEndpoint, now, None).unwrap();
            errored.extend(report.errored);
            now += chrono::Duration::hours(1);
        }
        assert_eq!(errored, vec![first.id]);

        let listed = queue.errored().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].attempts, 3);

        // Errored operations are not retried automatically, and the later
        // operation for the same entity keeps waiting
        let mut endpoint = ScriptedEndpoint::default();
        let report = queue.drain_with(&mut endpoint, now, None).unwrap();
        assert!(endpoint.applied.is_empty());
        assert_eq!(report.deferred, 1);

        // Manual retry releases both, in order
        queue.retry(first.id).unwrap();
        let report = queue.drain_with(&mut endpoint, now, None).unwrap();
        assert_eq!(report.confirmed, vec![first.id, second.id]);
    }

    #[test]
    fn test_crash_after_ack_replays_idempotently() {
        let temp_dir = tempfile::tempdir().unwrap();
        let queue = queue(&temp_dir.path().join("local"), 5);
        let mut ledger = LedgerEndpoint::open(temp_dir.path().join("remote")).unwrap();
        let operation = op("s-1", 1);
        queue.enqueue(operation.clone()).unwrap();

        // The remote applied it but the local delete never happened
        ledger.apply(&SyncRequest::from(&operation)).unwrap();

        let report = queue.drain(&mut ledger).unwrap();
        assert_eq!(report.confirmed, vec![operation.id]);
        assert_eq!(ledger.applied().unwrap().len(), 1);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_cancel_leaves_remaining_operations_queued() {
        let temp_dir = tempfile::tempdir().unwrap();
        let queue = queue(temp_dir.path(), 5);
        let ops: Vec<_> = (0..3).map(|i| op(&format!("s-{}", i), i)).collect();
        for o in &ops {
            queue.enqueue(o.clone()).unwrap();
        }

        let flag = Arc::new(AtomicBool::new(false));
        let mut endpoint = ScriptedEndpoint {
            cancel_after_first: Some(Arc::clone(&flag)),
            ..ScriptedEndpoint::default()
        };
        let report = queue
            .drain_with(&mut endpoint, Utc::now(), Some(flag.as_ref()))
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.confirmed, vec![ops[0].id]);
        let remaining: Vec<Uuid> = queue.pending().unwrap().iter().map(|o| o.id).collect();
        assert_eq!(remaining, vec![ops[1].id, ops[2].id]);
    }

    #[test]
    fn test_discard_and_for_entity() {
        let temp_dir = tempfile::tempdir().unwrap();
        let queue = queue(temp_dir.path(), 5);
        let a = op("s-1", 1);
        let task = SyncOperation::new(EntityKind::Task, OperationKind::Create, "s-1", serde_json::json!({}));
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(task).unwrap();

        assert_eq!(queue.for_entity(EntityKind::Session, "s-1").unwrap().len(), 1);
        assert!(queue.discard(a.id).unwrap());
        assert!(!queue.discard(a.id).unwrap());
        assert!(queue.for_entity(EntityKind::Session, "s-1").unwrap().is_empty());
        assert_eq!(queue.len().unwrap(), 1);
    }
}
