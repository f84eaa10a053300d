//! Session lifecycle: owns the workout record, its sensors and the sync
//! operations it produces.
//!
//! ```text
//! idle -> active <-> paused -> completed
//!           \          /
//!            -> failed
//! ```
//!
//! The session record and its sync operation are two separate store writes.
//! The operation always goes first: the record is only written once every
//! operation describing it is in the durable queue. Operations that cannot
//! be enqueued while the store is failing wait in an in-memory outbox, and
//! the record write waits with them until the next `pump` or `stop`.

use crate::config::Config;
use crate::heart_rate::HeartRateSensor;
use crate::location::LocationSource;
use crate::sampler::{PositionSampler, SamplerStats};
use crate::store::{collections, Store};
use crate::sync_queue::{RetryPolicy, SyncQueue};
use crate::{
    ActivityMode, EntityKind, Error, HeartRateSample, OperationKind, Result, SensorPoint,
    SessionState, SyncOperation, WorkoutSession,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Capabilities handed to a session when it starts
#[derive(Default)]
pub struct SessionSensors {
    /// Required for outdoor sessions, ignored indoors
    pub location: Option<Box<dyn LocationSource>>,
    pub heart_rate: Option<HeartRateSensor>,
}

impl SessionSensors {
    pub fn with_location(mut self, source: impl LocationSource + 'static) -> Self {
        self.location = Some(Box::new(source));
        self
    }

    pub fn with_heart_rate(mut self, sensor: HeartRateSensor) -> Self {
        self.heart_rate = Some(sensor);
        self
    }
}

/// Result of processing queued sensor events
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PumpReport {
    pub accepted: usize,
    pub rejected: usize,
    pub source_errors: usize,
    /// New session state when the pump caused a transition
    pub transition: Option<SessionState>,
}

pub struct SessionController {
    config: Config,
    store: Arc<Store>,
    queue: SyncQueue,
    session: Option<WorkoutSession>,
    sampler: Option<PositionSampler>,
    heart_rate: Option<HeartRateSensor>,
    outbox: VecDeque<SyncOperation>,
    /// Session record changed locally but not yet written
    record_dirty: bool,
    seen_flushes: usize,
    /// Indoor timing: moving time banked before the current active stretch
    banked: Duration,
    active_since: Option<DateTime<Utc>>,
}

impl SessionController {
    pub fn new(config: Config, store: Arc<Store>) -> Self {
        let queue = SyncQueue::new(Arc::clone(&store), RetryPolicy::from_config(&config.sync));
        Self {
            config,
            store,
            queue,
            session: None,
            sampler: None,
            heart_rate: None,
            outbox: VecDeque::new(),
            record_dirty: false,
            seen_flushes: 0,
            banked: Duration::ZERO,
            active_since: None,
        }
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    pub fn session(&self) -> Option<&WorkoutSession> {
        self.session.as_ref()
    }

    pub fn distance_m(&self) -> f64 {
        match &self.sampler {
            Some(sampler) => sampler.stats().distance_m,
            None => self.session.as_ref().map(|s| s.distance_m).unwrap_or(0.0),
        }
    }

    /// Rolling pace in seconds per 500 m
    pub fn pace_per_500m(&self) -> Option<f64> {
        match &self.sampler {
            Some(sampler) => sampler.current_pace(),
            None => self.session.as_ref().and_then(|s| s.avg_pace_secs),
        }
    }

    /// Moving time so far
    pub fn duration(&self) -> Duration {
        match (&self.sampler, &self.session) {
            (Some(sampler), _) => Duration::from_secs_f64(sampler.stats().duration_secs),
            (None, Some(session)) if session.state.is_live() => self.indoor_elapsed(Utc::now()),
            (None, Some(session)) => Duration::from_secs_f64(session.duration_secs),
            (None, None) => Duration::ZERO,
        }
    }

    pub fn heart_rate(&self) -> Option<HeartRateSample> {
        self.heart_rate.as_ref().and_then(|sensor| sensor.latest())
    }

    pub fn sampler_stats(&self) -> Option<SamplerStats> {
        self.sampler.as_ref().map(|s| s.stats())
    }

    /// Sync operations waiting for the store to come back
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Create a session and start its sensors
    ///
    /// Nothing is persisted unless every sensor starts; on error the
    /// controller stays where it was. The record is written after its
    /// `create` operation is queued.
    pub fn start(
        &mut self,
        owner_id: &str,
        mode: ActivityMode,
        metadata: serde_json::Value,
        sensors: SessionSensors,
    ) -> Result<&WorkoutSession> {
        if let Some(current) = &self.session {
            if current.state.is_live() {
                return Err(invalid(current.state, "start"));
            }
        }

        let mut session = WorkoutSession::new(owner_id, mode, metadata);
        let (sampler, heart_rate) = self.start_sensors(session.id, mode, sensors)?;

        session.state = SessionState::Active;
        let op = match SyncOperation::for_session(OperationKind::Create, &session) {
            Ok(op) => op,
            Err(e) => {
                teardown(sampler, heart_rate);
                return Err(e);
            }
        };
        tracing::info!("Started {:?} session {} for {}", mode, session.id, owner_id);

        self.sampler = sampler;
        self.heart_rate = heart_rate;
        self.seen_flushes = 0;
        self.banked = Duration::ZERO;
        self.active_since = Some(Utc::now());
        self.record_dirty = true;
        self.session = Some(session);
        self.enqueue(op);

        self.session
            .as_ref()
            .ok_or_else(|| Error::Other("session vanished during start".into()))
    }

    /// Reattach to a session that was live when the process stopped
    ///
    /// Aggregates are rebuilt from the points already in the store.
    pub fn recover(&mut self, session_id: Uuid, sensors: SessionSensors) -> Result<&WorkoutSession> {
        if let Some(current) = &self.session {
            if current.state.is_live() {
                return Err(invalid(current.state, "recover while tracking"));
            }
        }
        let mut session: WorkoutSession = self
            .store
            .get(collections::SESSIONS, &session_id.to_string())?
            .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;
        if !session.state.is_live() {
            return Err(invalid(session.state, "recover"));
        }

        let (mut sampler, heart_rate) = self.start_sensors(session.id, session.mode, sensors)?;
        if let Some(sampler) = sampler.as_mut() {
            let points: Vec<SensorPoint> =
                self.store
                    .query(collections::POINTS, "session_id", &session_id.to_string())?;
            sampler.restore(points);
            if session.state == SessionState::Paused {
                sampler.pause()?;
            }
            let stats = sampler.stats();
            session.distance_m = stats.distance_m;
            session.duration_secs = stats.duration_secs;
            session.avg_pace_secs = stats.avg_pace_secs;
        }
        tracing::info!(
            "Recovered {} session {} at {:.1} m",
            session.state,
            session.id,
            session.distance_m
        );

        self.seen_flushes = 0;
        self.banked = Duration::from_secs_f64(session.duration_secs.max(0.0));
        self.active_since = (session.state == SessionState::Active).then(Utc::now);
        self.sampler = sampler;
        self.heart_rate = heart_rate;
        self.record_dirty = false;
        self.session = Some(session);
        self.session
            .as_ref()
            .ok_or_else(|| Error::Other("session vanished during recovery".into()))
    }

    pub fn pause(&mut self) -> Result<()> {
        match self.state() {
            SessionState::Active => {}
            SessionState::Paused => return Ok(()),
            other => return Err(invalid(other, "pause")),
        }
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.pause()?;
        }
        self.bank_active_time(Utc::now());
        self.set_state(SessionState::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        match self.state() {
            SessionState::Paused => {}
            SessionState::Active => return Ok(()),
            other => return Err(invalid(other, "resume")),
        }
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.resume()?;
        }
        self.active_since = Some(Utc::now());
        self.set_state(SessionState::Active);
        Ok(())
    }

    /// Process queued location events and check the heart-rate sensor
    ///
    /// Fatal sensor conditions move the session to `failed` and are reported
    /// through `transition` rather than as an error.
    pub fn pump(&mut self) -> Result<PumpReport> {
        let mut report = PumpReport::default();
        if let Some(sampler) = self.sampler.as_mut() {
            match sampler.pump() {
                Ok(stats) => {
                    report.accepted = stats.accepted;
                    report.rejected = stats.rejected;
                    report.source_errors = stats.source_errors;
                    if stats.auto_paused && self.state() == SessionState::Active {
                        self.bank_active_time(Utc::now());
                        self.set_state(SessionState::Paused);
                        report.transition = Some(SessionState::Paused);
                    }
                }
                Err(e @ (Error::SensorPermissionDenied(_) | Error::BufferOverflow { .. })) => {
                    self.fail(&e.to_string())?;
                    report.transition = Some(SessionState::Failed);
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(Err(e)) = self.heart_rate.as_ref().map(|sensor| sensor.health()) {
            self.fail(&e.to_string())?;
            report.transition = Some(SessionState::Failed);
        }
        self.sync_aggregates();
        self.flush_outbox();
        Ok(report)
    }

    /// Stop sensors, finalize the record and enqueue its final snapshot
    ///
    /// If the final point flush fails the session stays live and `stop` can
    /// be retried.
    pub fn stop(&mut self) -> Result<WorkoutSession> {
        let state = self.state();
        if !state.is_live() {
            return Err(invalid(state, "stop"));
        }

        let stats = match self.sampler.as_mut() {
            Some(sampler) => Some(sampler.stop()?),
            None => None,
        };
        if let Some(mut sensor) = self.heart_rate.take() {
            sensor.disconnect();
        }
        let now = Utc::now();
        self.bank_active_time(now);
        let indoor_secs = self.banked.as_secs_f64();

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Other("no session to stop".into()))?;
        match stats {
            Some(stats) => {
                session.distance_m = stats.distance_m;
                session.duration_secs = stats.duration_secs;
                session.avg_pace_secs = stats.avg_pace_secs;
            }
            None => session.duration_secs = indoor_secs,
        }
        session.state = SessionState::Completed;
        session.completed_at = Some(now);
        let snapshot = session.clone();
        self.sampler = None;
        tracing::info!(
            "Completed session {}: {:.1} m in {:.0} s",
            snapshot.id,
            snapshot.distance_m,
            snapshot.duration_secs
        );

        self.record_dirty = true;
        self.enqueue(SyncOperation::for_session(OperationKind::Update, &snapshot)?);
        Ok(snapshot)
    }

    /// Destroy a finished session and its points
    ///
    /// Refused while any sync operation for the session is still queued.
    pub fn purge(&mut self, session_id: Uuid) -> Result<()> {
        let key = session_id.to_string();
        let session: WorkoutSession = self
            .store
            .get(collections::SESSIONS, &key)?
            .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;
        if !session.state.is_terminal() {
            return Err(invalid(session.state, "purge"));
        }
        let queued = self.queue.for_entity(EntityKind::Session, &key)?.len()
            + self
                .outbox
                .iter()
                .filter(|op| op.entity_key() == (EntityKind::Session, key.as_str()))
                .count();
        if queued > 0 {
            return Err(Error::Other(format!(
                "Session {} still has {} unsynced operations",
                session_id, queued
            )));
        }

        let points: Vec<SensorPoint> = self.store.query(collections::POINTS, "session_id", &key)?;
        for point in &points {
            self.store.delete(collections::POINTS, &point.id.to_string())?;
        }
        self.store.delete(collections::SESSIONS, &key)?;
        if self.session.as_ref().is_some_and(|s| s.id == session_id) {
            self.session = None;
        }
        tracing::info!("Purged session {} and {} points", session_id, points.len());
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn start_sensors(
        &self,
        session_id: Uuid,
        mode: ActivityMode,
        sensors: SessionSensors,
    ) -> Result<(Option<PositionSampler>, Option<HeartRateSensor>)> {
        let sampler = if mode.uses_location() {
            let source = sensors
                .location
                .ok_or_else(|| Error::SensorUnavailable("no location source for outdoor session".into()))?;
            Some(PositionSampler::start(
                session_id,
                self.config.sampler.clone(),
                Arc::clone(&self.store),
                source,
            )?)
        } else {
            None
        };

        let heart_rate = match sensors.heart_rate {
            Some(mut sensor) => match sensor.connect() {
                Ok(true) => Some(sensor),
                Ok(false) => {
                    tracing::warn!("Heart-rate device unavailable, continuing without it");
                    None
                }
                Err(e) => {
                    teardown(sampler, None);
                    return Err(e);
                }
            },
            None => None,
        };
        Ok((sampler, heart_rate))
    }

    /// Move to `failed`, release sensors and enqueue the failure snapshot
    fn fail(&mut self, reason: &str) -> Result<()> {
        if let Some(mut sampler) = self.sampler.take() {
            if let Err(e) = sampler.stop() {
                tracing::warn!("Discarding unflushed points of failed session: {}", e);
            }
            let stats = sampler.stats();
            if let Some(session) = self.session.as_mut() {
                session.distance_m = stats.distance_m;
                session.duration_secs = stats.duration_secs;
                session.avg_pace_secs = stats.avg_pace_secs;
            }
        }
        if let Some(mut sensor) = self.heart_rate.take() {
            sensor.disconnect();
        }

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Other("no session to fail".into()))?;
        session.state = SessionState::Failed;
        session.failure_reason = Some(reason.to_string());
        let snapshot = session.clone();
        tracing::warn!("Session {} failed: {}", snapshot.id, reason);

        self.record_dirty = true;
        self.enqueue(SyncOperation::for_session(OperationKind::Update, &snapshot)?);
        Ok(())
    }

    fn set_state(&mut self, state: SessionState) {
        if let Some(session) = self.session.as_mut() {
            session.state = state;
            self.record_dirty = true;
        }
        self.write_record();
    }

    fn bank_active_time(&mut self, now: DateTime<Utc>) {
        if let Some(since) = self.active_since.take() {
            self.banked += (now - since).to_std().unwrap_or(Duration::ZERO);
        }
    }

    fn indoor_elapsed(&self, now: DateTime<Utc>) -> Duration {
        let running = self
            .active_since
            .map(|since| (now - since).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);
        self.banked + running
    }

    /// Copy sampler aggregates into the record after each point flush
    fn sync_aggregates(&mut self) {
        let Some(sampler) = self.sampler.as_ref() else {
            return;
        };
        if sampler.flushes() == self.seen_flushes {
            return;
        }
        self.seen_flushes = sampler.flushes();
        let stats = sampler.stats();
        if let Some(session) = self.session.as_mut() {
            session.distance_m = stats.distance_m;
            session.duration_secs = stats.duration_secs;
            session.avg_pace_secs = stats.avg_pace_secs;
            self.record_dirty = true;
        }
        self.write_record();
    }

    /// Deferred while any operation is still held in the outbox
    fn write_record(&mut self) {
        if !self.record_dirty || !self.outbox.is_empty() {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        match self.store.upsert(collections::SESSIONS, session) {
            Ok(()) => self.record_dirty = false,
            Err(e) => tracing::warn!("Session {} record not written, will retry: {}", session.id, e),
        }
    }

    fn enqueue(&mut self, op: SyncOperation) {
        self.outbox.push_back(op);
        self.flush_outbox();
    }

    fn flush_outbox(&mut self) {
        while let Some(op) = self.outbox.front() {
            match self.queue.enqueue(op.clone()) {
                // Already enqueued by an attempt whose result was lost
                Ok(()) | Err(Error::DuplicateKey { .. }) => {
                    self.outbox.pop_front();
                }
                Err(e) => {
                    tracing::warn!(
                        "Sync operation {} held in memory ({} waiting): {}",
                        op.id,
                        self.outbox.len(),
                        e
                    );
                    break;
                }
            }
        }
        self.write_record();
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if !self.outbox.is_empty() {
            tracing::warn!(
                "Dropping controller with {} sync operations not yet enqueued",
                self.outbox.len()
            );
        }
        if self.record_dirty {
            if let Some(session) = self.session.as_ref() {
                tracing::warn!("Dropping controller before session {} was written", session.id);
            }
        }
    }
}

fn invalid(state: SessionState, action: &'static str) -> Error {
    Error::InvalidTransition {
        state: state.to_string(),
        action,
    }
}

fn teardown(sampler: Option<PositionSampler>, heart_rate: Option<HeartRateSensor>) {
    if let Some(mut sampler) = sampler {
        if let Err(e) = sampler.stop() {
            tracing::warn!("Sampler teardown failed: {}", e);
        }
    }
    if let Some(mut sensor) = heart_rate {
        sensor.disconnect();
    }
}
