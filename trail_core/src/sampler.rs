//! Position sampler: filters raw location readings, accumulates distance,
//! duration and pace, detects sustained stops and flushes accepted points to
//! the store in capture order.
//!
//! Aggregation rules:
//! - Readings with accuracy worse than the threshold are dropped silently
//! - Distance is the haversine sum between consecutive accepted points of
//!   the same segment; a resume starts a new segment
//! - Speed below the auto-pause threshold for longer than the sustain window
//!   pauses the sampler; only an explicit `resume` restarts accrual

use crate::config::SamplerConfig;
use crate::location::{LocationError, LocationEvent, LocationReading, LocationSource};
use crate::store::{collections, Store};
use crate::{geo, Error, Result, SensorPoint};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerStatus {
    Running,
    Paused,
    AutoPaused,
    Stopped,
}

/// What happened to a single location event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    Accepted,
    /// Accepted, and it completed the sustain window: sampler is now paused
    AutoPaused,
    /// Accuracy worse than the threshold, or older than the last point
    Rejected,
    /// Sampler paused or stopped; reading not used
    Ignored,
    /// Transient source error, logged and skipped
    SourceError,
}

/// Counts from processing a run of queued events
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub accepted: usize,
    pub rejected: usize,
    pub ignored: usize,
    pub source_errors: usize,
    pub auto_paused: bool,
}

impl PumpStats {
    fn record(&mut self, outcome: SampleOutcome) {
        match outcome {
            SampleOutcome::Accepted => self.accepted += 1,
            SampleOutcome::AutoPaused => {
                self.accepted += 1;
                self.auto_paused = true;
            }
            SampleOutcome::Rejected => self.rejected += 1,
            SampleOutcome::Ignored => self.ignored += 1,
            SampleOutcome::SourceError => self.source_errors += 1,
        }
    }
}

/// Aggregates for a session's movement
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SamplerStats {
    pub accepted_points: usize,
    pub distance_m: f64,
    pub duration_secs: f64,
    pub avg_pace_secs: Option<f64>,
    pub current_pace_secs: Option<f64>,
    pub auto_paused_at: Option<DateTime<Utc>>,
}

pub struct PositionSampler {
    session_id: Uuid,
    config: SamplerConfig,
    store: Arc<Store>,
    source: Option<Box<dyn LocationSource>>,
    events: Option<Receiver<LocationEvent>>,
    status: SamplerStatus,
    segment: u32,
    /// Last accepted point of the current segment
    last_point: Option<SensorPoint>,
    /// (timestamp, cumulative distance) of the last `pace_window` points
    window: VecDeque<(DateTime<Utc>, f64)>,
    distance_m: f64,
    duration_secs: f64,
    accepted: usize,
    /// Last reading of the current segment at or above the pause threshold
    last_moving_at: Option<DateTime<Utc>>,
    low_speed_since: Option<DateTime<Utc>>,
    auto_paused_at: Option<DateTime<Utc>>,
    buffer: VecDeque<SensorPoint>,
    flushes: usize,
}

impl PositionSampler {
    /// Create a sampler and subscribe it to `source`
    pub fn start(
        session_id: Uuid,
        config: SamplerConfig,
        store: Arc<Store>,
        mut source: Box<dyn LocationSource>,
    ) -> Result<Self> {
        let (tx, rx) = channel();
        source.subscribe(config.interval(), tx)?;
        tracing::info!("Position sampler started for session {}", session_id);

        let mut sampler = Self::detached(session_id, config, store);
        sampler.source = Some(source);
        sampler.events = Some(rx);
        Ok(sampler)
    }

    /// A sampler fed directly through [`PositionSampler::handle_event`]
    pub fn detached(session_id: Uuid, config: SamplerConfig, store: Arc<Store>) -> Self {
        let capacity = config.buffer_cap.min(config.flush_batch_size * 4);
        Self {
            session_id,
            config,
            store,
            source: None,
            events: None,
            status: SamplerStatus::Running,
            segment: 0,
            last_point: None,
            window: VecDeque::new(),
            distance_m: 0.0,
            duration_secs: 0.0,
            accepted: 0,
            last_moving_at: None,
            low_speed_since: None,
            auto_paused_at: None,
            buffer: VecDeque::with_capacity(capacity),
            flushes: 0,
        }
    }

    /// Rebuild aggregates from points persisted before a restart
    ///
    /// Capture continues in a fresh segment so distance never bridges the
    /// unobserved gap.
    pub fn restore(&mut self, mut points: Vec<SensorPoint>) {
        points.sort_by_key(|p| p.timestamp);
        let mut previous: Option<&SensorPoint> = None;
        for point in &points {
            if let Some(prev) = previous.filter(|p| p.segment == point.segment) {
                self.distance_m += segment_distance(prev, point);
                self.duration_secs += elapsed_secs(prev.timestamp, point.timestamp);
            }
            previous = Some(point);
        }
        self.accepted = points.len();
        self.segment = points.iter().map(|p| p.segment + 1).max().unwrap_or(0);
        self.last_point = None;
        self.window.clear();
        tracing::info!(
            "Restored {} points ({:.1} m) for session {}",
            self.accepted,
            self.distance_m,
            self.session_id
        );
    }

    pub fn status(&self) -> SamplerStatus {
        self.status
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of successful flushes so far
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            accepted_points: self.accepted,
            distance_m: self.distance_m,
            duration_secs: self.duration_secs,
            avg_pace_secs: geo::pace_secs(self.duration_secs, self.distance_m),
            current_pace_secs: self.current_pace(),
            auto_paused_at: self.auto_paused_at,
        }
    }

    /// Rolling pace over the last `pace_window` accepted points
    pub fn current_pace(&self) -> Option<f64> {
        let (first_ts, first_d) = self.window.front()?;
        let (last_ts, last_d) = self.window.back()?;
        geo::pace_secs(elapsed_secs(*first_ts, *last_ts), last_d - first_d)
    }

    /// Process every event queued by the location source
    pub fn pump(&mut self) -> Result<PumpStats> {
        let mut stats = PumpStats::default();
        loop {
            let event = match self.events.as_ref().map(|rx| rx.try_recv()) {
                Some(Ok(event)) => event,
                _ => break,
            };
            stats.record(self.handle_event(event)?);
        }
        Ok(stats)
    }

    /// Apply one location event
    ///
    /// Returns `SensorPermissionDenied` once, after stopping the sampler;
    /// `BufferOverflow` when points cannot be flushed and the buffer is full.
    pub fn handle_event(&mut self, event: LocationEvent) -> Result<SampleOutcome> {
        match event {
            LocationEvent::Reading(reading) => self.handle_reading(reading),
            LocationEvent::Error(LocationError::PermissionDenied) => {
                tracing::warn!(
                    "Location permission revoked, stopping sampler for session {}",
                    self.session_id
                );
                self.unsubscribe();
                self.status = SamplerStatus::Stopped;
                Err(Error::SensorPermissionDenied("location".into()))
            }
            LocationEvent::Error(LocationError::PositionUnavailable(reason)) => {
                tracing::warn!("Position unavailable: {}", reason);
                Ok(SampleOutcome::SourceError)
            }
            LocationEvent::Error(LocationError::Timeout) => {
                tracing::warn!("Location reading timed out");
                Ok(SampleOutcome::SourceError)
            }
        }
    }

    fn handle_reading(&mut self, reading: LocationReading) -> Result<SampleOutcome> {
        if self.status != SamplerStatus::Running {
            return Ok(SampleOutcome::Ignored);
        }
        if !(reading.latitude.is_finite()
            && reading.longitude.is_finite()
            && reading.accuracy_m.is_finite())
        {
            tracing::debug!(
                "Rejected malformed reading ({}, {}) accuracy {}",
                reading.latitude,
                reading.longitude,
                reading.accuracy_m
            );
            return Ok(SampleOutcome::Rejected);
        }
        if reading.accuracy_m > self.config.accuracy_threshold_m {
            tracing::debug!(
                "Rejected reading with accuracy {:.1} m (threshold {:.1} m)",
                reading.accuracy_m,
                self.config.accuracy_threshold_m
            );
            return Ok(SampleOutcome::Rejected);
        }
        if let Some(last) = &self.last_point {
            if reading.timestamp < last.timestamp {
                tracing::debug!("Rejected out-of-order reading at {}", reading.timestamp);
                return Ok(SampleOutcome::Rejected);
            }
        }

        let point = SensorPoint {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            segment: self.segment,
            latitude: reading.latitude,
            longitude: reading.longitude,
            timestamp: reading.timestamp,
            accuracy_m: reading.accuracy_m,
            altitude_m: reading.altitude_m.filter(|v| v.is_finite()),
            speed_mps: reading.speed_mps.filter(|v| v.is_finite()),
            heading_deg: reading.heading_deg.filter(|v| v.is_finite()),
        };

        let mut derived_speed = None;
        if let Some(last) = &self.last_point {
            let step = segment_distance(last, &point);
            let dt = elapsed_secs(last.timestamp, point.timestamp);
            self.distance_m += step;
            self.duration_secs += dt;
            if dt > 0.0 {
                derived_speed = Some(step / dt);
            }
        }

        self.window.push_back((point.timestamp, self.distance_m));
        while self.window.len() > self.config.pace_window {
            self.window.pop_front();
        }

        self.accepted += 1;
        self.last_point = Some(point.clone());
        let speed = point.speed_mps.or(derived_speed);
        self.buffer.push_back(point);

        let outcome = match speed {
            Some(speed) => self.track_auto_pause(speed, reading.timestamp),
            None => SampleOutcome::Accepted,
        };

        if self.buffer.len() >= self.config.flush_batch_size {
            self.flush_buffered()?;
        }
        Ok(outcome)
    }

    fn track_auto_pause(&mut self, speed: f64, at: DateTime<Utc>) -> SampleOutcome {
        if speed >= self.config.auto_pause_speed_mps {
            self.low_speed_since = None;
            self.last_moving_at = Some(at);
            return SampleOutcome::Accepted;
        }

        // The slowdown happened somewhere after the last moving reading
        let since = *self
            .low_speed_since
            .get_or_insert(self.last_moving_at.unwrap_or(at));
        if at - since > self.config.auto_pause_sustain() {
            tracing::info!(
                "Auto-paused session {} after {}s below {} m/s",
                self.session_id,
                (at - since).num_seconds(),
                self.config.auto_pause_speed_mps
            );
            self.status = SamplerStatus::AutoPaused;
            self.low_speed_since = None;
            self.last_moving_at = None;
            self.auto_paused_at = Some(at);
            return SampleOutcome::AutoPaused;
        }
        SampleOutcome::Accepted
    }

    /// Flush, tolerating store outages until the buffer cap is reached
    fn flush_buffered(&mut self) -> Result<()> {
        match self.flush() {
            Ok(_) => Ok(()),
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    "Point flush failed ({} buffered), will retry: {}",
                    self.buffer.len(),
                    e
                );
                if self.buffer.len() >= self.config.buffer_cap {
                    Err(Error::BufferOverflow {
                        capacity: self.config.buffer_cap,
                    })
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Write buffered points as one atomic batch, then drop them from memory
    ///
    /// Points are upserted by id, so retrying after an ambiguous failure
    /// never duplicates them.
    pub fn flush(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let count = self.buffer.len();
        self.store
            .upsert_batch(collections::POINTS, self.buffer.make_contiguous())?;
        self.buffer.clear();
        self.flushes += 1;
        tracing::debug!("Flushed {} points for session {}", count, self.session_id);
        Ok(count)
    }

    pub fn pause(&mut self) -> Result<()> {
        match self.status {
            SamplerStatus::Running => {
                self.status = SamplerStatus::Paused;
                self.low_speed_since = None;
                self.last_moving_at = None;
                Ok(())
            }
            SamplerStatus::Paused | SamplerStatus::AutoPaused => Ok(()),
            SamplerStatus::Stopped => Err(self.stopped_error("pause")),
        }
    }

    /// Restart accrual in a new segment
    pub fn resume(&mut self) -> Result<()> {
        match self.status {
            SamplerStatus::Paused | SamplerStatus::AutoPaused => {
                self.status = SamplerStatus::Running;
                self.segment += 1;
                self.last_point = None;
                self.window.clear();
                self.low_speed_since = None;
                self.last_moving_at = None;
                Ok(())
            }
            SamplerStatus::Running => Ok(()),
            SamplerStatus::Stopped => Err(self.stopped_error("resume")),
        }
    }

    /// Unsubscribe, process readings captured before the call, and flush
    ///
    /// No further writes happen after this returns `Ok`. On a store failure
    /// the points stay buffered and `stop` may be called again.
    pub fn stop(&mut self) -> Result<SamplerStats> {
        self.unsubscribe();
        if self.status != SamplerStatus::Stopped {
            while let Some(event) = self.events.as_ref().and_then(|rx| rx.try_recv().ok()) {
                if let Err(e) = self.handle_event(event) {
                    if !matches!(e, Error::BufferOverflow { .. }) {
                        tracing::warn!("Ignoring late location event during stop: {}", e);
                    }
                }
            }
            self.status = SamplerStatus::Stopped;
        }
        self.events = None;
        self.flush()?;
        tracing::info!(
            "Position sampler stopped for session {}: {} points, {:.1} m",
            self.session_id,
            self.accepted,
            self.distance_m
        );
        Ok(self.stats())
    }

    fn unsubscribe(&mut self) {
        if let Some(source) = self.source.as_mut() {
            source.unsubscribe();
        }
    }

    fn stopped_error(&self, action: &'static str) -> Error {
        Error::InvalidTransition {
            state: "stopped".into(),
            action,
        }
    }
}

fn segment_distance(a: &SensorPoint, b: &SensorPoint) -> f64 {
    geo::haversine_m(a.latitude, a.longitude, b.latitude, b.longitude)
}

fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 1000.0).max(0.0)
}
