//! Location capability consumed by the position sampler.
//!
//! Platform adapters implement [`LocationSource`] and push readings into the
//! channel they are handed on subscribe. The receiving end belongs to the
//! session, which is the only place aggregates are mutated.

use crate::{geo, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

/// A raw reading as reported by the platform
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LocationReading {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters (lower is better)
    pub accuracy_m: f64,
    pub timestamp: DateTime<Utc>,
    pub altitude_m: Option<f64>,
    pub speed_mps: Option<f64>,
    pub heading_deg: Option<f64>,
}

impl LocationReading {
    pub fn new(latitude: f64, longitude: f64, accuracy_m: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m,
            timestamp,
            altitude_m: None,
            speed_mps: None,
            heading_deg: None,
        }
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.speed_mps = Some(speed_mps);
        self
    }
}

/// Failure conditions a location source can report
#[derive(Clone, Debug, PartialEq)]
pub enum LocationError {
    /// Permission revoked; fatal
    PermissionDenied,
    /// No fix available right now
    PositionUnavailable(String),
    Timeout,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LocationEvent {
    Reading(LocationReading),
    Error(LocationError),
}

/// Platform location capability: subscribe, receive readings, unsubscribe
pub trait LocationSource: Send {
    /// Start delivering events into `sink` roughly every `interval`
    fn subscribe(&mut self, interval: std::time::Duration, sink: Sender<LocationEvent>) -> Result<()>;

    /// Stop delivering events; must be safe to call more than once
    fn unsubscribe(&mut self);
}

// ============================================================================
// Scripted source
// ============================================================================

/// Replays a prepared list of events as soon as it is subscribed
pub struct ScriptedLocationSource {
    events: Vec<LocationEvent>,
    subscribed: bool,
}

impl ScriptedLocationSource {
    pub fn new(events: Vec<LocationEvent>) -> Self {
        Self {
            events,
            subscribed: false,
        }
    }

    /// A straight walk from a start point, one reading every `interval_secs`
    /// up to and including `duration_secs`.
    ///
    /// `speed_at(t)` gives the speed in m/s over the interval ending at
    /// second `t`; it is also reported as the reading's speed.
    pub fn line(
        start: (f64, f64),
        bearing_deg: f64,
        started_at: DateTime<Utc>,
        interval_secs: u64,
        duration_secs: u64,
        accuracy_m: f64,
        speed_at: impl Fn(u64) -> f64,
    ) -> Self {
        let (mut lat, mut lon) = start;
        let mut events = Vec::new();
        let mut t = 0;
        while t <= duration_secs {
            let speed = speed_at(t);
            if t > 0 {
                let (next_lat, next_lon) =
                    geo::destination(lat, lon, bearing_deg, speed * interval_secs as f64);
                lat = next_lat;
                lon = next_lon;
            }
            let reading = LocationReading {
                heading_deg: Some(bearing_deg),
                ..LocationReading::new(lat, lon, accuracy_m, started_at + Duration::seconds(t as i64))
                    .with_speed(speed)
            };
            events.push(LocationEvent::Reading(reading));
            t += interval_secs.max(1);
        }
        Self::new(events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }
}

impl LocationSource for ScriptedLocationSource {
    fn subscribe(&mut self, _interval: std::time::Duration, sink: Sender<LocationEvent>) -> Result<()> {
        self.subscribed = true;
        for event in self.events.drain(..) {
            if sink.send(event).is_err() {
                break;
            }
        }
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.subscribed = false;
    }
}

// ============================================================================
// Push-driven source
// ============================================================================

/// Source whose events are pushed from elsewhere through a [`LocationFeed`]
///
/// Stands in for platform adapters that deliver readings from their own
/// callback threads.
#[derive(Default)]
pub struct FeedLocationSource {
    sink: Arc<Mutex<Option<Sender<LocationEvent>>>>,
}

/// Cloneable handle pushing events into a [`FeedLocationSource`]
#[derive(Clone)]
pub struct LocationFeed {
    sink: Arc<Mutex<Option<Sender<LocationEvent>>>>,
}

impl FeedLocationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self) -> LocationFeed {
        LocationFeed {
            sink: Arc::clone(&self.sink),
        }
    }
}

impl LocationFeed {
    /// Deliver an event; returns false once the source is unsubscribed
    pub fn push(&self, event: LocationEvent) -> bool {
        match self.sink.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(sender) => sender.send(event).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }
}

impl LocationSource for FeedLocationSource {
    fn subscribe(&mut self, _interval: std::time::Duration, sink: Sender<LocationEvent>) -> Result<()> {
        if let Ok(mut guard) = self.sink.lock() {
            *guard = Some(sink);
        }
        Ok(())
    }

    fn unsubscribe(&mut self) {
        if let Ok(mut guard) = self.sink.lock() {
            guard.take();
        }
    }
}
