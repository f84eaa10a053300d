//! Core domain types for the Trail telemetry system.
//!
//! This module defines the fundamental types used throughout the system:
//! - Workout sessions and their lifecycle state
//! - Position samples (sensor points)
//! - Heart-rate samples
//! - Sync operations bound for the remote authority

use crate::store::Keyed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Session Types
// ============================================================================

/// Kind of activity being captured
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityMode {
    Outdoor,
    IndoorFixed,
    IndoorGeneral,
}

impl ActivityMode {
    /// Whether position sampling makes sense for this mode
    pub fn uses_location(&self) -> bool {
        matches!(self, ActivityMode::Outdoor)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityMode::Outdoor => "outdoor",
            ActivityMode::IndoorFixed => "indoor_fixed",
            ActivityMode::IndoorGeneral => "indoor_general",
        }
    }
}

impl std::str::FromStr for ActivityMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "outdoor" => Ok(ActivityMode::Outdoor),
            "indoor_fixed" | "fixed" => Ok(ActivityMode::IndoorFixed),
            "indoor_general" | "indoor" => Ok(ActivityMode::IndoorGeneral),
            other => Err(crate::Error::Other(format!("Unknown activity mode: {}", other))),
        }
    }
}

/// Lifecycle state of a workout session
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
    Paused,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    /// Active or paused: sensors are attached and capture may continue
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Active | SessionState::Paused)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A workout session record, persisted in the `sessions` collection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkoutSession {
    pub id: Uuid,
    pub owner_id: String,
    pub mode: ActivityMode,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Accumulated distance in meters
    pub distance_m: f64,
    /// Accumulated moving time in seconds
    pub duration_secs: f64,
    /// Average pace as seconds per 500 m, once any distance is covered
    pub avg_pace_secs: Option<f64>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl WorkoutSession {
    pub fn new(owner_id: impl Into<String>, mode: ActivityMode, metadata: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            mode,
            state: SessionState::Idle,
            started_at: Utc::now(),
            completed_at: None,
            distance_m: 0.0,
            duration_secs: 0.0,
            avg_pace_secs: None,
            failure_reason: None,
            metadata,
        }
    }
}

impl Keyed for WorkoutSession {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

// ============================================================================
// Sensor Sample Types
// ============================================================================

/// An accepted position sample, persisted in the `points` collection
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SensorPoint {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Movement segment; incremented on every resume so distance never
    /// bridges a paused gap
    pub segment: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    /// Horizontal accuracy in meters
    pub accuracy_m: f64,
    pub altitude_m: Option<f64>,
    pub speed_mps: Option<f64>,
    pub heading_deg: Option<f64>,
}

impl Keyed for SensorPoint {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// A decoded heart-rate reading; held in memory and handed to callbacks
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HeartRateSample {
    pub bpm: u16,
    /// `None` when the device cannot detect skin contact
    pub sensor_contact: Option<bool>,
    /// Cumulative energy expended in kilojoules
    pub energy_expended_kj: Option<u16>,
    pub rr_intervals_ms: Vec<f64>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Sync Types
// ============================================================================

/// Remote entity an operation targets
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Session,
    Reservation,
    Task,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Eligible for automatic drains
    Pending,
    /// Retry budget exhausted; waits for manual inspection
    Errored,
}

/// A durable mutation bound for the remote authority
///
/// `id` doubles as the idempotency key and is never regenerated; retries
/// only touch the attempt metadata.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SyncOperation {
    pub id: Uuid,
    pub entity_kind: EntityKind,
    pub kind: OperationKind,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: OperationStatus,
}

impl SyncOperation {
    pub fn new(
        entity_kind: EntityKind,
        kind: OperationKind,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_kind,
            kind,
            entity_id: entity_id.into(),
            payload,
            created_at: Utc::now(),
            attempts: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            last_error: None,
            status: OperationStatus::Pending,
        }
    }

    /// Snapshot a session into an operation
    pub fn for_session(kind: OperationKind, session: &WorkoutSession) -> crate::Result<Self> {
        Ok(Self::new(
            EntityKind::Session,
            kind,
            session.id.to_string(),
            serde_json::to_value(session)?,
        ))
    }

    /// Key grouping operations that must apply in creation order
    pub fn entity_key(&self) -> (EntityKind, &str) {
        (self.entity_kind, self.entity_id.as_str())
    }
}

impl Keyed for SyncOperation {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_mode_parsing() {
        assert_eq!("outdoor".parse::<ActivityMode>().unwrap(), ActivityMode::Outdoor);
        assert_eq!(
            "indoor-fixed".parse::<ActivityMode>().unwrap(),
            ActivityMode::IndoorFixed
        );
        assert!("swim".parse::<ActivityMode>().is_err());
    }

    #[test]
    fn test_session_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Paused.is_live());
        assert!(!SessionState::Idle.is_live());
    }

    #[test]
    fn test_operation_snapshot_carries_session() {
        let session = WorkoutSession::new("owner-1", ActivityMode::Outdoor, serde_json::json!({}));
        let op = SyncOperation::for_session(OperationKind::Create, &session).unwrap();

        assert_eq!(op.entity_kind, EntityKind::Session);
        assert_eq!(op.entity_id, session.id.to_string());
        assert_eq!(op.attempts, 0);
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.payload["owner_id"], "owner-1");
    }
}
