//! CSV export of session summaries.

use crate::{geo, Result, WorkoutSession};
use std::fs::OpenOptions;
use std::path::Path;

#[derive(Debug, serde::Serialize)]
struct CsvRow {
    id: String,
    owner_id: String,
    mode: String,
    state: String,
    started_at: String,
    completed_at: Option<String>,
    distance_m: String,
    duration_secs: String,
    avg_pace: String,
    failure_reason: Option<String>,
}

impl From<&WorkoutSession> for CsvRow {
    fn from(session: &WorkoutSession) -> Self {
        CsvRow {
            id: session.id.to_string(),
            owner_id: session.owner_id.clone(),
            mode: session.mode.as_str().to_string(),
            state: session.state.to_string(),
            started_at: session.started_at.to_rfc3339(),
            completed_at: session.completed_at.map(|t| t.to_rfc3339()),
            distance_m: format!("{:.1}", session.distance_m),
            duration_secs: format!("{:.0}", session.duration_secs),
            avg_pace: geo::format_pace(session.avg_pace_secs),
            failure_reason: session.failure_reason.clone(),
        }
    }
}

/// Append session summaries to a CSV file, writing the header only when the
/// file is new or empty
///
/// The file is fsynced before returning. Returns the number of rows written.
pub fn write_sessions_csv(sessions: &[WorkoutSession], csv_path: &Path) -> Result<usize> {
    if sessions.is_empty() {
        tracing::info!("No sessions to export");
        return Ok(0);
    }

    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;
    let needs_headers = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);
    for session in sessions {
        writer.serialize(CsvRow::from(session))?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!("Exported {} sessions to {:?}", sessions.len(), csv_path);
    Ok(sessions.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActivityMode, SessionState};

    fn finished(distance_m: f64, duration_secs: f64) -> WorkoutSession {
        let mut session = WorkoutSession::new("athlete-1", ActivityMode::Outdoor, serde_json::Value::Null);
        session.state = SessionState::Completed;
        session.distance_m = distance_m;
        session.duration_secs = duration_secs;
        session.avg_pace_secs = geo::pace_secs(duration_secs, distance_m);
        session
    }

    #[test]
    fn test_header_written_once_across_appends() {
        let temp_dir = tempfile::tempdir().unwrap();
        let csv_path = temp_dir.path().join("out").join("sessions.csv");

        assert_eq!(write_sessions_csv(&[finished(240.0, 60.0)], &csv_path).unwrap(), 1);
        assert_eq!(write_sessions_csv(&[finished(1000.0, 250.0)], &csv_path).unwrap(), 1);

        let content = std::fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,owner_id,mode,state"));
        assert_eq!(lines.iter().filter(|l| l.starts_with("id,")).count(), 1);
        assert!(lines[1].contains(",outdoor,completed,"));
        assert!(lines[1].contains("240.0"));
        assert!(lines[2].contains("2:05 /500m"));
    }

    #[test]
    fn test_empty_export_creates_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let csv_path = temp_dir.path().join("sessions.csv");
        assert_eq!(write_sessions_csv(&[], &csv_path).unwrap(), 0);
        assert!(!csv_path.exists());
    }
}
