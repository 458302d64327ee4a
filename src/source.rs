use std::{fs, path::PathBuf};

use crate::error::{Result, SignalError};
use crate::types::Session;

/// Upstream provider of race sessions (lap and weather records).
pub trait TelemetrySource: Send + Sync {
    /// Loads the race session of `track` in `year`. Any failure is reported
    /// as [`SignalError::SourceUnavailable`] so batch callers can skip it.
    fn load_session(&self, year: i32, track: &str) -> Result<Session>;
}

/// Reads sessions exported as JSON files laid out as
/// `<root>/<year>/<track_slug>.json`.
#[derive(Debug, Clone)]
pub struct JsonSessionDir {
    root: PathBuf,
}

impl JsonSessionDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn session_path(&self, year: i32, track: &str) -> PathBuf {
        self.root.join(year.to_string()).join(format!("{}.json", track_slug(track)))
    }
}

impl TelemetrySource for JsonSessionDir {
    fn load_session(&self, year: i32, track: &str) -> Result<Session> {
        let unavailable = |reason: String| SignalError::SourceUnavailable {
            year,
            track: track.to_string(),
            reason,
        };

        let path = self.session_path(year, track);
        let data = fs::read_to_string(&path)
            .map_err(|e| unavailable(format!("failed to read {}: {e}", path.display())))?;
        let session: Session = serde_json::from_str(&data)
            .map_err(|e| unavailable(format!("failed to parse {}: {e}", path.display())))?;
        if session.laps.is_empty() {
            return Err(unavailable("session has no laps".to_string()));
        }
        Ok(session)
    }
}

/// "United States Grand Prix" -> "united_states_grand_prix"
pub fn track_slug(track: &str) -> String {
    track
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_is_filesystem_friendly() {
        assert_eq!(track_slug("United States Grand Prix"), "united_states_grand_prix");
        assert_eq!(track_slug(" Miami Grand Prix "), "miami_grand_prix");
    }

    #[test]
    fn missing_session_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let src = JsonSessionDir::new(dir.path());
        let err = src.load_session(2023, "Miami Grand Prix").unwrap_err();
        assert!(matches!(err, SignalError::SourceUnavailable { year: 2023, .. }));
    }

    #[test]
    fn reads_session_json() {
        let dir = tempfile::tempdir().unwrap();
        let src = JsonSessionDir::new(dir.path());
        let path = src.session_path(2024, "Miami Grand Prix");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"{"year":2024,"event_name":"Miami Grand Prix",
                "laps":[{"driver":"ALB","team":"Williams","lap_number":1,"position":12,
                         "compound":"MEDIUM","tyre_life":1,"stint":1,"lap_time_s":95.1,"time_s":95.1}],
                "weather":[{"time_s":60.0,"track_temp":44.0,"rainfall":false}]}"#,
        )
        .unwrap();
        let session = src.load_session(2024, "Miami Grand Prix").unwrap();
        assert_eq!(session.laps.len(), 1);
        assert_eq!(session.laps[0].sector_times_s, [None, None, None]);
        assert_eq!(session.max_lap(), 1);
    }
}
