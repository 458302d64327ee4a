use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path, time::Duration};
use tracing::warn;

use crate::error::{Result, SignalError};
use crate::extract::ExtractionParams;
use crate::schema::{TrackEncoder, VectorSchema};
use crate::scorer::ScoringParams;
use crate::types::SignalKind;

const USA_TRACKS: [&str; 3] = ["Las Vegas Grand Prix", "Miami Grand Prix", "United States Grand Prix"];

const GRID: [&str; 20] = [
    "VER", "HAM", "LEC", "ALO", "SAI", "BOT", "MAG", "NOR", "GAS", "RUS", "OCO", "PER", "TSU", "LAT", "RIC", "ZHO",
    "DEV", "SAI2", "HAM2", "VAR",
];

/// A simulated car and the vector the streaming loop perturbs around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityBaseline {
    pub id: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    pub index_name: String,
    /// Hosted index address; without it the service uses an in-memory index.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default)]
    pub years: Vec<i32>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub entities: Vec<EntityBaseline>,
}

fn default_top_k() -> usize {
    10
}

fn default_tick_ms() -> u64 {
    1000
}

impl SignalConfig {
    pub fn defaults_for(kind: SignalKind) -> Self {
        let tracks = USA_TRACKS.iter().map(|t| t.to_string()).collect();
        let my_car = |vector: Vec<f32>| vec![EntityBaseline { id: "MY_CAR".to_string(), vector }];
        match kind {
            SignalKind::Cliff => SignalConfig {
                index_name: "f1-cliff".to_string(),
                host: None,
                top_k: 30,
                tick_ms: default_tick_ms(),
                years: vec![2022, 2023, 2024],
                tracks,
                entities: my_car(vec![0.88, 0.45, 0.70, 0.78, 0.10, 0.80, 0.35]),
            },
            SignalKind::Undercut => SignalConfig {
                index_name: "f1-cuts".to_string(),
                host: None,
                top_k: 10,
                tick_ms: default_tick_ms(),
                years: vec![2020, 2021, 2022, 2023, 2024],
                tracks,
                entities: my_car(vec![0.9, 12.0 / 60.0, 0.45, 0.3, 0.2, 0.35, 3.0 / 20.0, 0.5, 0.0]),
            },
            SignalKind::Overtake => SignalConfig {
                index_name: "f1-overtake".to_string(),
                host: None,
                top_k: 10,
                tick_ms: default_tick_ms(),
                years: vec![2022, 2023, 2024],
                tracks,
                entities: GRID
                    .iter()
                    .map(|d| EntityBaseline {
                        id: d.to_string(),
                        vector: vec![0.9, 0.45, 0.35, 0.42, 0.50, 0.0],
                    })
                    .collect(),
            },
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub api_key: Option<String>,
    pub batch_size: usize,
    pub query_timeout_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            batch_size: crate::index::DEFAULT_BATCH_SIZE,
            query_timeout_ms: 5000,
        }
    }
}

impl IndexConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub drop_threshold_s: f64,
    pub undercut_team: String,
    pub gap_normalizer_s: f64,
    /// Stable track encoding used while scanning single sessions.
    pub track_map: BTreeMap<String, f32>,
    pub unknown_track: f32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        let params = ExtractionParams::default();
        Self {
            drop_threshold_s: params.drop_threshold_s,
            undercut_team: params.undercut_team,
            gap_normalizer_s: params.gap_normalizer_s,
            track_map: USA_TRACKS.iter().map(|t| t.to_string()).zip([1.0, 0.9, 0.8]).collect(),
            unknown_track: 0.5,
        }
    }
}

impl ExtractionConfig {
    pub fn params(&self) -> ExtractionParams {
        ExtractionParams {
            drop_threshold_s: self.drop_threshold_s,
            undercut_team: self.undercut_team.clone(),
            gap_normalizer_s: self.gap_normalizer_s,
        }
    }

    pub fn track_encoder(&self) -> TrackEncoder {
        TrackEncoder::Fixed {
            map: self.track_map.clone(),
            unknown: self.unknown_track,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub cliff_threshold: f64,
    pub lap_normalizer: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let p = ScoringParams::default();
        Self {
            cliff_threshold: p.cliff_threshold,
            lap_normalizer: p.lap_normalizer,
        }
    }
}

impl ScoringConfig {
    pub fn params(&self) -> ScoringParams {
        ScoringParams {
            cliff_threshold: self.cliff_threshold,
            lap_normalizer: self.lap_normalizer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
    pub timeout_s: u64,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gemini-2.0-flash".to_string(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout_s: 60,
        }
    }
}

/// Process-wide configuration, built once in `main` and shared by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub port: u16,
    pub index: IndexConfig,
    pub cliff: SignalConfig,
    pub undercut: SignalConfig,
    pub overtake: SignalConfig,
    pub extraction: ExtractionConfig,
    pub scoring: ScoringConfig,
    pub advisory: AdvisoryConfig,
    /// Fixes the simulator RNG; unset means entropy-seeded.
    pub seed: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            index: IndexConfig::default(),
            cliff: SignalConfig::defaults_for(SignalKind::Cliff),
            undercut: SignalConfig::defaults_for(SignalKind::Undercut),
            overtake: SignalConfig::defaults_for(SignalKind::Overtake),
            extraction: ExtractionConfig::default(),
            scoring: ScoringConfig::default(),
            advisory: AdvisoryConfig::default(),
            seed: None,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| SignalError::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&data).map_err(|e| SignalError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Loads `path` if it exists, otherwise defaults; then applies environment
    /// overrides and validates.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        Self::resolve_with(path, |k| std::env::var(k).ok())
    }

    pub fn resolve_with(path: Option<&Path>, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => Self::load(p)?,
            Some(p) => {
                warn!("config file {} not found; using defaults", p.display());
                Self::default()
            }
            None => Self::default(),
        };
        cfg.apply_env(lookup);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT").and_then(|s| s.parse().ok()) {
            self.port = port;
        }
        if let Some(key) = lookup("INDEX_API_KEY").or_else(|| lookup("API_KEY")) {
            self.index.api_key = Some(key);
        }
        for kind in SignalKind::ALL {
            let var = format!("INDEX_HOST_{}", kind.as_str().to_ascii_uppercase());
            if let Some(host) = lookup(&var) {
                self.signal_mut(kind).host = Some(host);
            }
        }
        if let Some(key) = lookup("GEMINI_API_KEY") {
            self.advisory.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.index.batch_size == 0 {
            return Err(SignalError::Config("index.batch_size must be at least 1".to_string()));
        }
        for kind in SignalKind::ALL {
            let sig = self.signal(kind);
            if sig.top_k == 0 {
                return Err(SignalError::Config(format!("{kind}.top_k must be at least 1")));
            }
            if sig.entities.is_empty() {
                return Err(SignalError::Config(format!("{kind} has no entities to simulate")));
            }
            let schema = VectorSchema::for_kind(kind);
            for e in &sig.entities {
                schema.validate(&e.vector).map_err(|err| {
                    SignalError::Config(format!("baseline for {} ({kind}): {err}", e.id))
                })?;
            }
        }
        Ok(())
    }

    pub fn signal(&self, kind: SignalKind) -> &SignalConfig {
        match kind {
            SignalKind::Cliff => &self.cliff,
            SignalKind::Undercut => &self.undercut,
            SignalKind::Overtake => &self.overtake,
        }
    }

    fn signal_mut(&mut self, kind: SignalKind) -> &mut SignalConfig {
        match kind {
            SignalKind::Cliff => &mut self.cliff,
            SignalKind::Undercut => &mut self.undercut,
            SignalKind::Overtake => &mut self.overtake,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.overtake.entities.len(), 20);
        assert_eq!(cfg.cliff.top_k, 30);
        assert_eq!(cfg.extraction.track_encoder().encode("Miami Grand Prix"), 0.9);
        assert_eq!(cfg.extraction.track_encoder().encode("Monaco Grand Prix"), 0.5);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let raw = r#"{"port": 9100, "cliff": {"index_name": "cliff-test", "top_k": 5,
                      "entities": [{"id": "ALB", "vector": [0.1,0.2,0.3,0.4,0.0,0.5,0.6]}]}}"#;
        let cfg: AppConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.cliff.top_k, 5);
        assert_eq!(cfg.cliff.tick_ms, 1000);
        assert_eq!(cfg.undercut.index_name, "f1-cuts");
        assert_eq!(cfg.index.batch_size, 1000);
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::resolve_with(Some(&dir.path().join("absent.json")), |_| None).unwrap();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.cliff.top_k, 30);

        let present = dir.path().join("race.json");
        fs::write(&present, r#"{"port": 9200}"#).unwrap();
        let cfg = AppConfig::resolve_with(Some(&present), |k| (k == "PORT").then(|| "9300".to_string())).unwrap();
        assert_eq!(cfg.port, 9300);

        fs::write(&present, "{not json").unwrap();
        assert!(matches!(AppConfig::resolve_with(Some(&present), |_| None), Err(SignalError::Config(_))));
    }

    #[test]
    fn bad_baseline_dimension_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.undercut.entities[0].vector.pop();
        assert!(matches!(cfg.validate(), Err(SignalError::Config(_))));
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PORT", "8123"),
            ("API_KEY", "secret"),
            ("INDEX_HOST_OVERTAKE", "f1-overtake.svc.example.io"),
        ]);
        let mut cfg = AppConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.port, 8123);
        assert_eq!(cfg.index.api_key.as_deref(), Some("secret"));
        assert_eq!(cfg.overtake.host.as_deref(), Some("f1-overtake.svc.example.io"));
        assert!(cfg.cliff.host.is_none());
    }
}
