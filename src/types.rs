use serde::{Deserialize, Deserializer, Serialize};
use std::{fmt, str::FromStr};

use crate::error::SignalError;

/// The three strategy signals the service derives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Cliff,
    Undercut,
    Overtake,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [SignalKind::Cliff, SignalKind::Undercut, SignalKind::Overtake];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Cliff => "cliff",
            SignalKind::Undercut => "undercut",
            SignalKind::Overtake => "overtake",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cliff" => Ok(SignalKind::Cliff),
            "undercut" | "undercuts" | "cuts" => Ok(SignalKind::Undercut),
            "overtake" | "overtakes" => Ok(SignalKind::Overtake),
            other => Err(SignalError::Config(format!("unknown signal kind '{other}'"))),
        }
    }
}

/// Tire compound as reported by the timing feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compound {
    Soft,
    Medium,
    Hard,
    Intermediate,
    Wet,
    #[default]
    Unknown,
}

impl Compound {
    pub const RANKS: u8 = 5;

    /// Parses the feed's compound name; anything unrecognised is `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "SOFT" => Compound::Soft,
            "MEDIUM" => Compound::Medium,
            "HARD" => Compound::Hard,
            "INTERMEDIATE" => Compound::Intermediate,
            "WET" => Compound::Wet,
            _ => Compound::Unknown,
        }
    }

    /// SOFT=1 .. WET=5, unknown 0.
    pub fn rank(&self) -> u8 {
        match self {
            Compound::Soft => 1,
            Compound::Medium => 2,
            Compound::Hard => 3,
            Compound::Intermediate => 4,
            Compound::Wet => 5,
            Compound::Unknown => 0,
        }
    }

    pub fn from_rank(rank: u8) -> Self {
        match rank {
            1 => Compound::Soft,
            2 => Compound::Medium,
            3 => Compound::Hard,
            4 => Compound::Intermediate,
            5 => Compound::Wet,
            _ => Compound::Unknown,
        }
    }
}

/// One driver's state at the end of one lap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapRecord {
    pub driver: String,
    pub team: String,
    pub lap_number: u32,
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub compound: Option<String>, // e.g. "SOFT", "MEDIUM", "INTERMEDIATE"
    #[serde(default)]
    pub tyre_life: Option<f64>, // laps on this set
    #[serde(default)]
    pub stint: Option<u32>,
    #[serde(default)]
    pub lap_time_s: Option<f64>,
    #[serde(default)]
    pub sector_times_s: [Option<f64>; 3],
    /// Session time (seconds) at which the lap was set.
    pub time_s: f64,
}

impl LapRecord {
    pub fn compound(&self) -> Compound {
        self.compound
            .as_deref()
            .map(Compound::from_name)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSample {
    pub time_s: f64,
    #[serde(default)]
    pub air_temp: Option<f64>,
    #[serde(default)]
    pub track_temp: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub wind_speed: Option<f64>,
    #[serde(default)]
    pub rainfall: bool,
}

/// One race session as delivered by the telemetry source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub year: i32,
    pub event_name: String,
    pub laps: Vec<LapRecord>,
    #[serde(default)]
    pub weather: Vec<WeatherSample>,
}

impl Session {
    pub fn max_lap(&self) -> u32 {
        self.laps.iter().map(|l| l.lap_number).max().unwrap_or(0)
    }
}

/// Metadata stored next to every vector in the index.
///
/// Field names match the columns of the historical CSV files so that
/// metadata round-trips through both the CSV and the index unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMetadata {
    #[serde(rename = "Driver")]
    pub driver: String,
    #[serde(rename = "Team")]
    pub team: String,
    #[serde(rename = "TrackName")]
    pub track_name: String,
    #[serde(rename = "Year", deserialize_with = "lenient_i64")]
    pub year: i64,
    #[serde(rename = "LapNumber", deserialize_with = "lenient_i64")]
    pub lap_number: i64,
    #[serde(rename = "LapTimeLoss", skip_serializing_if = "Option::is_none")]
    pub lap_time_loss: Option<f64>,
    #[serde(
        rename = "Rival_Pitted_Lap",
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_opt_i64"
    )]
    pub rival_pitted_lap: Option<i64>,
}

/// A detected historical event, ready for the index.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub kind: SignalKind,
    pub vector: Vec<f32>,
    pub metadata: EventMetadata,
}

/// One neighbour returned by a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMatch {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Option<EventMetadata>,
}

// Index services commonly hand numeric metadata back as floats (2023.0).
fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    Ok(lenient_opt_i64(d)?.unwrap_or(0))
}

fn lenient_opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let v = Option::<f64>::deserialize(d)?;
    Ok(v.filter(|x| x.is_finite()).map(|x| x.round() as i64))
}
