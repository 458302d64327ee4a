//! Fixed-order feature schemas for each signal and the normalization rules
//! that produce their components.
//!
//! Two normalization modes exist and are kept separate on purpose:
//!
//! * **single-session** – each raw quantity is divided by a fixed
//!   domain ceiling (`track_temp / 80`, `tyre_life / 60`, ...) while a
//!   session is being scanned for events;
//! * **aggregate** – once all sessions of a batch are combined, selected
//!   components are min-max scaled over the whole batch (see
//!   [`AggregationPlan`]).

use std::collections::{BTreeMap, HashMap};

use crate::error::{Result, SignalError};
use crate::types::{Compound, SignalKind};

pub const POSITION_CEILING: f64 = 20.0;
pub const TYRE_LIFE_CEILING: f64 = 60.0;
pub const TRACK_TEMP_CEILING: f64 = 80.0;

/// How the streaming simulator is allowed to move a component each tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Noise {
    /// Never perturbed (track identity).
    Fixed,
    /// Uniform in `[-r, +r]`.
    Symmetric(f32),
    /// Uniform in `[0, +r]`.
    Upward(f32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Component {
    pub name: &'static str,
    /// Bounds of the single-session encoding. Aggregated vectors are always in [0, 1].
    pub lower: f32,
    pub upper: f32,
    pub noise: Noise,
}

const fn unit(name: &'static str, noise: Noise) -> Component {
    Component { name, lower: 0.0, upper: 1.0, noise }
}

const CLIFF: [Component; 7] = [
    unit("TrackNormalized", Noise::Fixed),
    unit("Compound", Noise::Symmetric(0.05)),
    unit("TyreLife", Noise::Symmetric(0.1)),
    unit("TrackTemp", Noise::Symmetric(0.1)),
    unit("Rainfall", Noise::Upward(0.05)),
    unit("LapNumber", Noise::Symmetric(0.05)),
    unit("Position", Noise::Symmetric(0.05)),
];

const UNDERCUT: [Component; 9] = [
    unit("TrackNormalized", Noise::Fixed),
    unit("LapNumber", Noise::Symmetric(0.05)),
    unit("Position", Noise::Symmetric(0.1)),
    unit("NewTireCompound", Noise::Symmetric(0.05)),
    unit("Rival_Compound", Noise::Symmetric(0.05)),
    unit("Rival_TyreLife", Noise::Symmetric(0.1)),
    Component {
        name: "GapToRival_BeforePit",
        lower: -1.0,
        upper: 1.0,
        noise: Noise::Symmetric(0.1),
    },
    unit("TrackTemp", Noise::Symmetric(0.05)),
    unit("Rainfall", Noise::Upward(0.05)),
];

const OVERTAKE: [Component; 6] = [
    unit("TrackNormalized", Noise::Fixed),
    unit("Position", Noise::Symmetric(0.05)),
    unit("Compound", Noise::Symmetric(0.05)),
    unit("TyreLife", Noise::Symmetric(0.1)),
    unit("TrackTemp", Noise::Symmetric(0.1)),
    unit("Rainfall", Noise::Upward(0.1)),
];

#[derive(Debug)]
pub struct VectorSchema {
    pub kind: SignalKind,
    pub components: &'static [Component],
}

static CLIFF_SCHEMA: VectorSchema = VectorSchema { kind: SignalKind::Cliff, components: &CLIFF };
static UNDERCUT_SCHEMA: VectorSchema = VectorSchema { kind: SignalKind::Undercut, components: &UNDERCUT };
static OVERTAKE_SCHEMA: VectorSchema = VectorSchema { kind: SignalKind::Overtake, components: &OVERTAKE };

impl VectorSchema {
    pub fn for_kind(kind: SignalKind) -> &'static VectorSchema {
        match kind {
            SignalKind::Cliff => &CLIFF_SCHEMA,
            SignalKind::Undercut => &UNDERCUT_SCHEMA,
            SignalKind::Overtake => &OVERTAKE_SCHEMA,
        }
    }

    pub fn dimension(&self) -> usize {
        self.components.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.components.iter().map(|c| c.name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.components.iter().position(|c| c.name == name)
    }

    /// Rejects vectors whose length differs from the schema, that carry
    /// non-finite values, or that leave a component's declared bounds.
    /// Must run before anything reaches the index.
    pub fn validate(&self, values: &[f32]) -> Result<()> {
        if values.len() != self.dimension() {
            return Err(SignalError::SchemaMismatch {
                kind: self.kind,
                got: values.len(),
                expected: self.dimension(),
            });
        }
        if let Some((i, _)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(SignalError::MalformedRecord(format!(
                "{} component {} is not finite",
                self.kind, self.components[i].name
            )));
        }
        if let Some((c, v)) = self
            .components
            .iter()
            .zip(values)
            .find(|(c, v)| **v < c.lower || **v > c.upper)
        {
            return Err(SignalError::MalformedRecord(format!(
                "{} component {} = {v} outside [{}, {}]",
                self.kind, c.name, c.lower, c.upper
            )));
        }
        Ok(())
    }
}

// ---------- single-session rules ----------

/// Missing or non-finite raw values become 0, then `raw / ceiling` is
/// clamped into [0, 1].
pub fn by_ceiling(raw: Option<f64>, ceiling: f64) -> f32 {
    bounded(raw, ceiling, 0.0, 1.0)
}

/// Same as [`by_ceiling`] for signed quantities such as gaps, clamped into [-1, 1].
pub fn signed_by_ceiling(raw: Option<f64>, ceiling: f64) -> f32 {
    bounded(raw, ceiling, -1.0, 1.0)
}

fn bounded(raw: Option<f64>, ceiling: f64, lo: f64, hi: f64) -> f32 {
    let raw = raw.filter(|v| v.is_finite()).unwrap_or(0.0);
    if ceiling <= 0.0 || !ceiling.is_finite() {
        return 0.0;
    }
    (raw / ceiling).clamp(lo, hi) as f32
}

/// Pre-scaled compound encoding used during extraction: SOFT 0.1 .. WET 0.5.
pub fn compound_scaled(compound: Compound) -> f32 {
    compound.rank() as f32 / 10.0
}

/// Rank encoding used by the aggregate step: rank / rank count.
pub fn compound_rank_fraction(compound: Compound) -> f32 {
    compound.rank() as f32 / Compound::RANKS as f32
}

/// Reads a pre-scaled compound value back into its compound.
pub fn compound_from_scaled(value: f32) -> Compound {
    if !value.is_finite() || value <= 0.0 {
        return Compound::Unknown;
    }
    Compound::from_rank((value * 10.0).round().clamp(0.0, 255.0) as u8)
}

pub fn rainfall_flag(raining: bool) -> f32 {
    if raining {
        1.0
    } else {
        0.0
    }
}

// ---------- track identity ----------

/// Encodes a track name into a single component.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEncoder {
    /// Stable mapping configured up front; unknown tracks get `unknown`.
    Fixed {
        map: BTreeMap<String, f32>,
        unknown: f32,
    },
    /// First-seen order within one batch, `index / (count - 1)`. The
    /// encoding changes whenever the set of tracks in the batch changes.
    BatchRelative { order: Vec<String> },
}

impl TrackEncoder {
    pub fn batch_relative<'a>(tracks: impl IntoIterator<Item = &'a str>) -> Self {
        let mut order: Vec<String> = Vec::new();
        for t in tracks {
            if !order.iter().any(|seen| seen == t) {
                order.push(t.to_string());
            }
        }
        TrackEncoder::BatchRelative { order }
    }

    pub fn encode(&self, track: &str) -> f32 {
        match self {
            TrackEncoder::Fixed { map, unknown } => map.get(track).copied().unwrap_or(*unknown).clamp(0.0, 1.0),
            TrackEncoder::BatchRelative { order } => {
                let Some(idx) = order.iter().position(|t| t == track) else {
                    return 0.0;
                };
                // a single track has nowhere to spread; keep it at 0
                if order.len() < 2 {
                    return 0.0;
                }
                idx as f32 / (order.len() - 1) as f32
            }
        }
    }
}

// ---------- aggregate (global min-max) ----------

/// Observed range of one column across a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinMax {
    pub min: f32,
    pub max: f32,
}

impl MinMax {
    /// Fits over the finite values of a column; `None` for an empty column.
    pub fn fit(values: impl IntoIterator<Item = f32>) -> Option<Self> {
        values
            .into_iter()
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| match acc {
                None => Some(MinMax { min: v, max: v }),
                Some(m) => Some(MinMax { min: m.min.min(v), max: m.max.max(v) }),
            })
    }

    /// Constant columns scale to 0.
    pub fn apply(&self, v: f32) -> f32 {
        if !v.is_finite() {
            return 0.0;
        }
        let span = self.max - self.min;
        if span <= f32::EPSILON {
            return 0.0;
        }
        ((v - self.min) / span).clamp(0.0, 1.0)
    }
}

/// Which components the aggregate step rescales for a signal.
#[derive(Debug, Clone, Copy)]
pub struct AggregationPlan {
    /// Components re-encoded from the pre-scaled compound value to rank / 5.
    pub rank_compound: &'static [&'static str],
    /// Components min-max scaled over the combined batch.
    pub min_max: &'static [&'static str],
}

impl AggregationPlan {
    pub fn for_kind(kind: SignalKind) -> Self {
        match kind {
            SignalKind::Cliff => AggregationPlan {
                rank_compound: &["Compound"],
                min_max: &["TyreLife", "TrackTemp", "Rainfall", "LapNumber", "Position"],
            },
            SignalKind::Undercut => AggregationPlan {
                rank_compound: &[],
                min_max: &[
                    "LapNumber",
                    "Position",
                    "NewTireCompound",
                    "Rival_Compound",
                    "Rival_TyreLife",
                    "GapToRival_BeforePit",
                    "TrackTemp",
                    "Rainfall",
                ],
            },
            SignalKind::Overtake => AggregationPlan {
                rank_compound: &["Compound"],
                min_max: &["Position", "TyreLife", "TrackTemp", "Rainfall"],
            },
        }
    }

    /// Applies the plan in place over a batch of same-kind vectors. The
    /// `TrackNormalized` component is re-encoded batch-relative from `tracks`.
    pub fn apply(&self, kind: SignalKind, vectors: &mut [Vec<f32>], tracks: &[&str]) {
        let schema = VectorSchema::for_kind(kind);

        if let Some(track_idx) = schema.position("TrackNormalized") {
            let encoder = TrackEncoder::batch_relative(tracks.iter().copied());
            for (v, track) in vectors.iter_mut().zip(tracks) {
                v[track_idx] = encoder.encode(track);
            }
        }

        for name in self.rank_compound {
            if let Some(idx) = schema.position(name) {
                for v in vectors.iter_mut() {
                    v[idx] = compound_rank_fraction(compound_from_scaled(v[idx]));
                }
            }
        }

        let ranges: HashMap<usize, MinMax> = self
            .min_max
            .iter()
            .filter_map(|name| schema.position(name))
            .filter_map(|idx| MinMax::fit(vectors.iter().map(|v| v[idx])).map(|m| (idx, m)))
            .collect();
        for v in vectors.iter_mut() {
            for (idx, range) in &ranges {
                v[*idx] = range.apply(v[*idx]);
            }
            for x in v.iter_mut() {
                if !x.is_finite() {
                    *x = 0.0;
                }
            }
        }
    }
}
