//! Reducers turning one query's neighbours into a bounded signal.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::SignalIndex;
use crate::schema::VectorSchema;
use crate::types::{IndexMatch, SignalKind};

pub const CLIFF_RISK_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringParams {
    /// Max similarity above which a tire cliff is flagged.
    pub cliff_threshold: f64,
    /// Divides `Rival_Pitted_Lap` to compare it with the lap component.
    pub lap_normalizer: f64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            cliff_threshold: CLIFF_RISK_THRESHOLD,
            lap_normalizer: 60.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliffRisk {
    pub matches_found: usize,
    /// Rounded to 3 decimals.
    pub max_similarity: f64,
    pub risk_detected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Recommendation {
    /// Analogues exist where the rival had not yet pitted.
    Pit { success_ratio: f64 },
    Hold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndercutOutlook {
    pub total_matches: usize,
    pub relevant_matches: usize,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OvertakePropensity {
    /// How often the driver shows up among its own nearest historical neighbours.
    pub appearances: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RiskSummary {
    Cliff(CliffRisk),
    Undercut(UndercutOutlook),
    Overtake(OvertakePropensity),
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

pub fn score_cliff(matches: &[IndexMatch], threshold: f64) -> CliffRisk {
    let max_score = matches
        .iter()
        .map(|m| m.score as f64)
        .fold(0.0_f64, f64::max);
    CliffRisk {
        matches_found: matches.len(),
        max_similarity: round3(max_score),
        risk_detected: max_score > threshold,
    }
}

/// `lap_component` is the normalized lap of the queried vector. A match is
/// relevant when its rival pitted later than that, relative to `lap_normalizer`.
pub fn score_undercut(matches: &[IndexMatch], lap_component: f32, lap_normalizer: f64) -> UndercutOutlook {
    let relevant = matches
        .iter()
        .filter(|m| {
            let rival_lap = m
                .metadata
                .as_ref()
                .and_then(|meta| meta.rival_pitted_lap)
                .unwrap_or(0) as f64;
            lap_normalizer > 0.0 && rival_lap / lap_normalizer > lap_component as f64
        })
        .count();

    let total = matches.len();
    let recommendation = if relevant < total {
        Recommendation::Pit {
            success_ratio: relevant as f64 / total as f64,
        }
    } else {
        Recommendation::Hold
    };

    UndercutOutlook {
        total_matches: total,
        relevant_matches: relevant,
        recommendation,
    }
}

pub fn score_overtake(matches: &[IndexMatch], driver: &str) -> OvertakePropensity {
    let appearances = matches
        .iter()
        .filter(|m| m.metadata.as_ref().is_some_and(|meta| meta.driver == driver))
        .count();
    OvertakePropensity { appearances }
}

/// Dispatches to the reducer for `kind`. `vector` must already satisfy the schema.
pub fn score(kind: SignalKind, matches: &[IndexMatch], vector: &[f32], driver: &str, params: &ScoringParams) -> RiskSummary {
    match kind {
        SignalKind::Cliff => RiskSummary::Cliff(score_cliff(matches, params.cliff_threshold)),
        SignalKind::Undercut => {
            let lap_idx = VectorSchema::for_kind(kind).position("LapNumber").unwrap_or(1);
            let lap_component = vector.get(lap_idx).copied().unwrap_or(0.0);
            RiskSummary::Undercut(score_undercut(matches, lap_component, params.lap_normalizer))
        }
        SignalKind::Overtake => RiskSummary::Overtake(score_overtake(matches, driver)),
    }
}

/// Result of a one-shot query, without the perturbation loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub matches: Vec<IndexMatch>,
    pub summary: RiskSummary,
}

pub async fn assess(
    index: &SignalIndex,
    vector: &[f32],
    top_k: usize,
    driver: &str,
    params: &ScoringParams,
) -> Result<Assessment> {
    let matches = index.query(vector, top_k).await?;
    let summary = score(index.kind(), &matches, vector, driver, params);
    Ok(Assessment { matches, summary })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventMetadata;

    fn hit(score: f32, driver: &str, rival_lap: Option<i64>) -> IndexMatch {
        IndexMatch {
            id: format!("{driver}-{score}"),
            score,
            metadata: Some(EventMetadata {
                driver: driver.to_string(),
                rival_pitted_lap: rival_lap,
                ..EventMetadata::default()
            }),
        }
    }

    #[test]
    fn cliff_empty_and_flagged() {
        let empty = score_cliff(&[], CLIFF_RISK_THRESHOLD);
        assert_eq!(empty, CliffRisk { matches_found: 0, max_similarity: 0.0, risk_detected: false });

        let risky = score_cliff(&[hit(0.9, "ALB", None), hit(0.5, "SAR", None)], CLIFF_RISK_THRESHOLD);
        assert!(risky.risk_detected);
        assert_eq!(risky.max_similarity, 0.9);
        assert_eq!(risky.matches_found, 2);

        let calm = score_cliff(&[hit(0.84, "ALB", None)], CLIFF_RISK_THRESHOLD);
        assert!(!calm.risk_detected);
    }

    #[test]
    fn undercut_recommends_pit_when_some_analogues_lack_edge() {
        // lap component 0.2 -> lap 12 of 60
        let hits = [hit(0.9, "ALB", Some(20)), hit(0.8, "ALB", Some(10)), hit(0.7, "SAR", None)];
        let outlook = score_undercut(&hits, 0.2, 60.0);
        assert_eq!(outlook.total_matches, 3);
        assert_eq!(outlook.relevant_matches, 1);
        match outlook.recommendation {
            Recommendation::Pit { success_ratio } => assert!((success_ratio - 1.0 / 3.0).abs() < 1e-9),
            Recommendation::Hold => panic!("expected pit"),
        }

        let all_relevant = score_undercut(&[hit(0.9, "ALB", Some(30))], 0.2, 60.0);
        assert_eq!(all_relevant.recommendation, Recommendation::Hold);

        let empty = score_undercut(&[], 0.2, 60.0);
        assert_eq!((empty.total_matches, empty.relevant_matches), (0, 0));
        assert_eq!(empty.recommendation, Recommendation::Hold);
    }

    #[test]
    fn undercut_reads_lap_from_second_component() {
        let hits = [hit(0.9, "ALB", Some(20)), hit(0.8, "ALB", Some(10)), hit(0.7, "SAR", None)];
        let params = ScoringParams::default();
        let relevant_at = |lap: f32| {
            let mut vector = vec![0.0; 9];
            vector[1] = lap;
            match score(SignalKind::Undercut, &hits, &vector, "MY_CAR", &params) {
                RiskSummary::Undercut(u) => u.relevant_matches,
                other => panic!("unexpected {other:?}"),
            }
        };

        // lap 6: both rivals pitted later
        assert_eq!(relevant_at(0.1), 2);
        // lap 15: only the lap 20 rival
        assert_eq!(relevant_at(0.25), 1);
        // lap 30: none
        assert_eq!(relevant_at(0.5), 0);

        let both_later = [hit(0.9, "ALB", Some(20)), hit(0.8, "ALB", Some(10))];
        let mut early = vec![0.9; 9];
        early[1] = 0.0;
        match score(SignalKind::Undercut, &both_later, &early, "MY_CAR", &params) {
            RiskSummary::Undercut(u) => assert_eq!(u.recommendation, Recommendation::Hold),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn overtake_counts_self_appearances() {
        let hits = [hit(0.9, "HAM", None), hit(0.8, "VER", None), hit(0.7, "HAM", None)];
        assert_eq!(score_overtake(&hits, "HAM").appearances, 2);
        assert_eq!(score_overtake(&hits, "LEC").appearances, 0);
        assert_eq!(score_overtake(&[], "HAM").appearances, 0);
    }

    #[test]
    fn summaries_serialize_flat() {
        let v = serde_json::to_value(RiskSummary::Cliff(score_cliff(&[hit(0.91234, "ALB", None)], 0.85))).unwrap();
        assert_eq!(v["max_similarity"], 0.912);
        assert_eq!(v["risk_detected"], true);

        let v = serde_json::to_value(score_undercut(&[hit(0.9, "ALB", Some(1))], 0.2, 60.0)).unwrap();
        assert_eq!(v["recommendation"]["action"], "pit");
        assert_eq!(v["recommendation"]["success_ratio"], 0.0);
    }

    #[tokio::test]
    async fn assess_queries_then_scores() {
        use crate::index::{IndexRecord, MemoryIndex};
        use std::sync::Arc;

        let index = SignalIndex::new(SignalKind::Cliff, Arc::new(MemoryIndex::new()));
        let stored = vec![0.9, 0.2, 0.7, 0.8, 0.0, 0.8, 0.35];
        index
            .upsert_batched(&[IndexRecord {
                id: "2023_0".to_string(),
                values: stored.clone(),
                metadata: EventMetadata::default(),
            }])
            .await
            .unwrap();

        let a = assess(&index, &stored, 5, "MY_CAR", &ScoringParams::default()).await.unwrap();
        assert_eq!(a.matches.len(), 1);
        match a.summary {
            RiskSummary::Cliff(c) => assert!(c.risk_detected),
            other => panic!("unexpected {other:?}"),
        }

        assert!(assess(&index, &[0.5; 3], 5, "MY_CAR", &ScoringParams::default()).await.is_err());
    }
}
