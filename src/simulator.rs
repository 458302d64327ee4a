//! Live telemetry simulation: perturb each entity's baseline vector every
//! tick, query the index and score the neighbours.

use futures::future::join_all;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, EntityBaseline};
use crate::error::Result;
use crate::index::SignalIndex;
use crate::schema::{Noise, VectorSchema};
use crate::scorer::{score, RiskSummary, ScoringParams};
use crate::types::SignalKind;

/// Baselines plus the tick counter of one streaming session.
#[derive(Debug, Clone)]
pub struct SimulationState {
    baselines: Vec<EntityBaseline>,
    tick: u64,
}

impl SimulationState {
    pub fn new(kind: SignalKind, baselines: Vec<EntityBaseline>) -> Result<Self> {
        let schema = VectorSchema::for_kind(kind);
        for b in &baselines {
            schema.validate(&b.vector)?;
        }
        Ok(Self { baselines, tick: 0 })
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn entities(&self) -> &[EntityBaseline] {
        &self.baselines
    }

    /// Bumps the tick counter and returns one perturbed vector per entity.
    pub fn advance<R: Rng>(&mut self, schema: &VectorSchema, rng: &mut R) -> Vec<(String, Vec<f32>)> {
        self.tick += 1;
        self.baselines
            .iter()
            .map(|b| (b.id.clone(), perturb(schema, &b.vector, rng)))
            .collect()
    }
}

/// Fixed components are copied unchanged; every other component gets
/// uniform noise from its range and is clamped into [0, 1].
pub fn perturb<R: Rng>(schema: &VectorSchema, baseline: &[f32], rng: &mut R) -> Vec<f32> {
    schema
        .components
        .iter()
        .zip(baseline)
        .map(|(c, &base)| match c.noise {
            Noise::Fixed => base,
            Noise::Symmetric(r) => (base + rng.gen_range(-r..=r)).clamp(c.lower, c.upper),
            Noise::Upward(r) => (base + rng.gen_range(0.0..=r)).clamp(c.lower, c.upper),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EntityOutcome {
    Scored(RiskSummary),
    /// The index failed for this entity on this tick.
    Degraded { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct EntitySignal {
    #[serde(flatten)]
    pub outcome: EntityOutcome,
    pub simulated_vector: Vec<f32>,
}

/// One outbound message: entity id -> signal, plus `refresh_count`.
#[derive(Debug, Clone, Serialize)]
pub struct TickMessage {
    #[serde(flatten)]
    pub entities: BTreeMap<String, EntitySignal>,
    pub refresh_count: u64,
}

impl TickMessage {
    pub fn degraded(&self) -> usize {
        self.entities
            .values()
            .filter(|s| matches!(s.outcome, EntityOutcome::Degraded { .. }))
            .count()
    }
}

pub struct StreamLoop {
    index: SignalIndex,
    state: SimulationState,
    top_k: usize,
    interval: Duration,
    scoring: ScoringParams,
    rng: StdRng,
    log_vectors: bool,
}

impl StreamLoop {
    pub fn new(
        index: SignalIndex,
        baselines: Vec<EntityBaseline>,
        top_k: usize,
        interval: Duration,
        scoring: ScoringParams,
        seed: Option<u64>,
    ) -> Result<Self> {
        let state = SimulationState::new(index.kind(), baselines)?;
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            index,
            state,
            top_k,
            interval,
            scoring,
            rng,
            log_vectors: std::env::var("LOG_VECTORS").ok().as_deref() == Some("1"),
        })
    }

    pub fn from_config(config: &AppConfig, index: SignalIndex) -> Result<Self> {
        let sig = config.signal(index.kind());
        Self::new(
            index,
            sig.entities.clone(),
            sig.top_k,
            sig.tick_interval(),
            config.scoring.params(),
            config.seed,
        )
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    /// Perturb, query every entity concurrently, score. Index failures
    /// degrade only the affected entity.
    pub async fn tick(&mut self) -> TickMessage {
        let kind = self.index.kind();
        let schema = VectorSchema::for_kind(kind);
        let vectors = self.state.advance(schema, &mut self.rng);

        let index = &self.index;
        let top_k = self.top_k;
        let results = join_all(vectors.iter().map(|(_, v)| index.query(v, top_k))).await;

        let mut entities = BTreeMap::new();
        for ((id, vector), result) in vectors.into_iter().zip(results) {
            if self.log_vectors {
                log_vector(schema, &id, &vector);
            }
            let outcome = match result {
                Ok(matches) => EntityOutcome::Scored(score(kind, &matches, &vector, &id, &self.scoring)),
                Err(e) => {
                    if e.is_index_failure() {
                        warn!("{kind} query failed for {id}: {e}");
                    } else {
                        error!("{kind} vector for {id} rejected: {e}");
                    }
                    EntityOutcome::Degraded { error: e.to_string() }
                }
            };
            entities.insert(id, EntitySignal { outcome, simulated_vector: vector });
        }

        TickMessage {
            entities,
            refresh_count: self.state.tick(),
        }
    }

    /// Emits one message per tick until `cancel` fires or the receiver is dropped.
    pub async fn run(mut self, tx: mpsc::Sender<TickMessage>, cancel: CancellationToken) {
        let kind = self.index.kind();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("{kind} stream started: {} entities every {:?}", self.state.entities().len(), self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                m = self.tick() => m,
            };
            let degraded = message.degraded();
            if degraded > 0 {
                warn!(
                    "{kind} tick {}: {degraded}/{} entities degraded",
                    message.refresh_count,
                    message.entities.len()
                );
            }
            if tx.send(message).await.is_err() {
                debug!("{kind} stream receiver dropped");
                break;
            }
        }
        info!("{kind} stream stopped after {} ticks", self.state.tick());
    }
}

fn log_vector(schema: &VectorSchema, id: &str, v: &[f32]) {
    let n = v.len().max(1) as f32;
    let mean = v.iter().sum::<f32>() / n;
    let std = (v.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n).sqrt();
    let nz = v.iter().filter(|x| **x != 0.0).count();
    let sample: Vec<String> = schema
        .names()
        .zip(v)
        .take(6)
        .map(|(name, x)| format!("{name}={x:.3}"))
        .collect();
    info!(
        "sim {id} dim={} nonzero={nz} mean={mean:.3} std={std:.3} sample=[{}]",
        v.len(),
        sample.join(", ")
    );
}
