//! Structured inputs for the strategy text generator.
//!
//! The service only assembles the prompt from the three aggregated signal
//! payloads; the prose itself comes from an external model behind
//! [`TextGenerator`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, warn};

use crate::config::AdvisoryConfig;
use crate::error::{Result, SignalError};
use crate::scorer::CliffRisk;

/// Undercut payload as the dashboard forwards it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PitSignal {
    pub total_matches: usize,
    pub relevant_matches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyInput {
    /// Per-driver overtake payloads, passed through verbatim.
    #[serde(default)]
    pub overtake_data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub tire_data: CliffRisk,
    #[serde(default)]
    pub pit_data: PitSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyResponse {
    pub strategy: String,
}

pub fn cliff_risk_level(tire: &CliffRisk) -> &'static str {
    if tire.risk_detected {
        "High"
    } else {
        "Low"
    }
}

pub fn undercut_verdict(pit: &PitSignal) -> String {
    if pit.relevant_matches < pit.total_matches {
        format!(
            "Recommended: Pit (Undercut successful in {}/{} scenarios)",
            pit.relevant_matches, pit.total_matches
        )
    } else {
        "Safe: No similar scenarios where rival is yet to pit".to_string()
    }
}

fn pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

pub fn build_strategy_prompt(input: &StrategyInput) -> String {
    format!(
        "ROLE: You are the chief race strategist of a Formula 1 team.\n\n\
         CURRENT AGGREGATED RACE SITUATION:\n\
         - Overtake likelihood per driver:\n{}\n\n\
         - Tire cliff risk:\n{} -> Risk level: {}\n\n\
         - Pit stop insight (undercut/overcut):\n{} -> {}\n\n\
         TASK: In one or two lines, give a strategic recommendation covering the \
         immediate tire cliff risk, the pit window (undercut or overcut) and the best next move.\n",
        pretty(&input.overtake_data),
        pretty(&input.tire_data),
        cliff_risk_level(&input.tire_data),
        pretty(&input.pit_data),
        undercut_verdict(&input.pit_data),
    )
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Gemini `generateContent` REST client.
pub struct GeminiGenerator {
    endpoint: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct GenerateReply {
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Candidate {
    content: ReplyContent,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ReplyContent {
    parts: Vec<ReplyPart>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ReplyPart {
    text: String,
}

impl GeminiGenerator {
    pub fn from_config(cfg: &AdvisoryConfig) -> Result<Option<Self>> {
        let Some(api_key) = cfg.api_key.clone() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_s))
            .build()
            .map_err(|e| SignalError::Config(format!("failed to build advisory HTTP client: {e}")))?;
        Ok(Some(Self {
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            api_key,
            client,
        }))
    }
}

#[async_trait]
impl TextGenerator for GeminiGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let body = GenerateBody {
            contents: vec![Content { parts: vec![Part { text: prompt }] }],
        };
        debug!("advisory request to {url} ({} prompt chars)", prompt.len());

        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| SignalError::Advisory(format!("failed to reach model: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            warn!("advisory model error {status}: {text}");
            return Err(SignalError::Advisory(format!("HTTP {status}: {text}")));
        }
        let reply: GenerateReply = resp
            .json()
            .await
            .map_err(|e| SignalError::Advisory(format!("bad model reply: {e}")))?;

        let text: String = reply
            .candidates
            .into_iter()
            .next()
            .map(|c| c.content.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Ok("No response from model.".to_string());
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(risk: bool, relevant: usize, total: usize) -> StrategyInput {
        StrategyInput {
            overtake_data: BTreeMap::from([("HAM".to_string(), serde_json::json!({"appearances": 3}))]),
            tire_data: CliffRisk { matches_found: 30, max_similarity: 0.91, risk_detected: risk },
            pit_data: PitSignal { total_matches: total, relevant_matches: relevant },
        }
    }

    #[test]
    fn verdicts() {
        assert_eq!(
            undercut_verdict(&PitSignal { total_matches: 10, relevant_matches: 4 }),
            "Recommended: Pit (Undercut successful in 4/10 scenarios)"
        );
        assert!(undercut_verdict(&PitSignal { total_matches: 10, relevant_matches: 10 }).starts_with("Safe"));
        assert!(undercut_verdict(&PitSignal::default()).starts_with("Safe"));
    }

    #[test]
    fn prompt_carries_every_payload() {
        let prompt = build_strategy_prompt(&input(true, 4, 10));
        assert!(prompt.contains("\"HAM\""));
        assert!(prompt.contains("\"max_similarity\": 0.91"));
        assert!(prompt.contains("Risk level: High"));
        assert!(prompt.contains("4/10"));

        let calm = build_strategy_prompt(&input(false, 2, 2));
        assert!(calm.contains("Risk level: Low"));
        assert!(calm.contains("Safe: No similar scenarios"));
    }

    #[test]
    fn partial_payload_deserializes() {
        let raw = r#"{"tire_data": {"risk_detected": true}, "pit_data": {"total_matches": 10}}"#;
        let parsed: StrategyInput = serde_json::from_str(raw).unwrap();
        assert!(parsed.tire_data.risk_detected);
        assert_eq!(parsed.pit_data.relevant_matches, 0);
        assert!(parsed.overtake_data.is_empty());
    }

    #[test]
    fn no_api_key_means_no_generator() {
        assert!(GeminiGenerator::from_config(&AdvisoryConfig::default()).unwrap().is_none());
    }
}
