//! Heuristic response quality scoring.
//!
//! Scores completeness, relevance, and coherence without a second model call,
//! combines them into a weighted composite (0.40 / 0.35 / 0.25), and tracks a
//! trailing score history per model. `should_switch_model` fires once a model
//! has produced enough *consecutive* low scores, which the failover manager
//! treats as a same-request switch signal.

use std::collections::VecDeque;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use mm_core::config::EvaluatorSettings;
use mm_core::{ModelRequest, ModelResponse};

const COMPLETENESS_WEIGHT: f64 = 0.40;
const RELEVANCE_WEIGHT: f64 = 0.35;
const COHERENCE_WEIGHT: f64 = 0.25;

/// Trailing scores kept per model for the switch signal.
const HISTORY_LEN: usize = 10;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "be", "been", "being", "have", "has", "had", "do",
    "does", "did", "will", "would", "should", "could", "may", "might", "must", "can", "this",
    "that", "these", "those", "i", "you", "he", "she", "it", "we", "they",
];

// ---------------------------------------------------------------------------
// QualityScore
// ---------------------------------------------------------------------------

/// Component scores and their weighted composite, all in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityScore {
    pub completeness: f64,
    pub relevance: f64,
    pub coherence: f64,
    pub composite: f64,
}

// ---------------------------------------------------------------------------
// ResponseEvaluator
// ---------------------------------------------------------------------------

pub struct ResponseEvaluator {
    settings: EvaluatorSettings,
    history: RwLock<AHashMap<String, VecDeque<f64>>>,
}

impl ResponseEvaluator {
    pub fn new(settings: EvaluatorSettings) -> Self {
        Self {
            settings,
            history: RwLock::new(AHashMap::new()),
        }
    }

    /// Score a response and append the composite to the model's history.
    pub async fn evaluate(&self, request: &ModelRequest, response: &ModelResponse) -> QualityScore {
        let completeness = completeness_score(request, response);
        let relevance = relevance_score(request, response);
        let coherence = coherence_score(response);
        let composite = completeness * COMPLETENESS_WEIGHT
            + relevance * RELEVANCE_WEIGHT
            + coherence * COHERENCE_WEIGHT;

        let score = QualityScore {
            completeness,
            relevance,
            coherence,
            composite,
        };

        {
            let mut history = self.history.write().await;
            let scores = history.entry(response.model_id.clone()).or_default();
            scores.push_back(composite);
            while scores.len() > HISTORY_LEN {
                scores.pop_front();
            }
        }

        if composite < self.settings.quality_floor {
            warn!(
                model = %response.model_id,
                composite,
                completeness,
                relevance,
                coherence,
                "low-quality response"
            );
        } else {
            debug!(model = %response.model_id, composite, "response evaluated");
        }
        score
    }

    /// True once the model's last `min_consecutive` scores all fell below the
    /// quality floor. A single good response resets the streak.
    pub async fn should_switch_model(&self, model_id: &str) -> bool {
        let n = self.settings.min_consecutive;
        if n == 0 {
            return false;
        }
        let history = self.history.read().await;
        let Some(scores) = history.get(model_id) else {
            return false;
        };
        if scores.len() < n {
            return false;
        }
        let switch = scores
            .iter()
            .rev()
            .take(n)
            .all(|s| *s < self.settings.quality_floor);
        if switch {
            warn!(
                model = %model_id,
                consecutive = n,
                "quality regression, recommending model switch"
            );
        }
        switch
    }

    /// Trailing composite scores for one model, oldest first.
    pub async fn quality_history(&self, model_id: &str) -> Vec<f64> {
        let history = self.history.read().await;
        history
            .get(model_id)
            .map(|scores| scores.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop the history for one model, e.g. after its catalog entry changes.
    pub async fn clear_history(&self, model_id: &str) {
        self.history.write().await.remove(model_id);
    }
}

// ---------------------------------------------------------------------------
// Component heuristics
// ---------------------------------------------------------------------------

/// Did the response address the request at all: non-empty, not a refusal,
/// not visibly truncated.
fn completeness_score(_request: &ModelRequest, response: &ModelResponse) -> f64 {
    let content = response.content.trim();
    if content.is_empty() {
        return 0.0;
    }
    let mut score = 1.0;
    if content.len() < 50 {
        score *= 0.5;
    }

    let lower = content.to_lowercase();
    let refusal_markers = [
        "i cannot",
        "i can't",
        "unable to",
        "sorry",
        "apologize",
        "don't have access",
    ];
    if refusal_markers.iter().any(|m| lower.contains(m)) {
        score *= 0.6;
    }

    if content.ends_with("...") || content.ends_with('…') || response.finish_reason == "length" {
        score *= 0.8;
    }
    score.clamp(0.0, 1.0)
}

/// Term overlap between the prompt's substantial words and the response.
fn relevance_score(request: &ModelRequest, response: &ModelResponse) -> f64 {
    let content = response.content.trim().to_lowercase();
    let prompt = request.prompt.trim().to_lowercase();
    if content.is_empty() || prompt.is_empty() {
        return 0.0;
    }

    let key_terms: Vec<&str> = prompt
        .split_whitespace()
        .filter(|w| w.len() > 3 && !STOP_WORDS.contains(w))
        .collect();
    if key_terms.is_empty() {
        return 1.0;
    }

    let matches = key_terms.iter().filter(|w| content.contains(**w)).count();
    let mut score = matches as f64 / key_terms.len() as f64;
    if content.len() > 200 {
        score *= 1.1;
    }
    score.clamp(0.0, 1.0)
}

/// Structural sanity: punctuation present, no runaway repetition, sentence
/// lengths in a plausible band.
fn coherence_score(response: &ModelResponse) -> f64 {
    let content = response.content.trim();
    if content.is_empty() {
        return 0.0;
    }
    let mut score: f64 = 1.0;

    if !content.contains(['.', '!', '?']) {
        score *= 0.7;
    }

    let words: Vec<&str> = content.split_whitespace().collect();
    let mut counts: AHashMap<String, usize> = AHashMap::new();
    for word in &words {
        if word.len() > 3 {
            *counts.entry(word.to_lowercase()).or_default() += 1;
        }
    }
    let max_count = counts.values().copied().max().unwrap_or(0);
    if !words.is_empty() && max_count as f64 > words.len() as f64 * 0.2 {
        score *= 0.6;
    }

    let sentences: Vec<&str> = content
        .split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if !sentences.is_empty() {
        let avg_len = sentences
            .iter()
            .map(|s| s.split_whitespace().count())
            .sum::<usize>() as f64
            / sentences.len() as f64;
        if avg_len < 3.0 {
            score *= 0.7;
        } else if avg_len > 50.0 {
            score *= 0.8;
        }
    }

    // Code fences and paragraph breaks usually mean deliberate structure.
    if content.contains("```") || content.contains("\n\n") {
        score *= 1.1;
    }
    score.clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
