use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::agent::AgentKind;
use super::session::AgentSession;
use crate::error::{CoreError, Result};

pub const DEFAULT_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RubricDimension {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

impl RubricDimension {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

/// Ordered set of scoring dimensions handed to every judge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rubric {
    pub dimensions: Vec<RubricDimension>,
}

impl Default for Rubric {
    fn default() -> Self {
        Self {
            dimensions: vec![
                RubricDimension::new(
                    "AR",
                    "Accurate Retrieval",
                    "Recalls specific details of the change (files, functions, values) correctly after compression.",
                ),
                RubricDimension::new(
                    "TTL",
                    "Test-Time Learning",
                    "Applies what was learned about the codebase during the session to new questions.",
                ),
                RubricDimension::new(
                    "LRU",
                    "Long-Range Understanding",
                    "Connects distant parts of the change and explains the overall architecture.",
                ),
                RubricDimension::new(
                    "SF",
                    "Selective Forgetting",
                    "Keeps track of what changed versus what was superseded, without mixing old and new behavior.",
                ),
            ],
        }
    }
}

impl Rubric {
    pub fn new(dimensions: Vec<RubricDimension>) -> Self {
        Self { dimensions }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.dimensions.iter().map(|d| d.id.as_str())
    }

    pub fn get(&self, id: &str) -> Option<&RubricDimension> {
        self.dimensions.iter().find(|d| d.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimensions.is_empty() {
            return Err(CoreError::Validation("rubric has no dimensions".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for dim in &self.dimensions {
            if !seen.insert(dim.id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "duplicate rubric dimension '{}'",
                    dim.id
                )));
            }
            if !(0.0..=1.0).contains(&dim.threshold) {
                return Err(CoreError::Validation(format!(
                    "threshold for '{}' must be within [0, 1], got {}",
                    dim.id, dim.threshold
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JudgeStrategyKind {
    #[default]
    Heuristic,
    Llm,
}

impl JudgeStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heuristic => "heuristic",
            Self::Llm => "llm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "heuristic" => Some(Self::Heuristic),
            "llm" => Some(Self::Llm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgeInfo {
    pub strategy: JudgeStrategyKind,
    pub model: Option<String>,
    pub attempts: u32,
    /// Set when this score came from a fallback after `fallback_from` failed.
    pub fallback_from: Option<JudgeStrategyKind>,
}

impl JudgeInfo {
    pub fn new(strategy: JudgeStrategyKind) -> Self {
        Self {
            strategy,
            model: None,
            attempts: 1,
            fallback_from: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A judge's raw verdict for one dimension, before thresholds are applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimensionAssessment {
    pub score: f64,
    pub reason: String,
}

impl DimensionAssessment {
    pub fn new(score: f64, reason: impl Into<String>) -> Self {
        Self {
            score,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakingDimension {
    pub dimension: String,
    pub score: f64,
    pub threshold: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Score {
    pub id: Uuid,
    pub session_id: Uuid,
    pub task_id: Uuid,
    pub agent: AgentKind,
    pub overall: f64,
    pub dimensions: BTreeMap<String, f64>,
    pub thresholds: BTreeMap<String, f64>,
    pub breaking: Vec<BreakingDimension>,
    pub passed: bool,
    pub rationale: String,
    pub judge: JudgeInfo,
    pub session_completed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Score {
    /// Builds a score for a successful session. Every rubric dimension must
    /// have an assessment within [0, 1].
    pub fn build(
        session: &AgentSession,
        rubric: &Rubric,
        assessments: &BTreeMap<String, DimensionAssessment>,
        rationale: impl Into<String>,
        judge: JudgeInfo,
    ) -> Result<Self> {
        if !session.is_success() {
            return Err(CoreError::Validation(format!(
                "session {} did not finish successfully",
                session.id
            )));
        }
        let completed_at = session.completed_at.ok_or_else(|| {
            CoreError::Validation(format!("session {} has no completion time", session.id))
        })?;
        if rubric.dimensions.is_empty() {
            return Err(CoreError::Validation("rubric has no dimensions".into()));
        }

        let mut dimensions = BTreeMap::new();
        let mut thresholds = BTreeMap::new();
        let mut breaking = Vec::new();

        for dim in &rubric.dimensions {
            let assessment = assessments.get(&dim.id).ok_or_else(|| {
                CoreError::Validation(format!("missing score for dimension '{}'", dim.id))
            })?;
            let value = assessment.score;
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(CoreError::Validation(format!(
                    "score for '{}' must be within [0, 1], got {}",
                    dim.id, value
                )));
            }
            if value < dim.threshold {
                breaking.push(BreakingDimension {
                    dimension: dim.id.clone(),
                    score: value,
                    threshold: dim.threshold,
                    reason: breaking_reason(&dim.id, value, dim.threshold, &assessment.reason),
                });
            }
            dimensions.insert(dim.id.clone(), value);
            thresholds.insert(dim.id.clone(), dim.threshold);
        }

        let overall = dimensions.values().sum::<f64>() / dimensions.len() as f64;

        Ok(Self {
            id: Uuid::new_v4(),
            session_id: session.id,
            task_id: session.task_id,
            agent: session.agent,
            overall,
            dimensions,
            thresholds,
            passed: breaking.is_empty(),
            breaking,
            rationale: rationale.into(),
            judge,
            session_completed_at: completed_at,
            created_at: Utc::now(),
        })
    }
}

/// The judge's reason, or a plain statement of the miss when it gave none.
fn breaking_reason(id: &str, score: f64, threshold: f64, reason: &str) -> String {
    let reason = reason.trim();
    if reason.is_empty() {
        format!("{id} scored {score:.2}, below threshold {threshold:.2}")
    } else {
        reason.to_string()
    }
}
