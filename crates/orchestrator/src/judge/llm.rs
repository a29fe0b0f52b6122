use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use membreak_core::{
    AgentSession, DimensionAssessment, JudgeInfo, JudgeStrategyKind, Rubric, Score, SessionPhase,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{ensure_judgeable, JudgeBackend, JudgeStrategy};
use crate::error::{JudgeError, JudgeResult};

/// Sends the transcript and rubric to a completion backend and parses the
/// returned JSON verdict. Out-of-range values are rejected, never clamped.
#[derive(Clone)]
pub struct LlmJudge {
    backend: Arc<dyn JudgeBackend>,
}

impl LlmJudge {
    pub fn new(backend: Arc<dyn JudgeBackend>) -> Self {
        Self { backend }
    }
}

impl std::fmt::Debug for LlmJudge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmJudge")
            .field("model", &self.backend.model())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    scores: serde_json::Map<String, Value>,
    #[serde(default)]
    reasons: BTreeMap<String, String>,
    #[serde(default)]
    rationale: String,
}

pub fn build_judge_prompt(session: &AgentSession, rubric: &Rubric) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# AI Agent Memory-Break Evaluation\n");
    let _ = writeln!(
        out,
        "An AI coding agent studied a code change, then had its context compressed \
         and was questioned from memory. Judge how well its knowledge survived.\n"
    );

    let _ = writeln!(out, "## Rubric\n");
    for dim in &rubric.dimensions {
        let _ = writeln!(
            out,
            "- **{}** ({}): {} Passing threshold: {:.2}.",
            dim.id, dim.name, dim.description, dim.threshold
        );
    }
    out.push('\n');

    let compression = &session.compression;
    if compression.detected {
        let _ = writeln!(
            out,
            "Compression was detected at deep-dive step {} ({}).\n",
            compression.iteration.unwrap_or_default(),
            compression.method.map(|m| m.as_str()).unwrap_or("unknown")
        );
    } else {
        let _ = writeln!(out, "No compression was detected during the deep dive.\n");
    }

    let _ = writeln!(out, "## Pre-compression answers\n");
    for exchange in session.exchanges_in(SessionPhase::PreCompression) {
        let _ = writeln!(out, "{}\n", exchange.response.trim());
    }

    let _ = writeln!(out, "## Post-compression answers\n");
    for exchange in session.evaluation_answers() {
        let _ = writeln!(out, "### Question {}\n{}\n", exchange.index + 1, exchange.prompt.trim());
        if let Some(reference) = &exchange.reference {
            let _ = writeln!(out, "Reference answer: {}\n", reference.trim());
        }
        let _ = writeln!(out, "Answer:\n{}\n", exchange.response.trim());
    }

    let ids: Vec<&str> = rubric.ids().collect();
    let scores = ids
        .iter()
        .map(|id| format!("\"{id}\": 0.0"))
        .collect::<Vec<_>>()
        .join(", ");
    let reasons = ids
        .iter()
        .map(|id| format!("\"{id}\": \"...\""))
        .collect::<Vec<_>>()
        .join(", ");

    let _ = writeln!(out, "## Instructions\n");
    let _ = writeln!(
        out,
        "Score every rubric dimension from 0.0 (nothing retained) to 1.0 (fully \
         retained), comparing post-compression answers with the pre-compression \
         analysis and any reference answers. Give a short reason per dimension.\n"
    );
    let _ = writeln!(out, "Respond with JSON only, in exactly this format:\n");
    let _ = writeln!(
        out,
        "```json\n{{\"scores\": {{{scores}}}, \"reasons\": {{{reasons}}}, \"rationale\": \"...\"}}\n```"
    );
    out
}

/// Pulls the JSON object out of a completion that may wrap it in a fenced
/// block or surrounding prose.
pub fn extract_json(content: &str) -> String {
    if let Some(start) = content.find("```json") {
        if let Some(end) = content[start + 7..].find("```") {
            return content[start + 7..start + 7 + end].trim().to_string();
        }
    }

    if let Some(start) = content.find("```\n{") {
        if let Some(end) = content[start + 4..].find("\n```") {
            return content[start + 4..start + 4 + end].trim().to_string();
        }
    }

    if let Some(start) = content.find('{') {
        if let Some(end) = content.rfind('}') {
            if end > start {
                return content[start..=end].to_string();
            }
        }
    }

    content.to_string()
}

fn parse_verdict(
    content: &str,
    rubric: &Rubric,
) -> JudgeResult<(BTreeMap<String, DimensionAssessment>, String)> {
    let json = extract_json(content);
    let raw: RawVerdict =
        serde_json::from_str(&json).map_err(|e| JudgeError::Parse(e.to_string()))?;

    let mut assessments = BTreeMap::new();
    for dim in &rubric.dimensions {
        let value = raw
            .scores
            .get(&dim.id)
            .ok_or_else(|| JudgeError::Invalid(format!("missing score for '{}'", dim.id)))?;
        let score = value.as_f64().ok_or_else(|| {
            JudgeError::Invalid(format!("score for '{}' is not a number: {value}", dim.id))
        })?;
        if !(0.0..=1.0).contains(&score) {
            return Err(JudgeError::Invalid(format!(
                "score for '{}' is outside [0, 1]: {score}",
                dim.id
            )));
        }
        let reason = raw
            .reasons
            .get(&dim.id)
            .cloned()
            .unwrap_or_else(|| raw.rationale.clone());
        assessments.insert(dim.id.clone(), DimensionAssessment::new(score, reason));
    }
    Ok((assessments, raw.rationale))
}

#[async_trait]
impl JudgeStrategy for LlmJudge {
    fn kind(&self) -> JudgeStrategyKind {
        JudgeStrategyKind::Llm
    }

    async fn score(&self, session: &AgentSession, rubric: &Rubric) -> JudgeResult<Score> {
        ensure_judgeable(session)?;
        let prompt = build_judge_prompt(session, rubric);
        let content = self.backend.complete(&prompt).await?;
        debug!(session_id = %session.id, chars = content.len(), "Judge replied");

        let (assessments, rationale) = parse_verdict(&content, rubric)?;
        let mut info = JudgeInfo::new(JudgeStrategyKind::Llm);
        if let Some(model) = self.backend.model() {
            info = info.with_model(model);
        }
        Ok(Score::build(session, rubric, &assessments, rationale, info)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedJudgeBackend;
    use membreak_core::AgentKind;
    use uuid::Uuid;

    fn finished() -> AgentSession {
        let mut s = AgentSession::new(Uuid::new_v4(), AgentKind::Gemini);
        s.enter_phase(SessionPhase::PreCompression).unwrap();
        s.record_exchange(0, "analyze", "It adds a cache.", None).unwrap();
        s.enter_phase(SessionPhase::DeepDive).unwrap();
        s.enter_phase(SessionPhase::MemoryOnly).unwrap();
        s.enter_phase(SessionPhase::Evaluation).unwrap();
        s.record_exchange(0, "What was the purpose?", "Caching.", Some("Add a cache".into()))
            .unwrap();
        s.complete().unwrap();
        s
    }

    fn verdict(ar: &str) -> String {
        format!(
            "Here is my verdict:\n```json\n{{\"scores\": {{\"AR\": {ar}, \"TTL\": 0.8, \"LRU\": 0.75, \"SF\": 0.9}}, \
             \"reasons\": {{\"AR\": \"forgot file names\"}}, \"rationale\": \"solid overall\"}}\n```"
        )
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("text ```\n{\"a\": 1}\n``` more"), "{\"a\": 1}");
        assert_eq!(extract_json("sure! {\"a\": {\"b\": 2}} done"), "{\"a\": {\"b\": 2}}");
        assert_eq!(extract_json("no json"), "no json");
    }

    #[test]
    fn test_prompt_contains_rubric_and_answers() {
        let prompt = build_judge_prompt(&finished(), &Rubric::default());
        assert!(prompt.starts_with("# AI Agent Memory-Break Evaluation"));
        assert!(prompt.contains("**AR** (Accurate Retrieval)"));
        assert!(prompt.contains("It adds a cache."));
        assert!(prompt.contains("Reference answer: Add a cache"));
        assert!(prompt.contains("\"SF\": 0.0"));
    }

    #[tokio::test]
    async fn test_valid_verdict_becomes_score() {
        let backend = ScriptedJudgeBackend::new().reply(verdict("0.6"));
        let judge = LlmJudge::new(Arc::new(backend));

        let score = judge.score(&finished(), &Rubric::default()).await.unwrap();
        assert_eq!(score.dimensions["AR"], 0.6);
        assert!(!score.passed);
        assert_eq!(score.breaking.len(), 1);
        assert_eq!(score.breaking[0].reason, "forgot file names");
        assert_eq!(score.rationale, "solid overall");
        assert_eq!(score.judge.model.as_deref(), Some("scripted"));
    }

    #[tokio::test]
    async fn test_out_of_range_score_is_rejected() {
        let backend = ScriptedJudgeBackend::new().reply(verdict("1.4"));
        let judge = LlmJudge::new(Arc::new(backend));

        let err = judge.score(&finished(), &Rubric::default()).await.unwrap_err();
        assert!(matches!(err, JudgeError::Invalid(ref m) if m.contains("1.4")));
    }

    #[tokio::test]
    async fn test_missing_and_non_numeric_scores_are_rejected() {
        let missing = "{\"scores\": {\"AR\": 0.9}}";
        let judge = LlmJudge::new(Arc::new(ScriptedJudgeBackend::new().reply(missing)));
        let err = judge.score(&finished(), &Rubric::default()).await.unwrap_err();
        assert!(matches!(err, JudgeError::Invalid(ref m) if m.contains("missing")));

        let text = "{\"scores\": {\"AR\": \"high\", \"TTL\": 1, \"LRU\": 1, \"SF\": 1}}";
        let judge = LlmJudge::new(Arc::new(ScriptedJudgeBackend::new().reply(text)));
        let err = judge.score(&finished(), &Rubric::default()).await.unwrap_err();
        assert!(matches!(err, JudgeError::Invalid(ref m) if m.contains("not a number")));

        let judge = LlmJudge::new(Arc::new(ScriptedJudgeBackend::new().reply("no idea")));
        let err = judge.score(&finished(), &Rubric::default()).await.unwrap_err();
        assert!(matches!(err, JudgeError::Parse(_)));
    }

    #[tokio::test]
    async fn test_breaking_dimension_without_reasons_still_explained() {
        let bare = r#"{"scores": {"AR": 0.2, "TTL": 0.9, "LRU": 0.9, "SF": 0.9}}"#;
        let judge = LlmJudge::new(Arc::new(ScriptedJudgeBackend::new().reply(bare)));

        let score = judge.score(&finished(), &Rubric::default()).await.unwrap();
        assert_eq!(score.breaking.len(), 1);
        assert_eq!(score.breaking[0].dimension, "AR");
        assert!(!score.breaking[0].reason.is_empty());
        assert!(score.breaking[0].reason.contains("below threshold"));
    }
}
