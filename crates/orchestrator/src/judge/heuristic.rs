use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use membreak_core::{
    AgentSession, DimensionAssessment, JudgeInfo, JudgeStrategyKind, Rubric, Score, SessionPhase,
};
use tracing::debug;

use super::{ensure_judgeable, JudgeStrategy};
use crate::error::{JudgeError, JudgeResult};

const DETAIL_KEYWORDS: &[&str] = &[
    "function", "method", "class", "variable", "file", "import", "def ", "async ", "await",
    "return", "raise", "except", "if ", "for ", "while ", "with ",
];

const LEARNING_KEYWORDS: &[&str] = &[
    "would", "could", "should", "approach", "strategy", "implement", "similar", "adapt",
    "modify", "improve", "optimize", "consider",
];

const CONNECTION_KEYWORDS: &[&str] = &[
    "connect", "relate", "depend", "impact", "affect", "integrate", "system", "architecture",
    "component", "module", "service", "because", "therefore", "however", "moreover",
    "furthermore",
];

const ARCHITECTURE_KEYWORDS: &[&str] = &[
    "pattern", "design", "structure", "framework", "library", "database", "api", "interface",
    "protocol", "service",
];

const CHANGE_KEYWORDS: &[&str] = &[
    "change", "update", "modify", "replace", "remove", "delete", "revert", "undo", "preserve",
    "keep", "maintain", "retain",
];

const CONDITIONAL_KEYWORDS: &[&str] = &[
    "if", "when", "unless", "provided", "assuming", "given", "depends", "varies", "different",
    "alternative",
];

/// Deterministic keyword and overlap scoring with no external dependency.
///
/// Pre-compression text is everything the agent said before the memory-only
/// phase; post-compression text is its evaluation answers.
#[derive(Debug, Clone, Default)]
pub struct HeuristicJudge;

impl HeuristicJudge {
    pub fn new() -> Self {
        Self
    }

    fn assess(&self, id: &str, texts: &Texts) -> JudgeResult<DimensionAssessment> {
        let assessment = match id {
            "AR" => accurate_retrieval(texts),
            "TTL" => test_time_learning(&texts.post),
            "LRU" => long_range_understanding(&texts.post),
            "SF" => selective_forgetting(&texts.post),
            other => match texts.reference_overlap() {
                Some(overlap) => DimensionAssessment::new(
                    overlap,
                    format!("{other}: {:.0}% of reference terms recalled", overlap * 100.0),
                ),
                None => {
                    return Err(JudgeError::Invalid(format!(
                        "no heuristic for dimension '{other}' and no reference answers"
                    )))
                }
            },
        };
        Ok(DimensionAssessment::new(
            assessment.score.clamp(0.0, 1.0),
            assessment.reason,
        ))
    }
}

struct Texts {
    pre: String,
    post: String,
    /// `(reference, answer)` for every evaluation answer with a reference.
    references: Vec<(String, String)>,
}

impl Texts {
    fn from_session(session: &AgentSession) -> Self {
        let pre = session
            .transcript
            .iter()
            .filter(|e| {
                matches!(
                    e.phase,
                    SessionPhase::Init | SessionPhase::PreCompression | SessionPhase::DeepDive
                )
            })
            .map(|e| e.response.as_str())
            .collect::<Vec<_>>()
            .join("\n")
            .to_lowercase();
        let post = session
            .evaluation_answers()
            .map(|e| e.response.as_str())
            .collect::<Vec<_>>()
            .join("\n")
            .to_lowercase();
        let references = session
            .evaluation_answers()
            .filter_map(|e| {
                e.reference
                    .as_ref()
                    .map(|r| (r.to_lowercase(), e.response.to_lowercase()))
            })
            .collect();
        Self {
            pre,
            post,
            references,
        }
    }

    /// Mean share of significant reference words found in the answer.
    fn reference_overlap(&self) -> Option<f64> {
        let ratios: Vec<f64> = self
            .references
            .iter()
            .filter_map(|(reference, answer)| {
                let terms: HashSet<&str> = significant_words(reference).collect();
                if terms.is_empty() {
                    return None;
                }
                let answer_words: HashSet<&str> = significant_words(answer).collect();
                let hits = terms.iter().filter(|t| answer_words.contains(*t)).count();
                Some(hits as f64 / terms.len() as f64)
            })
            .collect();
        if ratios.is_empty() {
            None
        } else {
            Some(ratios.iter().sum::<f64>() / ratios.len() as f64)
        }
    }
}

fn significant_words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.chars().count() >= 4)
}

/// Total substring occurrences of every keyword in `text` (already lowercase).
fn count_keywords(text: &str, keywords: &[&str]) -> usize {
    keywords.iter().map(|k| text.matches(k).count()).sum()
}

fn accurate_retrieval(texts: &Texts) -> DimensionAssessment {
    let before = count_keywords(&texts.pre, DETAIL_KEYWORDS);
    let after = count_keywords(&texts.post, DETAIL_KEYWORDS);
    let retention = if before == 0 {
        0.5
    } else {
        0.3 + 0.7 * (after as f64 / before as f64).min(1.0)
    };

    match texts.reference_overlap() {
        Some(overlap) => DimensionAssessment::new(
            (retention + overlap) / 2.0,
            format!(
                "{before} detail terms before compression, {after} after; \
                 {:.0}% of reference terms recalled",
                overlap * 100.0
            ),
        ),
        None => DimensionAssessment::new(
            retention,
            format!("{before} detail terms before compression, {after} after"),
        ),
    }
}

fn test_time_learning(post: &str) -> DimensionAssessment {
    let words = post.split_whitespace().count();
    if words == 0 {
        return DimensionAssessment::new(0.0, "no evaluation answers");
    }
    let hits = count_keywords(post, LEARNING_KEYWORDS);
    let density = hits as f64 / words as f64 * 100.0;
    DimensionAssessment::new(
        (density / 2.0).min(1.0),
        format!("{hits} learning indicators in {words} words ({density:.1} per 100)"),
    )
}

fn long_range_understanding(post: &str) -> DimensionAssessment {
    let connections = count_keywords(post, CONNECTION_KEYWORDS);
    let architecture = count_keywords(post, ARCHITECTURE_KEYWORDS);
    DimensionAssessment::new(
        ((connections + architecture) as f64 / 10.0).min(1.0),
        format!("{connections} connection terms, {architecture} architecture terms"),
    )
}

fn selective_forgetting(post: &str) -> DimensionAssessment {
    let changes = count_keywords(post, CHANGE_KEYWORDS);
    let conditions = count_keywords(post, CONDITIONAL_KEYWORDS);
    DimensionAssessment::new(
        ((changes + conditions) as f64 / 8.0).min(1.0),
        format!("{changes} change terms, {conditions} conditional terms"),
    )
}

#[async_trait]
impl JudgeStrategy for HeuristicJudge {
    fn kind(&self) -> JudgeStrategyKind {
        JudgeStrategyKind::Heuristic
    }

    async fn score(&self, session: &AgentSession, rubric: &Rubric) -> JudgeResult<Score> {
        ensure_judgeable(session)?;
        let texts = Texts::from_session(session);

        let mut assessments = BTreeMap::new();
        for dim in &rubric.dimensions {
            assessments.insert(dim.id.clone(), self.assess(&dim.id, &texts)?);
        }
        debug!(session_id = %session.id, dimensions = assessments.len(), "Heuristic assessment done");

        let rationale = format!(
            "Keyword analysis of {} evaluation answers against {} pre-compression responses",
            session.evaluation_answers().count(),
            session
                .transcript
                .iter()
                .filter(|e| e.phase != SessionPhase::Evaluation && e.phase != SessionPhase::MemoryOnly)
                .count()
        );
        Ok(Score::build(
            session,
            rubric,
            &assessments,
            rationale,
            JudgeInfo::new(JudgeStrategyKind::Heuristic),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use membreak_core::{AgentKind, FailureKind, RubricDimension};
    use uuid::Uuid;

    fn session(pre: &str, answers: &[(&str, Option<&str>)]) -> AgentSession {
        let mut s = AgentSession::new(Uuid::new_v4(), AgentKind::Claude);
        s.record_exchange(0, "init", "ok", None).unwrap();
        s.enter_phase(SessionPhase::PreCompression).unwrap();
        s.record_exchange(0, "analyze", pre, None).unwrap();
        s.enter_phase(SessionPhase::DeepDive).unwrap();
        s.enter_phase(SessionPhase::MemoryOnly).unwrap();
        s.record_exchange(0, "recall", "I remember", None).unwrap();
        s.enter_phase(SessionPhase::Evaluation).unwrap();
        for (i, (answer, reference)) in answers.iter().enumerate() {
            s.record_exchange(i as u32, "q", *answer, reference.map(str::to_string))
                .unwrap();
        }
        s.complete().unwrap();
        s
    }

    #[tokio::test]
    async fn test_scores_stay_in_range_and_are_deterministic() {
        let s = session(
            "The function load reads the file and the class Store wraps it.",
            &[(
                "Because the service depends on the database api, we should change \
                 the interface if the design varies. I would adapt the approach.",
                None,
            )],
        );
        let rubric = Rubric::default();
        let a = HeuristicJudge::new().score(&s, &rubric).await.unwrap();
        let b = HeuristicJudge::new().score(&s, &rubric).await.unwrap();

        assert_eq!(a.dimensions, b.dimensions);
        assert!(a.dimensions.values().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(a.dimensions.len(), 4);
        assert_eq!(a.judge.strategy, JudgeStrategyKind::Heuristic);
    }

    #[tokio::test]
    async fn test_detail_retention() {
        // no detail terms before compression
        let s = session("Looks good.", &[("The function returns.", None)]);
        let score = HeuristicJudge::new().score(&s, &Rubric::default()).await.unwrap();
        assert_eq!(score.dimensions["AR"], 0.5);

        // two detail terms before, one after
        let s = session("function and class", &[("a function", None)]);
        let score = HeuristicJudge::new().score(&s, &Rubric::default()).await.unwrap();
        assert!((score.dimensions["AR"] - 0.65).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_answers_break_learning() {
        let s = session("function", &[("", None)]);
        let score = HeuristicJudge::new().score(&s, &Rubric::default()).await.unwrap();
        assert_eq!(score.dimensions["TTL"], 0.0);
        assert!(!score.passed);
        assert!(score
            .breaking
            .iter()
            .any(|b| b.dimension == "TTL" && b.reason == "no evaluation answers"));
    }

    #[tokio::test]
    async fn test_custom_dimension_uses_reference_overlap() {
        let rubric = Rubric::new(vec![RubricDimension::new("REC", "Recall", "")]);
        let s = session(
            "x",
            &[("The cache lives in storage module", Some("cache storage eviction"))],
        );
        let score = HeuristicJudge::new().score(&s, &rubric).await.unwrap();
        assert!((score.dimensions["REC"] - 2.0 / 3.0).abs() < 1e-9);

        let s = session("x", &[("answer", None)]);
        let err = HeuristicJudge::new().score(&s, &rubric).await.unwrap_err();
        assert!(matches!(err, JudgeError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_failed_session_is_not_applicable() {
        let mut s = AgentSession::new(Uuid::new_v4(), AgentKind::Iflow);
        s.fail(FailureKind::AdapterError, "boom").unwrap();
        let err = HeuristicJudge::new().score(&s, &Rubric::default()).await.unwrap_err();
        assert!(matches!(err, JudgeError::NotApplicable(_)));
    }
}
