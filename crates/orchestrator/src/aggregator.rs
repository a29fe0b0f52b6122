//! Ranked comparison of the sessions of one task.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use membreak_core::{AgentKind, AgentSession, FailureKind, Score, SessionPhase};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::judge::JudgeFailure;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedEntry {
    pub rank: usize,
    pub agent: AgentKind,
    pub session_id: Uuid,
    pub overall: f64,
    pub passed: bool,
    pub breaking: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Why a session has no score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnscoredEntry {
    pub agent: AgentKind,
    pub session_id: Uuid,
    /// Terminal phase of the session (`failed`, `timed_out`, `cancelled`,
    /// or `done` for a judging failure).
    pub status: SessionPhase,
    pub failure_kind: Option<FailureKind>,
    /// Phase in which the session stopped.
    pub phase: Option<SessionPhase>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Comparison {
    pub task_id: Option<Uuid>,
    pub ranked: Vec<RankedEntry>,
    pub unscored: Vec<UnscoredEntry>,
}

impl Comparison {
    pub fn winner(&self) -> Option<&RankedEntry> {
        self.ranked.first()
    }
}

/// Orders scores by overall descending, then earliest completion, then
/// session id.
fn rank_order(a: &Score, b: &Score) -> Ordering {
    b.overall
        .partial_cmp(&a.overall)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.session_completed_at.cmp(&b.session_completed_at))
        .then_with(|| a.session_id.cmp(&b.session_id))
}

/// Builds the comparison from scratch. Sessions without a matching score
/// land in the unscored section, with the judge failure if there was one.
pub fn aggregate(
    sessions: &[AgentSession],
    scores: &[Score],
    judge_failures: &[JudgeFailure],
) -> Comparison {
    let mut ordered: Vec<&Score> = scores.iter().collect();
    ordered.sort_by(|a, b| rank_order(a, b));

    let ranked = ordered
        .iter()
        .enumerate()
        .map(|(i, score)| RankedEntry {
            rank: i + 1,
            agent: score.agent,
            session_id: score.session_id,
            overall: score.overall,
            passed: score.passed,
            breaking: score.breaking.iter().map(|b| b.dimension.clone()).collect(),
            completed_at: score.session_completed_at,
        })
        .collect();

    let scored: HashSet<Uuid> = scores.iter().map(|s| s.session_id).collect();
    let failures: HashMap<Uuid, &JudgeFailure> =
        judge_failures.iter().map(|f| (f.session_id, f)).collect();

    let mut unscored: Vec<UnscoredEntry> = sessions
        .iter()
        .filter(|s| !scored.contains(&s.id))
        .map(|s| {
            let outcome = s.outcome.as_ref();
            match failures.get(&s.id) {
                Some(failure) => UnscoredEntry {
                    agent: s.agent,
                    session_id: s.id,
                    status: s.phase,
                    failure_kind: Some(FailureKind::JudgeError),
                    phase: Some(s.phase),
                    message: Some(failure.error.clone()),
                },
                None => UnscoredEntry {
                    agent: s.agent,
                    session_id: s.id,
                    status: s.phase,
                    failure_kind: outcome.and_then(|o| o.failure_kind()),
                    phase: outcome.and_then(|o| o.failed_phase()),
                    message: outcome.and_then(|o| o.message()).map(str::to_string),
                },
            }
        })
        .collect();
    unscored.sort_by(|a, b| a.agent.cmp(&b.agent).then(a.session_id.cmp(&b.session_id)));

    Comparison {
        task_id: sessions
            .first()
            .map(|s| s.task_id)
            .or_else(|| scores.first().map(|s| s.task_id)),
        ranked,
        unscored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use membreak_core::{JudgeInfo, JudgeStrategyKind};
    use std::collections::BTreeMap;

    fn score(agent: AgentKind, overall: f64, completed_at: DateTime<Utc>) -> Score {
        Score {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            task_id: Uuid::nil(),
            agent,
            overall,
            dimensions: BTreeMap::new(),
            thresholds: BTreeMap::new(),
            breaking: vec![],
            passed: true,
            rationale: String::new(),
            judge: JudgeInfo::new(JudgeStrategyKind::Heuristic),
            session_completed_at: completed_at,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_higher_score_wins_regardless_of_completion_time() {
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(30);
        let scores = vec![score(AgentKind::Claude, 0.9, t1), score(AgentKind::Gemini, 0.95, t2)];

        let comparison = aggregate(&[], &scores, &[]);
        assert_eq!(comparison.winner().unwrap().agent, AgentKind::Gemini);
        assert_eq!(comparison.ranked[0].overall, 0.95);
        assert_eq!(comparison.ranked[1].rank, 2);
    }

    #[test]
    fn test_ties_go_to_earliest_completion() {
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(5);
        let scores = vec![score(AgentKind::Iflow, 0.8, t2), score(AgentKind::Claude, 0.8, t1)];

        let comparison = aggregate(&[], &scores, &[]);
        assert_eq!(comparison.ranked[0].agent, AgentKind::Claude);
    }

    #[test]
    fn test_unscored_sessions_keep_failure_details() {
        let task_id = Uuid::new_v4();
        let mut failed = AgentSession::new(task_id, AgentKind::Iflow);
        failed.fail(FailureKind::SetupError, "no repo").unwrap();

        let mut timed_out = AgentSession::new(task_id, AgentKind::Claude);
        timed_out.enter_phase(SessionPhase::PreCompression).unwrap();
        timed_out.time_out().unwrap();

        let mut unjudged = AgentSession::new(task_id, AgentKind::Gemini);
        unjudged.enter_phase(SessionPhase::PreCompression).unwrap();
        unjudged.enter_phase(SessionPhase::DeepDive).unwrap();
        unjudged.enter_phase(SessionPhase::MemoryOnly).unwrap();
        unjudged.enter_phase(SessionPhase::Evaluation).unwrap();
        unjudged.complete().unwrap();
        let failure = JudgeFailure {
            session_id: unjudged.id,
            task_id,
            agent: AgentKind::Gemini,
            strategy: JudgeStrategyKind::Llm,
            attempts: 2,
            error: "bad verdict".into(),
            failed_at: Utc::now(),
        };

        let comparison = aggregate(&[failed, timed_out, unjudged], &[], &[failure]);
        assert!(comparison.ranked.is_empty());
        assert_eq!(comparison.task_id, Some(task_id));

        let by_agent: Vec<_> = comparison
            .unscored
            .iter()
            .map(|u| (u.agent, u.failure_kind, u.phase))
            .collect();
        assert_eq!(
            by_agent,
            vec![
                (AgentKind::Iflow, Some(FailureKind::SetupError), Some(SessionPhase::Init)),
                (AgentKind::Claude, Some(FailureKind::Timeout), Some(SessionPhase::PreCompression)),
                (AgentKind::Gemini, Some(FailureKind::JudgeError), Some(SessionPhase::Done)),
            ]
        );
    }
}
