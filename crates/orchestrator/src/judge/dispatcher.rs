use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use events::EventBus;
use futures::{FutureExt, Stream, StreamExt};
use membreak_core::{AgentKind, AgentSession, JudgeStrategyKind, Rubric, Score};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{HeuristicJudge, HttpJudgeBackend, JudgeStrategy, LlmJudge};
use crate::config::JudgeConfig;
use crate::error::{JudgeError, Result};
use crate::reporter::SessionReporter;

/// Explicit marker for a successful session that could not be scored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgeFailure {
    pub session_id: Uuid,
    pub task_id: Uuid,
    pub agent: AgentKind,
    pub strategy: JudgeStrategyKind,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Scored(Score),
    JudgeFailed(JudgeFailure),
    /// The session did not reach DONE; nothing was judged.
    NotApplicable,
}

/// A finished session with what the judge made of it.
#[derive(Debug, Clone)]
pub struct JudgedSession {
    pub session: AgentSession,
    pub verdict: Verdict,
}

/// Scores finished sessions concurrently as they arrive.
#[derive(Clone)]
pub struct JudgeDispatcher {
    primary: Arc<dyn JudgeStrategy>,
    fallback: Option<Arc<dyn JudgeStrategy>>,
    rubric: Arc<Rubric>,
    bus: EventBus,
    timeout: Duration,
    cancel: CancellationToken,
}

impl JudgeDispatcher {
    pub fn new(primary: Arc<dyn JudgeStrategy>, rubric: Rubric, bus: EventBus) -> Self {
        Self {
            primary,
            fallback: None,
            rubric: Arc::new(rubric),
            bus,
            timeout: JudgeConfig::default().timeout(),
            cancel: CancellationToken::new(),
        }
    }

    /// Budget for each judging attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// In-flight judgements end as judge failures once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn JudgeStrategy>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Strategy chosen in `config`; the heuristic fallback is only wired up
    /// when the config asks for it.
    pub fn from_config(config: &JudgeConfig, rubric: Rubric, bus: EventBus) -> Result<Self> {
        let primary: Arc<dyn JudgeStrategy> = match config.strategy {
            JudgeStrategyKind::Heuristic => Arc::new(HeuristicJudge::new()),
            JudgeStrategyKind::Llm => {
                Arc::new(LlmJudge::new(Arc::new(HttpJudgeBackend::from_config(config)?)))
            }
        };
        let dispatcher = Self::new(primary, rubric, bus).with_timeout(config.timeout());
        if config.fallback_to_heuristic && config.strategy != JudgeStrategyKind::Heuristic {
            return Ok(dispatcher.with_fallback(Arc::new(HeuristicJudge::new())));
        }
        Ok(dispatcher)
    }

    pub fn rubric(&self) -> &Rubric {
        &self.rubric
    }

    /// Judges every session from `sessions`, yielding results in completion
    /// order. The output ends once the input has ended and every judgement
    /// is done.
    pub fn dispatch<S>(&self, sessions: S) -> ReceiverStream<JudgedSession>
    where
        S: Stream<Item = AgentSession> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(32);
        let this = self.clone();

        tokio::spawn(async move {
            let mut sessions = sessions;
            let mut pending = JoinSet::new();
            let mut input_open = true;

            loop {
                tokio::select! {
                    next = sessions.next(), if input_open => match next {
                        Some(session) => {
                            let judge = this.clone();
                            pending.spawn(async move { judge.judge(session).await });
                        }
                        None => input_open = false,
                    },
                    Some(done) = pending.join_next(), if !pending.is_empty() => match done {
                        Ok(judged) => {
                            if tx.send(judged).await.is_err() {
                                warn!("Judged-session receiver dropped");
                                break;
                            }
                        }
                        Err(e) => error!(error = %e, "Judge task aborted"),
                    },
                    else => break,
                }
            }
        });

        ReceiverStream::new(rx)
    }

    /// Judges one session. Never fails: problems end up in the verdict.
    pub async fn judge(&self, session: AgentSession) -> JudgedSession {
        if !session.is_success() {
            return JudgedSession {
                session,
                verdict: Verdict::NotApplicable,
            };
        }

        let reporter = SessionReporter::new(self.bus.clone(), &session);
        let verdict = match self.score_with(&self.primary, &session, &reporter).await {
            Ok(score) => Verdict::Scored(score),
            Err(failure) => match &self.fallback {
                Some(fallback) => {
                    warn!(
                        session_id = %session.id,
                        from = self.primary.kind().as_str(),
                        to = fallback.kind().as_str(),
                        "Falling back to another judge strategy"
                    );
                    match self.score_with(fallback, &session, &reporter).await {
                        Ok(mut score) => {
                            score.judge.fallback_from = Some(self.primary.kind());
                            Verdict::Scored(score)
                        }
                        Err(fallback_failure) => Verdict::JudgeFailed(fallback_failure),
                    }
                }
                None => Verdict::JudgeFailed(failure),
            },
        };

        JudgedSession { session, verdict }
    }

    /// One strategy with a single retry on a retryable judge error.
    async fn score_with(
        &self,
        strategy: &Arc<dyn JudgeStrategy>,
        session: &AgentSession,
        reporter: &SessionReporter,
    ) -> std::result::Result<Score, JudgeFailure> {
        let kind = strategy.kind();
        reporter.judge_started(kind.as_str());

        let mut attempts = 0;
        let error = loop {
            attempts += 1;
            let scoring = AssertUnwindSafe(strategy.score(session, &self.rubric)).catch_unwind();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(JudgeError::Cancelled),
                outcome = tokio::time::timeout(self.timeout, scoring) => match outcome {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(JudgeError::Backend("judge panicked".to_string())),
                    Err(_) => Err(JudgeError::Timeout(self.timeout)),
                },
            };

            match result {
                Ok(mut score) => {
                    score.judge.attempts = attempts;
                    reporter.judge_scored(kind.as_str(), score.overall, score.passed);
                    info!(
                        session_id = %session.id,
                        agent = %session.agent,
                        strategy = kind.as_str(),
                        overall = score.overall,
                        passed = score.passed,
                        "Session scored"
                    );
                    return Ok(score);
                }
                Err(e) if attempts < 2 && e.is_retryable() => {
                    warn!(session_id = %session.id, error = %e, "Judge failed, retrying once");
                }
                Err(e) => break e,
            }
        };

        reporter.judge_failed(kind.as_str(), &error.to_string());
        warn!(session_id = %session.id, strategy = kind.as_str(), error = %error, "Judging failed");
        Err(JudgeFailure {
            session_id: session.id,
            task_id: session.task_id,
            agent: session.agent,
            strategy: kind,
            attempts,
            error: error.to_string(),
            failed_at: Utc::now(),
        })
    }
}
