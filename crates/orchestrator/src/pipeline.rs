//! One evaluation task end to end: changed files, prompts, per-agent sessions,
//! judging as sessions finish, and the final comparison.

use std::sync::Arc;

use events::{Event, EventBus};
use futures::StreamExt;
use membreak_core::{AgentSession, EvalTask, Score, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::adapter::{AdapterFactory, AgentRegistry};
use crate::aggregator::{aggregate, Comparison};
use crate::collaborators::{ChangeSource, GitChangeSource, PromptSet, PromptSource, TemplatePrompts};
use crate::config::EvalConfig;
use crate::error::Result;
use crate::judge::{JudgeDispatcher, JudgeFailure, Verdict};
use crate::runner::SessionInputs;
use crate::session_orchestrator::SessionOrchestrator;

/// Everything a finished task produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: EvalTask,
    pub prompt_hash: String,
    pub sessions: Vec<AgentSession>,
    pub scores: Vec<Score>,
    pub judge_failures: Vec<JudgeFailure>,
    pub comparison: Comparison,
}

pub struct EvaluationPipeline {
    config: Arc<EvalConfig>,
    factory: Arc<dyn AdapterFactory>,
    changes: Arc<dyn ChangeSource>,
    prompts: Arc<dyn PromptSource>,
    dispatcher: JudgeDispatcher,
    bus: EventBus,
    cancel: CancellationToken,
}

impl EvaluationPipeline {
    pub fn new(
        config: EvalConfig,
        factory: Arc<dyn AdapterFactory>,
        changes: Arc<dyn ChangeSource>,
        prompts: Arc<dyn PromptSource>,
        dispatcher: JudgeDispatcher,
        bus: EventBus,
    ) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            changes,
            prompts,
            dispatcher,
            bus,
            cancel: CancellationToken::new(),
        }
    }

    /// Real agents from the registry, git change analysis, default
    /// templates and the configured judge.
    pub fn from_config(config: EvalConfig, bus: EventBus) -> Result<Self> {
        config.validate()?;
        let dispatcher = JudgeDispatcher::from_config(&config.judge, config.rubric.clone(), bus.clone())?;
        let factory = Arc::new(AgentRegistry::new(config.agents.clone()));
        let changes = Arc::new(GitChangeSource::new(config.max_files));
        Ok(Self::new(
            config,
            factory,
            changes,
            Arc::new(TemplatePrompts::new()),
            dispatcher,
            bus,
        ))
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the running task. In-flight sessions end CANCELLED and keep
    /// their partial transcripts.
    pub fn cancel(&self) {
        info!("Cancelling evaluation");
        self.cancel.cancel();
    }

    pub async fn run(&self, mut task: EvalTask) -> Result<TaskReport> {
        task.start();
        self.bus.emit(Event::TaskStarted {
            task_id: task.id,
            target: task.target.display_name(),
            agents: task.agents.iter().map(|a| a.to_string()).collect(),
        });
        info!(task_id = %task.id, target = %task.target.display_name(), "Evaluation started");

        let files = match self.changes.changed_files(&task.target).await {
            Ok(files) => files,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Could not read changed files");
                task.finish(TaskStatus::Error);
                self.bus.emit(Event::TaskCompleted {
                    task_id: task.id,
                    status: task.status.as_str().to_string(),
                    scored: 0,
                    unscored: 0,
                });
                return Err(e);
            }
        };

        let prompts = PromptSet::build(self.prompts.as_ref(), &task.target, &files);
        let prompt_hash = prompts.hash.clone();
        info!(task_id = %task.id, files = files.len(), prompt_hash = %prompt_hash, "Prompts prepared");

        let orchestrator = SessionOrchestrator::new(self.config.clone(), self.factory.clone(), self.bus.clone())
            .with_cancellation(self.cancel.child_token());
        let finished = orchestrator.run(&task, &task.agents, SessionInputs::new(prompts, files));
        let mut judged = self
            .dispatcher
            .clone()
            .with_cancellation(self.cancel.child_token())
            .dispatch(finished);

        let mut sessions = Vec::with_capacity(task.agents.len());
        let mut scores = Vec::new();
        let mut judge_failures = Vec::new();
        while let Some(item) = judged.next().await {
            match item.verdict {
                Verdict::Scored(score) => scores.push(score),
                Verdict::JudgeFailed(failure) => judge_failures.push(failure),
                Verdict::NotApplicable => {}
            }
            sessions.push(item.session);
        }
        sessions.sort_by_key(|s| s.agent);

        let comparison = aggregate(&sessions, &scores, &judge_failures);
        let status = if self.cancel.is_cancelled() {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Done
        };
        task.finish(status);
        self.bus.emit(Event::TaskCompleted {
            task_id: task.id,
            status: status.as_str().to_string(),
            scored: comparison.ranked.len(),
            unscored: comparison.unscored.len(),
        });
        info!(
            task_id = %task.id,
            status = status.as_str(),
            scored = comparison.ranked.len(),
            unscored = comparison.unscored.len(),
            "Evaluation finished"
        );

        Ok(TaskReport {
            task,
            prompt_hash,
            sessions,
            scores,
            judge_failures,
            comparison,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;
    use crate::judge::HeuristicJudge;
    use crate::test_support::{AgentScript, ScriptedFactory};
    use async_trait::async_trait;
    use membreak_core::{AgentKind, ChangedFile, EvalTarget, Rubric};
    use tempfile::TempDir;

    struct FixedChanges(Option<Vec<ChangedFile>>);

    #[async_trait]
    impl ChangeSource for FixedChanges {
        async fn changed_files(&self, _target: &EvalTarget) -> Result<Vec<ChangedFile>> {
            self.0
                .clone()
                .ok_or_else(|| OrchestratorError::collaborator("git", "not a repository"))
        }
    }

    fn pipeline(root: &TempDir, factory: ScriptedFactory, changes: FixedChanges, bus: EventBus) -> EvaluationPipeline {
        let dispatcher =
            JudgeDispatcher::new(Arc::new(HeuristicJudge::new()), Rubric::default(), bus.clone());
        EvaluationPipeline::new(
            EvalConfig::new(root.path()),
            Arc::new(factory),
            Arc::new(changes),
            Arc::new(TemplatePrompts::new()),
            dispatcher,
            bus,
        )
    }

    fn file() -> ChangedFile {
        ChangedFile {
            path: "src/cache.rs".to_string(),
            content: Some("pub struct Cache;".to_string()),
            diff: "+pub struct Cache;".to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_scores_every_successful_session() {
        let root = TempDir::new().unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let factory = ScriptedFactory::new()
            .with_script(AgentKind::Claude, AgentScript::native(&[100.0, 95.0, 85.0, 30.0, 75.0]))
            .with_script(AgentKind::Gemini, AgentScript::native(&[80.0, 20.0, 90.0]));
        let pipeline = pipeline(&root, factory, FixedChanges(Some(vec![file()])), bus);

        let task = EvalTask::new(EvalTarget::new(".", "main", "feature"), vec![AgentKind::Claude, AgentKind::Gemini]);
        let report = pipeline.run(task).await.unwrap();

        assert_eq!(report.task.status, TaskStatus::Done);
        assert_eq!(report.sessions.len(), 2);
        assert_eq!(report.scores.len(), 2);
        assert!(report.judge_failures.is_empty());
        assert_eq!(report.comparison.ranked.len(), 2);
        assert_eq!(report.prompt_hash.len(), 16);

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.event.kind())
            .collect();
        assert_eq!(kinds.first(), Some(&"task.started"));
        assert_eq!(kinds.last(), Some(&"task.completed"));
    }

    #[tokio::test]
    async fn test_change_source_failure_ends_task() {
        let root = TempDir::new().unwrap();
        let factory = ScriptedFactory::new();
        let pipeline = pipeline(&root, factory.clone(), FixedChanges(None), EventBus::new());

        let task = EvalTask::new(EvalTarget::new("/nope", "a", "b"), vec![AgentKind::Claude]);
        let err = pipeline.run(task).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Collaborator { .. }));
        assert_eq!(factory.created(AgentKind::Claude), 0);
    }
}
