use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use events::EventBus;
use membreak_core::{
    AgentKind, ChangedFile, CompressionMethod, EvalTarget, EvalTask, FailureKind, JudgeStrategyKind,
    Rubric, SessionPhase, SignalAvailability, TaskStatus,
};
use orchestrator::judge::{HeuristicJudge, LlmJudge};
use orchestrator::resources::WorkingCopy;
use orchestrator::test_support::{AgentScript, Fault, ScriptedFactory, ScriptedJudgeBackend};
use orchestrator::{
    ChangeSource, EvalConfig, EvaluationPipeline, JudgeDispatcher, Result, TaskReport,
    TemplatePrompts,
};
use tempfile::TempDir;

struct StaticChanges;

#[async_trait]
impl ChangeSource for StaticChanges {
    async fn changed_files(&self, _target: &EvalTarget) -> Result<Vec<ChangedFile>> {
        Ok(vec![
            ChangedFile {
                path: "src/cache.rs".to_string(),
                content: Some("pub struct LruCache { capacity: usize }".to_string()),
                diff: "+pub struct LruCache { capacity: usize }".to_string(),
            },
            ChangedFile {
                path: "src/lib.rs".to_string(),
                content: Some("pub mod cache;".to_string()),
                diff: "+pub mod cache;".to_string(),
            },
        ])
    }
}

const JUMP: [f64; 5] = [100.0, 95.0, 85.0, 30.0, 75.0];

fn heuristic(bus: &EventBus) -> JudgeDispatcher {
    JudgeDispatcher::new(Arc::new(HeuristicJudge::new()), Rubric::default(), bus.clone())
}

fn pipeline(
    config: EvalConfig,
    factory: ScriptedFactory,
    dispatcher: JudgeDispatcher,
    bus: EventBus,
) -> EvaluationPipeline {
    EvaluationPipeline::new(
        config,
        Arc::new(factory),
        Arc::new(StaticChanges),
        Arc::new(TemplatePrompts::new()),
        dispatcher,
        bus,
    )
}

fn task() -> EvalTask {
    EvalTask::new(EvalTarget::new(".", "main", "lru-cache"), AgentKind::ALL.to_vec())
}

fn session(report: &TaskReport, agent: AgentKind) -> &membreak_core::AgentSession {
    report
        .sessions
        .iter()
        .find(|s| s.agent == agent)
        .expect("session for agent")
}

#[tokio::test]
async fn test_agent_failing_at_init_does_not_stop_the_others() {
    let root = TempDir::new().unwrap();
    let bus = EventBus::new();
    let factory = ScriptedFactory::new()
        .with_script(AgentKind::Iflow, AgentScript::native(&JUMP).fail_on_start(Fault::Exit))
        .with_script(AgentKind::Claude, AgentScript::native(&JUMP))
        .with_script(AgentKind::Gemini, AgentScript::native(&[70.0, 40.0, 25.0, 20.0]));

    let report = pipeline(EvalConfig::new(root.path()), factory.clone(), heuristic(&bus), bus)
        .run(task())
        .await
        .unwrap();

    assert_eq!(report.task.status, TaskStatus::Done);
    assert_eq!(report.sessions.len(), 3);

    let iflow = session(&report, AgentKind::Iflow);
    assert_eq!(iflow.phase, SessionPhase::Failed);
    assert_eq!(iflow.attempt, 3);
    assert_eq!(factory.created(AgentKind::Iflow), 3);

    assert!(session(&report, AgentKind::Claude).is_success());
    let gemini = session(&report, AgentKind::Gemini);
    assert!(gemini.is_success());
    assert_eq!(gemini.compression.method, Some(CompressionMethod::PercentageThreshold));

    assert_eq!(report.scores.len(), 2);
    for score in &report.scores {
        assert!(score.dimensions.values().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(score.passed, score.breaking.is_empty());
    }

    assert_eq!(report.comparison.ranked.len(), 2);
    assert_eq!(report.comparison.unscored.len(), 1);
    let unscored = &report.comparison.unscored[0];
    assert_eq!(unscored.agent, AgentKind::Iflow);
    assert_eq!(unscored.failure_kind, Some(FailureKind::SetupError));
    assert_eq!(unscored.phase, Some(SessionPhase::Init));
}

#[tokio::test(start_paused = true)]
async fn test_hanging_agent_times_out_alone() {
    let root = TempDir::new().unwrap();
    let bus = EventBus::new();
    let factory = ScriptedFactory::new()
        .with_script(AgentKind::Iflow, AgentScript::native(&JUMP))
        .with_script(AgentKind::Claude, AgentScript::native(&JUMP).fail_on_send(4, Fault::Hang))
        .with_script(AgentKind::Gemini, AgentScript::native(&JUMP));
    let config = EvalConfig::new(root.path()).with_session_timeout(Duration::from_secs(30));

    let report = pipeline(config, factory.clone(), heuristic(&bus), bus)
        .run(task())
        .await
        .unwrap();

    let claude = session(&report, AgentKind::Claude);
    assert_eq!(claude.phase, SessionPhase::TimedOut);
    assert_eq!(claude.attempt, 1);
    assert_eq!(claude.outcome.as_ref().and_then(|o| o.failed_phase()), Some(SessionPhase::DeepDive));
    // the adapter is stopped even though it never answered
    assert_eq!(factory.stopped(AgentKind::Claude), 1);

    assert_eq!(report.scores.len(), 2);
    assert!(report.scores.iter().all(|s| s.agent != AgentKind::Claude));
    assert_eq!(
        report.comparison.unscored[0].failure_kind,
        Some(FailureKind::Timeout)
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_keeps_partial_transcript() {
    let root = TempDir::new().unwrap();
    let bus = EventBus::new();
    let factory = ScriptedFactory::new().with_script(
        AgentKind::Claude,
        AgentScript::native(&[90.0]).with_latency(Duration::from_secs(1)),
    );
    let pipeline = Arc::new(pipeline(EvalConfig::new(root.path()), factory, heuristic(&bus), bus));

    let runner = pipeline.clone();
    let handle = tokio::spawn(async move {
        runner
            .run(EvalTask::new(EvalTarget::new(".", "main", "topic"), vec![AgentKind::Claude]))
            .await
    });

    tokio::time::sleep(Duration::from_millis(3500)).await;
    pipeline.cancel();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.task.status, TaskStatus::Cancelled);
    let claude = session(&report, AgentKind::Claude);
    assert_eq!(claude.phase, SessionPhase::Cancelled);
    assert!(!claude.transcript.is_empty());
    assert!(report.scores.is_empty());
    assert!(report.judge_failures.is_empty());
    assert_eq!(
        report.comparison.unscored[0].failure_kind,
        Some(FailureKind::Cancelled)
    );
    assert!(!WorkingCopy::location(root.path(), claude).exists());
}

#[tokio::test]
async fn test_iteration_cap_and_unreadable_status_are_distinguishable() {
    let root = TempDir::new().unwrap();
    let bus = EventBus::new();
    let factory = ScriptedFactory::new()
        .with_script(AgentKind::Claude, AgentScript::native(&[60.0, 55.0, 50.0, 45.0]))
        .with_script(AgentKind::Iflow, AgentScript::text(&["model: busy", "no numbers here"]));
    let config = EvalConfig::new(root.path()).with_iteration_cap(Some(4));

    let report = pipeline(config, factory, heuristic(&bus), bus)
        .run(EvalTask::new(
            EvalTarget::new(".", "main", "topic"),
            vec![AgentKind::Claude, AgentKind::Iflow],
        ))
        .await
        .unwrap();

    let claude = &session(&report, AgentKind::Claude).compression;
    assert_eq!(claude.method, Some(CompressionMethod::Heuristic));
    assert_eq!(claude.availability, Some(SignalAvailability::Numeric));

    let iflow = &session(&report, AgentKind::Iflow).compression;
    assert_eq!(iflow.method, Some(CompressionMethod::Heuristic));
    assert_eq!(iflow.availability, Some(SignalAvailability::Unparseable));
}

#[tokio::test]
async fn test_out_of_range_judge_score_is_a_judge_failure() {
    let root = TempDir::new().unwrap();
    let bus = EventBus::new();
    let backend = ScriptedJudgeBackend::new()
        .reply(r#"{"scores": {"AR": 1.4, "TTL": 0.8, "LRU": 0.8, "SF": 0.8}}"#);
    let judge = LlmJudge::new(Arc::new(backend.clone()));
    let dispatcher = JudgeDispatcher::new(Arc::new(judge), Rubric::default(), bus.clone());
    let factory = ScriptedFactory::new().with_script(AgentKind::Gemini, AgentScript::native(&JUMP));

    let report = pipeline(EvalConfig::new(root.path()), factory, dispatcher, bus)
        .run(EvalTask::new(EvalTarget::new(".", "main", "topic"), vec![AgentKind::Gemini]))
        .await
        .unwrap();

    let gemini = session(&report, AgentKind::Gemini);
    assert_eq!(gemini.phase, SessionPhase::Done);
    assert!(report.scores.is_empty());
    assert_eq!(report.judge_failures.len(), 1);
    assert_eq!(report.judge_failures[0].strategy, JudgeStrategyKind::Llm);
    assert_eq!(backend.calls(), 2);

    let unscored = &report.comparison.unscored[0];
    assert_eq!(unscored.failure_kind, Some(FailureKind::JudgeError));
    assert!(unscored.message.as_deref().unwrap_or_default().contains("1.4"));
}

#[tokio::test(start_paused = true)]
async fn test_hanging_judge_does_not_stall_the_task() {
    let root = TempDir::new().unwrap();
    let bus = EventBus::new();
    let backend = ScriptedJudgeBackend::new().hang();
    let judge = LlmJudge::new(Arc::new(backend.clone()));
    let dispatcher = JudgeDispatcher::new(Arc::new(judge), Rubric::default(), bus.clone())
        .with_timeout(Duration::from_secs(60));
    let factory = ScriptedFactory::new()
        .with_script(AgentKind::Claude, AgentScript::native(&JUMP))
        .with_script(AgentKind::Gemini, AgentScript::native(&JUMP));

    let pipeline = pipeline(EvalConfig::new(root.path()), factory, dispatcher, bus);
    let run = pipeline.run(EvalTask::new(
        EvalTarget::new(".", "main", "topic"),
        vec![AgentKind::Claude, AgentKind::Gemini],
    ));
    let report = tokio::time::timeout(Duration::from_secs(24 * 3600), run)
        .await
        .expect("task finishes despite a silent judge")
        .unwrap();

    assert_eq!(report.task.status, TaskStatus::Done);
    assert!(report.scores.is_empty());
    assert_eq!(report.judge_failures.len(), 2);
    assert!(report.judge_failures.iter().all(|f| f.attempts == 2));
    assert_eq!(backend.calls(), 4);
    assert!(report
        .comparison
        .unscored
        .iter()
        .all(|u| u.failure_kind == Some(FailureKind::JudgeError)));
}
