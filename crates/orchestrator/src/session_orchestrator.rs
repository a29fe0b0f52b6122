//! Fan-out of one session per agent, with per-session retries and failure
//! isolation.

use std::sync::Arc;

use events::EventBus;
use membreak_core::{AgentKind, AgentSession, EvalTask, FailureKind};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapter::AdapterFactory;
use crate::config::EvalConfig;
use crate::reporter::SessionReporter;
use crate::runner::{PhaseRunner, SessionInputs, SessionRun};

pub struct SessionOrchestrator {
    config: Arc<EvalConfig>,
    factory: Arc<dyn AdapterFactory>,
    bus: EventBus,
    cancel: CancellationToken,
}

impl SessionOrchestrator {
    pub fn new(config: Arc<EvalConfig>, factory: Arc<dyn AdapterFactory>, bus: EventBus) -> Self {
        Self {
            config,
            factory,
            bus,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels every in-flight session of every task run by this orchestrator.
    pub fn cancel(&self) {
        info!("Cancelling all sessions");
        self.cancel.cancel();
    }

    /// Starts one independent session per agent and yields each one as soon
    /// as it reaches a terminal phase. A failing, hanging or panicking
    /// session never affects its siblings.
    pub fn run(
        &self,
        task: &EvalTask,
        agents: &[AgentKind],
        inputs: SessionInputs,
    ) -> ReceiverStream<AgentSession> {
        let (tx, rx) = mpsc::channel(agents.len().max(1));
        let runner = PhaseRunner::new(
            self.config.clone(),
            self.factory.clone(),
            inputs,
            self.bus.clone(),
            self.cancel.clone(),
        );

        for &agent in agents {
            let supervisor = Supervisor {
                runner: runner.clone(),
                task_id: task.id,
                agent,
                max_retries: self.config.max_session_retries,
                cancel: self.cancel.clone(),
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let session = supervisor.run().await;
                if tx.send(session).await.is_err() {
                    warn!(agent = %agent, "Finished-session receiver dropped");
                }
            });
        }

        info!(task_id = %task.id, sessions = agents.len(), "Sessions started");
        ReceiverStream::new(rx)
    }
}

/// Owns the attempts of one agent within a task.
struct Supervisor {
    runner: PhaseRunner,
    task_id: Uuid,
    agent: AgentKind,
    max_retries: u32,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) -> AgentSession {
        let mut attempt = 1;
        loop {
            let session = AgentSession::new(self.task_id, self.agent).with_attempt(attempt);
            let run = self.attempt(session).await;

            let kind = run.session.outcome.as_ref().and_then(|o| o.failure_kind());
            let retry = run.retryable && attempt <= self.max_retries && !self.cancel.is_cancelled();
            if !retry {
                return run.session;
            }

            warn!(
                agent = %self.agent,
                session_id = %run.session.id,
                attempt,
                failure = ?kind,
                "Restarting session from scratch"
            );
            SessionReporter::new(self.runner.event_bus().clone(), &run.session)
                .retrying(kind.unwrap_or(FailureKind::AdapterError), attempt + 1);
            attempt += 1;
        }
    }

    /// Runs one attempt on its own task so a panic stays contained.
    async fn attempt(&self, session: AgentSession) -> SessionRun {
        let mut fallback = session.clone();
        let runner = self.runner.clone();

        match tokio::spawn(async move { runner.run(session).await }).await {
            Ok(run) => run,
            Err(e) => {
                error!(agent = %self.agent, session_id = %fallback.id, error = %e, "Session runner crashed");
                if let Err(err) = fallback.fail(FailureKind::AdapterError, format!("runner crashed: {e}")) {
                    warn!(error = %err, "Could not mark crashed session failed");
                }
                SessionRun {
                    session: fallback,
                    retryable: false,
                }
            }
        }
    }
}
