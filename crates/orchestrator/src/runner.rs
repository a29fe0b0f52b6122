//! Drives one agent session through its phases.
//!
//! The runner owns the session record for its whole life. Every adapter
//! call is bounded by the session deadline and by the task cancellation
//! token; whatever happens, the adapter is stopped and the working copy is
//! released before the terminal session is handed back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use events::EventBus;
use membreak_core::{AgentSession, ChangedFile, SessionPhase};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{estimate_tokens, AdapterFactory, AgentAdapter, AgentContext, AgentReply};
use crate::collaborators::PromptSet;
use crate::config::EvalConfig;
use crate::detector::{extract_signal, CompressionDetector, SignalHistory, StatusReport};
use crate::error::{OrchestratorError, Result};
use crate::reporter::SessionReporter;
use crate::resources::{SessionGuard, WorkingCopy};
use crate::state_machine::PhaseStateMachine;

/// Upper bound on `stop()` once a session is over; the session deadline may
/// already have passed.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Inputs shared read-only by every session of a task.
#[derive(Debug, Clone)]
pub struct SessionInputs {
    pub prompts: Arc<PromptSet>,
    pub files: Arc<Vec<ChangedFile>>,
}

impl SessionInputs {
    pub fn new(prompts: PromptSet, files: Vec<ChangedFile>) -> Self {
        Self {
            prompts: Arc::new(prompts),
            files: Arc::new(files),
        }
    }
}

/// A terminal session plus whether the error that ended it allows a fresh
/// attempt.
#[derive(Debug)]
pub struct SessionRun {
    pub session: AgentSession,
    pub retryable: bool,
}

struct RunState {
    session: AgentSession,
    reporter: SessionReporter,
    guard: SessionGuard,
    deadline: Instant,
    working_copy: Option<WorkingCopy>,
    /// Status carried by the last reply, used instead of polling.
    pending_status: Option<StatusReport>,
}

#[derive(Clone)]
pub struct PhaseRunner {
    config: Arc<EvalConfig>,
    detector: CompressionDetector,
    factory: Arc<dyn AdapterFactory>,
    inputs: SessionInputs,
    bus: EventBus,
    cancel: CancellationToken,
}

impl PhaseRunner {
    pub fn new(
        config: Arc<EvalConfig>,
        factory: Arc<dyn AdapterFactory>,
        inputs: SessionInputs,
        bus: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            detector: CompressionDetector::new(&config.detector),
            config,
            factory,
            inputs,
            bus,
            cancel,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Runs `session` from INIT to a terminal phase.
    pub async fn run(&self, session: AgentSession) -> SessionRun {
        let reporter = SessionReporter::new(self.bus.clone(), &session);
        let guard = SessionGuard::new(reporter.clone());
        reporter.started();
        info!(
            session_id = %session.id,
            agent = %session.agent,
            attempt = session.attempt,
            "Starting session"
        );

        let mut st = RunState {
            session,
            reporter,
            guard,
            deadline: Instant::now() + self.config.session_timeout(),
            working_copy: None,
            pending_status: None,
        };
        let mut adapter: Option<Box<dyn AgentAdapter>> = None;

        let result = self.drive(&mut st, &mut adapter).await;

        if let Some(adapter) = adapter.as_mut() {
            match tokio::time::timeout(STOP_GRACE, adapter.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(session_id = %st.session.id, error = %e, "Failed to stop agent"),
                Err(_) => warn!(session_id = %st.session.id, "Timed out stopping agent"),
            }
        }
        if let Some(copy) = st.working_copy.take() {
            if let Err(e) = copy.release().await {
                warn!(session_id = %st.session.id, error = %e, "Failed to release working copy");
            }
        }

        let retryable = match result {
            Ok(()) => false,
            Err(e) => {
                self.terminate(&mut st, &e);
                e.is_retryable()
            }
        };

        st.guard.finish(&st.session);
        info!(
            session_id = %st.session.id,
            agent = %st.session.agent,
            phase = %st.session.phase,
            prompts = st.session.counters.prompts_sent,
            "Session finished"
        );

        SessionRun {
            session: st.session,
            retryable,
        }
    }

    async fn drive(
        &self,
        st: &mut RunState,
        slot: &mut Option<Box<dyn AgentAdapter>>,
    ) -> Result<()> {
        let adapter = slot.insert(self.factory.create(st.session.agent)?);
        let adapter = adapter.as_mut();

        self.init(st, adapter).await.map_err(|e| match e {
            OrchestratorError::Adapter(inner) => {
                OrchestratorError::setup(format!("agent failed during init: {inner}"))
            }
            other => other,
        })?;

        self.advance(st, SessionPhase::PreCompression)?;
        self.exchange(st, adapter, &self.inputs.prompts.pre_compression, 0, None)
            .await?;

        self.advance(st, SessionPhase::DeepDive)?;
        self.deep_dive(st, adapter).await?;

        self.advance(st, SessionPhase::MemoryOnly)?;
        self.exchange(st, adapter, &self.inputs.prompts.memory_only, 0, None)
            .await?;

        self.advance(st, SessionPhase::Evaluation)?;
        for (index, question) in self.inputs.prompts.questions.iter().enumerate() {
            let index = index as u32;
            let reply = self
                .exchange(st, adapter, &question.question, index, question.reference.clone())
                .await?;
            st.reporter.question_answered(index, &reply.text);
        }

        let from = st.session.phase;
        PhaseStateMachine::validate_transition(&from, &SessionPhase::Done)?;
        st.session.complete()?;
        st.reporter.phase_changed(from, SessionPhase::Done);
        Ok(())
    }

    async fn init(&self, st: &mut RunState, adapter: &mut dyn AgentAdapter) -> Result<()> {
        let copy = self
            .bounded(
                st,
                WorkingCopy::provision(&self.config.run_root, &st.session, &self.inputs.files),
            )
            .await?;
        let ctx = AgentContext {
            session_id: st.session.id,
            task_id: st.session.task_id,
            working_dir: copy.path().to_path_buf(),
        };
        st.working_copy = Some(copy);

        self.bounded(st, adapter.start(&ctx)).await?;
        self.exchange(st, adapter, &self.inputs.prompts.init, 0, None)
            .await?;
        Ok(())
    }

    async fn deep_dive(&self, st: &mut RunState, adapter: &mut dyn AgentAdapter) -> Result<()> {
        let mut history = SignalHistory::new();
        let prompt = &self.inputs.prompts.deep_dive;

        for iteration in 0..self.config.max_deep_dive_iterations {
            let report = match st.pending_status.take() {
                Some(report) => report,
                None => self.bounded(st, adapter.status()).await?,
            };
            let signal = extract_signal(iteration, &report);
            st.reporter.signal_observed(&signal);
            st.session.observe_signal(signal.clone());

            if history.push(signal) {
                if let Some(verdict) = self.detector.evaluate(&history) {
                    let trigger = history.latest().cloned();
                    let predecessor = history.previous().cloned();
                    if st.session.record_compression(&verdict, trigger, predecessor)? {
                        st.reporter.compression_detected(&verdict);
                    }
                    info!(
                        session_id = %st.session.id,
                        method = verdict.method.as_str(),
                        iteration,
                        before = ?verdict.before,
                        after = ?verdict.after,
                        "Compression detected"
                    );
                    return Ok(());
                }
            } else {
                debug!(session_id = %st.session.id, iteration, "Signal rejected by history");
            }

            self.exchange(st, adapter, prompt, iteration, None).await?;
            st.session.counters.deep_dive_iterations += 1;
        }

        info!(
            session_id = %st.session.id,
            iterations = st.session.counters.deep_dive_iterations,
            "No compression detected before the iteration limit"
        );
        Ok(())
    }

    /// Sends one prompt and records the exchange in the current phase.
    async fn exchange(
        &self,
        st: &mut RunState,
        adapter: &mut dyn AgentAdapter,
        prompt: &str,
        index: u32,
        reference: Option<String>,
    ) -> Result<AgentReply> {
        let reply = self.bounded(st, adapter.send(prompt)).await?;
        let tokens = reply
            .tokens
            .unwrap_or_else(|| estimate_tokens(prompt) + estimate_tokens(&reply.text));

        st.session
            .record_exchange(index, prompt, reply.text.clone(), reference)?;
        st.session.add_usage(tokens);
        st.pending_status = reply.status.clone();
        Ok(reply)
    }

    fn advance(&self, st: &mut RunState, to: SessionPhase) -> Result<()> {
        let from = st.session.phase;
        PhaseStateMachine::validate_transition(&from, &to)?;
        st.session.enter_phase(to)?;
        st.guard.set_phase(to);
        st.reporter.phase_changed(from, to);
        debug!(session_id = %st.session.id, from = %from, to = %to, "Phase changed");
        Ok(())
    }

    /// Moves the session into the terminal phase matching `error`.
    fn terminate(&self, st: &mut RunState, error: &OrchestratorError) {
        let from = st.session.phase;
        let result = match error {
            OrchestratorError::SessionTimeout { .. } => st.session.time_out(),
            OrchestratorError::Cancelled { .. } => st.session.cancel(),
            other => {
                warn!(
                    session_id = %st.session.id,
                    phase = %from,
                    error = %other,
                    "Session failed"
                );
                st.session.fail(other.failure_kind(), other.to_string())
            }
        };
        match result {
            Ok(()) => st.reporter.phase_changed(from, st.session.phase),
            Err(e) => warn!(session_id = %st.session.id, error = %e, "Session already terminal"),
        }
    }

    /// Awaits `fut` unless the session deadline passes or the task is
    /// cancelled first.
    async fn bounded<T, E, F>(&self, st: &RunState, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<OrchestratorError>,
    {
        let phase = st.session.phase;
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled { phase });
        }
        if Instant::now() >= st.deadline {
            return Err(self.timeout_error(phase));
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OrchestratorError::Cancelled { phase }),
            res = tokio::time::timeout_at(st.deadline, fut) => match res {
                Ok(inner) => inner.map_err(Into::into),
                Err(_) => Err(self.timeout_error(phase)),
            },
        }
    }

    fn timeout_error(&self, phase: SessionPhase) -> OrchestratorError {
        OrchestratorError::SessionTimeout {
            phase,
            duration_ms: self.config.session_timeout().as_millis() as u64,
        }
    }
}
