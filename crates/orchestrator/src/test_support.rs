//! Scripted collaborators for tests: an agent whose replies, status
//! readings and failures are fixed up front, and a judge backend that
//! returns canned completions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use membreak_core::AgentKind;

use crate::adapter::{
    AdapterFactory, AdapterResult, AgentAdapter, AgentCapabilities, AgentContext, AgentReply,
};
use crate::detector::StatusReport;
use crate::error::{AdapterError, JudgeError, JudgeResult};
use crate::judge::JudgeBackend;

const DEFAULT_ANSWER: &str = "The change adds a cache module. The main function `load` \
reads the config file and the class `Store` wraps the database service, because the \
API layer depends on it. I would implement something similar with the same approach. \
If the rollback happens we should revert the import and keep the interface.";

/// Injected misbehavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Process could not be spawned (transient).
    Spawn,
    /// Non-zero exit (not transient).
    Exit,
    /// Reply could not be understood.
    Protocol,
    /// Never returns.
    Hang,
    Panic,
}

impl Fault {
    async fn trigger(self) -> AdapterError {
        match self {
            Fault::Spawn => AdapterError::Spawn("scripted spawn failure".to_string()),
            Fault::Exit => AdapterError::Exit {
                code: Some(1),
                stderr: "scripted exit".to_string(),
            },
            Fault::Protocol => AdapterError::protocol("scripted protocol failure"),
            Fault::Hang => {
                std::future::pending::<()>().await;
                AdapterError::NotStarted
            }
            Fault::Panic => panic!("scripted agent panic"),
        }
    }
}

/// How a scripted agent behaves for one attempt.
#[derive(Debug, Clone, Default)]
pub struct AgentScript {
    /// Status readings returned in order; the last one repeats.
    pub statuses: Vec<StatusReport>,
    pub answers: Vec<String>,
    pub start_fault: Option<Fault>,
    /// `(n, fault)`: the n-th `send` (1-based) fails.
    pub send_fault: Option<(u32, Fault)>,
    /// Delay before every reply.
    pub latency: Option<Duration>,
    /// Faults apply only to the first `n` attempts; `None` means every attempt.
    pub faulty_attempts: Option<u32>,
}

impl AgentScript {
    pub fn native(remaining: &[f64]) -> Self {
        Self {
            statuses: remaining
                .iter()
                .map(|v| StatusReport::Native { remaining_pct: *v })
                .collect(),
            ..Self::default()
        }
    }

    pub fn text(lines: &[&str]) -> Self {
        Self {
            statuses: lines.iter().map(|l| StatusReport::Text(l.to_string())).collect(),
            ..Self::default()
        }
    }

    pub fn with_answers(mut self, answers: &[&str]) -> Self {
        self.answers = answers.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn fail_on_start(mut self, fault: Fault) -> Self {
        self.start_fault = Some(fault);
        self
    }

    pub fn fail_on_send(mut self, nth: u32, fault: Fault) -> Self {
        self.send_fault = Some((nth, fault));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn faulty_for(mut self, attempts: u32) -> Self {
        self.faulty_attempts = Some(attempts);
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    created: HashMap<AgentKind, u32>,
    stopped: HashMap<AgentKind, u32>,
    prompts: HashMap<AgentKind, Vec<String>>,
}

/// Builds [`ScriptedAgent`]s and records what they were asked.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFactory {
    scripts: HashMap<AgentKind, AgentScript>,
    counters: Arc<Mutex<Counters>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, kind: AgentKind, script: AgentScript) -> Self {
        self.scripts.insert(kind, script);
        self
    }

    pub fn created(&self, kind: AgentKind) -> u32 {
        self.lock().created.get(&kind).copied().unwrap_or(0)
    }

    pub fn stopped(&self, kind: AgentKind) -> u32 {
        self.lock().stopped.get(&kind).copied().unwrap_or(0)
    }

    pub fn prompts(&self, kind: AgentKind) -> Vec<String> {
        self.lock().prompts.get(&kind).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AdapterFactory for ScriptedFactory {
    fn create(&self, kind: AgentKind) -> AdapterResult<Box<dyn AgentAdapter>> {
        let script = self
            .scripts
            .get(&kind)
            .cloned()
            .ok_or_else(|| AdapterError::NotConfigured(format!("no script for {kind}")))?;

        let attempt = {
            let mut counters = self.lock();
            let n = counters.created.entry(kind).or_insert(0);
            *n += 1;
            *n
        };
        let faulty = script.faulty_attempts.map_or(true, |n| attempt <= n);

        Ok(Box::new(ScriptedAgent {
            kind,
            statuses: script.statuses.iter().cloned().collect(),
            last_status: None,
            answers: script.answers.clone(),
            start_fault: script.start_fault.filter(|_| faulty),
            send_fault: script.send_fault.filter(|_| faulty),
            latency: script.latency,
            sent: 0,
            started: false,
            counters: self.counters.clone(),
        }))
    }
}

pub struct ScriptedAgent {
    kind: AgentKind,
    statuses: VecDeque<StatusReport>,
    last_status: Option<StatusReport>,
    answers: Vec<String>,
    start_fault: Option<Fault>,
    send_fault: Option<(u32, Fault)>,
    latency: Option<Duration>,
    sent: u32,
    started: bool,
    counters: Arc<Mutex<Counters>>,
}

#[async_trait]
impl AgentAdapter for ScriptedAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            native_status: matches!(self.statuses.front(), Some(StatusReport::Native { .. })),
            status_command: matches!(self.statuses.front(), Some(StatusReport::Text(_))),
            token_usage: true,
        }
    }

    async fn start(&mut self, _ctx: &AgentContext) -> AdapterResult<()> {
        if let Some(fault) = self.start_fault {
            return Err(fault.trigger().await);
        }
        self.started = true;
        Ok(())
    }

    async fn send(&mut self, prompt: &str) -> AdapterResult<AgentReply> {
        if !self.started {
            return Err(AdapterError::NotStarted);
        }
        self.sent += 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some((nth, fault)) = self.send_fault {
            if nth == self.sent {
                return Err(fault.trigger().await);
            }
        }

        {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.prompts.entry(self.kind).or_default().push(prompt.to_string());
        }

        let text = if self.answers.is_empty() {
            DEFAULT_ANSWER.to_string()
        } else {
            self.answers[(self.sent as usize - 1) % self.answers.len()].clone()
        };
        Ok(AgentReply {
            tokens: Some((prompt.len() + text.len()) as u64 / 4),
            text,
            status: None,
        })
    }

    async fn status(&mut self) -> AdapterResult<StatusReport> {
        if let Some(next) = self.statuses.pop_front() {
            self.last_status = Some(next);
        }
        Ok(self.last_status.clone().unwrap_or(StatusReport::Unsupported))
    }

    async fn stop(&mut self) -> AdapterResult<()> {
        self.started = false;
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *counters.stopped.entry(self.kind).or_insert(0) += 1;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum JudgeReply {
    Text(String),
    Fail(String),
    Hang,
}

/// Judge backend returning queued completions in order; the last one
/// repeats. `fail` entries surface as backend failures, `hang` never answers.
#[derive(Debug, Clone, Default)]
pub struct ScriptedJudgeBackend {
    replies: Arc<Mutex<VecDeque<JudgeReply>>>,
    last: Arc<Mutex<Option<JudgeReply>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedJudgeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(JudgeReply::Text(text.into()))
    }

    pub fn fail(self, error: impl Into<String>) -> Self {
        self.push(JudgeReply::Fail(error.into()))
    }

    pub fn hang(self) -> Self {
        self.push(JudgeReply::Hang)
    }

    fn push(self, item: JudgeReply) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn next_reply(&self) -> Option<JudgeReply> {
        let next = self.replies.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(next) = next {
            *last = Some(next);
        }
        last.clone()
    }
}

#[async_trait]
impl JudgeBackend for ScriptedJudgeBackend {
    fn model(&self) -> Option<&str> {
        Some("scripted")
    }

    async fn complete(&self, prompt: &str) -> JudgeResult<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());

        match self.next_reply() {
            Some(JudgeReply::Text(text)) => Ok(text),
            Some(JudgeReply::Fail(error)) => Err(JudgeError::Backend(error)),
            Some(JudgeReply::Hang) => std::future::pending().await,
            None => Err(JudgeError::Backend("no scripted reply".to_string())),
        }
    }
}
