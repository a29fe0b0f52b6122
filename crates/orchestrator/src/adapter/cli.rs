use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use membreak_core::AgentKind;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AdapterResult, AgentAdapter, AgentCapabilities, AgentContext, AgentReply};
use crate::config::CliAgentConfig;
use crate::detector::StatusReport;
use crate::error::AdapterError;

/// Agent driven by one non-interactive process invocation per turn, run
/// inside the session's working copy. Turns after the first use the
/// configured continuation arguments so the agent keeps its conversation.
pub struct CliAdapter {
    kind: AgentKind,
    config: CliAgentConfig,
    working_dir: Option<PathBuf>,
    turns: u32,
}

impl CliAdapter {
    pub fn new(kind: AgentKind, config: CliAgentConfig) -> Self {
        Self {
            kind,
            config,
            working_dir: None,
            turns: 0,
        }
    }

    fn turn_args(&self, prompt: &str) -> Vec<String> {
        let mut args = match &self.config.continue_args {
            Some(continued) if self.turns > 0 => continued.clone(),
            _ => self.config.args.clone(),
        };
        args.push(prompt.to_string());
        args
    }

    fn command(&self, cwd: &Path, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(args)
            .current_dir(cwd)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[String]) -> AdapterResult<String> {
        let cwd = self.working_dir.as_ref().ok_or(AdapterError::NotStarted)?;
        debug!(agent = %self.kind, binary = %self.config.binary, "Running agent command");

        let output = self
            .command(cwd, args)
            .output()
            .await
            .map_err(|e| AdapterError::Spawn(format!("{}: {}", self.config.binary, e)))?;

        if !output.status.success() {
            return Err(AdapterError::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl AgentAdapter for CliAdapter {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            native_status: false,
            status_command: self.config.status_args.is_some(),
            token_usage: false,
        }
    }

    async fn start(&mut self, ctx: &AgentContext) -> AdapterResult<()> {
        if !ctx.working_dir.is_dir() {
            return Err(AdapterError::Spawn(format!(
                "working directory {} does not exist",
                ctx.working_dir.display()
            )));
        }
        self.working_dir = Some(ctx.working_dir.clone());
        self.turns = 0;
        Ok(())
    }

    async fn send(&mut self, prompt: &str) -> AdapterResult<AgentReply> {
        let args = self.turn_args(prompt);
        let stdout = self.run(&args).await?;
        self.turns += 1;

        let text = stdout.trim();
        if text.is_empty() {
            return Err(AdapterError::protocol("agent produced no output"));
        }
        Ok(AgentReply::text(text))
    }

    /// A failing status command is reported as unreadable text rather than
    /// an error; a missing reading must not end the session.
    async fn status(&mut self) -> AdapterResult<StatusReport> {
        let Some(status_args) = self.config.status_args.clone() else {
            return Ok(StatusReport::Unsupported);
        };
        match self.run(&status_args).await {
            Ok(stdout) => Ok(StatusReport::Text(stdout)),
            Err(AdapterError::NotStarted) => Err(AdapterError::NotStarted),
            Err(e) => {
                warn!(agent = %self.kind, error = %e, "Status command failed");
                Ok(StatusReport::Text(String::new()))
            }
        }
    }

    async fn stop(&mut self) -> AdapterResult<()> {
        self.working_dir = None;
        self.turns = 0;
        Ok(())
    }
}
