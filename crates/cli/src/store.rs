//! JSON files under `<run_root>/<task_id>/` holding everything a task
//! produced, so the comparison can be recomputed later.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use events::EventEnvelope;
use membreak_core::{AgentSession, EvalTask, Score};
use orchestrator::{aggregate, Comparison, JudgeFailure, TaskReport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

const TASK_FILE: &str = "task.json";
const COMPARISON_FILE: &str = "comparison.json";
const EVENTS_FILE: &str = "events.jsonl";
const SESSIONS_DIR: &str = "sessions";
const SCORES_DIR: &str = "scores";
const JUDGE_FAILURES_DIR: &str = "judge_failures";

/// What `rank` reads back from disk.
#[derive(Debug)]
pub struct StoredTask {
    pub task: EvalTask,
    pub sessions: Vec<AgentSession>,
    pub scores: Vec<Score>,
    pub judge_failures: Vec<JudgeFailure>,
}

impl StoredTask {
    pub fn comparison(&self) -> Comparison {
        aggregate(&self.sessions, &self.scores, &self.judge_failures)
    }
}

pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn task_dir(&self, task_id: Uuid) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    pub async fn save(&self, report: &TaskReport) -> Result<PathBuf> {
        let dir = self.task_dir(report.task.id);
        for sub in [SESSIONS_DIR, SCORES_DIR, JUDGE_FAILURES_DIR] {
            tokio::fs::create_dir_all(dir.join(sub))
                .await
                .with_context(|| format!("Failed to create {}", dir.join(sub).display()))?;
        }

        write_json(&dir.join(TASK_FILE), &report.task).await?;
        for session in &report.sessions {
            let name = format!("{}-{}.json", session.agent, session.id);
            write_json(&dir.join(SESSIONS_DIR).join(name), session).await?;
        }
        for score in &report.scores {
            let name = format!("{}.json", score.session_id);
            write_json(&dir.join(SCORES_DIR).join(name), score).await?;
        }
        for failure in &report.judge_failures {
            let name = format!("{}.json", failure.session_id);
            write_json(&dir.join(JUDGE_FAILURES_DIR).join(name), failure).await?;
        }
        write_json(&dir.join(COMPARISON_FILE), &report.comparison).await?;

        tracing::debug!(task_id = %report.task.id, dir = %dir.display(), "Task results stored");
        Ok(dir)
    }

    pub async fn save_events(&self, task_id: Uuid, events: &[EventEnvelope]) -> Result<()> {
        let mut lines = String::new();
        for envelope in events {
            lines.push_str(&serde_json::to_string(envelope)?);
            lines.push('\n');
        }
        let path = self.task_dir(task_id).join(EVENTS_FILE);
        tokio::fs::write(&path, lines)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub async fn load(&self, task_id: Uuid) -> Result<StoredTask> {
        let dir = self.task_dir(task_id);
        if !dir.join(TASK_FILE).exists() {
            anyhow::bail!("No stored results for task {} under {}", task_id, self.root.display());
        }

        let task = read_json(&dir.join(TASK_FILE)).await?;
        let mut sessions: Vec<AgentSession> = read_dir_json(&dir.join(SESSIONS_DIR)).await?;
        sessions.sort_by_key(|s| (s.agent, s.attempt));
        Ok(StoredTask {
            task,
            sessions,
            scores: read_dir_json(&dir.join(SCORES_DIR)).await?,
            judge_failures: read_dir_json(&dir.join(JUDGE_FAILURES_DIR)).await?,
        })
    }

    /// Ids of every task with stored results, sorted.
    pub async fn task_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e).context("Failed to list run root"),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) {
                if entry.path().join(TASK_FILE).exists() {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

async fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(items),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            items.push(read_json(&path).await?);
        }
    }
    Ok(items)
}
