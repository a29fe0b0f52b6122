use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::agent::AgentKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Running,
    Judging,
    Done,
    Cancelled,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Judging => "judging",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "judging" => Some(Self::Judging),
            "done" => Some(Self::Done),
            "cancelled" => Some(Self::Cancelled),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A code change to evaluate: two revisions of a local git repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalTarget {
    pub repo_path: PathBuf,
    pub base: String,
    pub head: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl EvalTarget {
    pub fn new(repo_path: impl Into<PathBuf>, base: impl Into<String>, head: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            base: base.into(),
            head: head.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn display_name(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => format!("{}..{}", self.base, self.head),
        }
    }
}

/// One entry of the canonical changed-file set shared by every session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangedFile {
    pub path: String,
    /// File content at the head revision. `None` for deletions.
    pub content: Option<String>,
    pub diff: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalQuestion {
    pub question: String,
    #[serde(default)]
    pub reference: Option<String>,
}

impl EvalQuestion {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalTask {
    pub id: Uuid,
    pub target: EvalTarget,
    pub agents: Vec<AgentKind>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EvalTask {
    pub fn new(target: EvalTarget, agents: Vec<AgentKind>) -> Self {
        let mut agents = agents;
        agents.sort();
        agents.dedup();
        Self {
            id: Uuid::new_v4(),
            target,
            agents,
            status: TaskStatus::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let target = EvalTarget::new("/tmp/repo", "main", "feature");
        let task = EvalTask::new(
            target,
            vec![AgentKind::Gemini, AgentKind::Claude, AgentKind::Gemini],
        );

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.agents, vec![AgentKind::Claude, AgentKind::Gemini]);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_task_status_parsing() {
        assert_eq!(TaskStatus::parse("judging"), Some(TaskStatus::Judging));
        assert_eq!(TaskStatus::Cancelled.as_str(), "cancelled");
        assert_eq!(TaskStatus::parse("todo"), None);
    }

    #[test]
    fn test_task_with_id() {
        let id = Uuid::new_v4();
        let task = EvalTask::new(EvalTarget::new(".", "a", "b"), vec![]).with_id(id);
        assert_eq!(task.id, id);
    }

    #[test]
    fn test_target_display_name() {
        let target = EvalTarget::new(".", "main", "topic");
        assert_eq!(target.display_name(), "main..topic");
        assert_eq!(target.with_label("PR #12").display_name(), "PR #12");
    }
}
