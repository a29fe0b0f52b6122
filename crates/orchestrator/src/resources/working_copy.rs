//! Isolated per-session working copy of the changed files.

use std::path::{Component, Path, PathBuf};

use membreak_core::{AgentSession, ChangedFile};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};

/// Directory tree owned by exactly one session:
/// `<run_root>/<task_id>/agents/<agent>/<session_id>/repo`.
///
/// [`WorkingCopy::release`] removes it asynchronously; if the copy is dropped
/// without being released (an unwinding runner, a dropped future) the
/// directory is removed synchronously instead.
#[derive(Debug)]
pub struct WorkingCopy {
    root: PathBuf,
    repo: PathBuf,
    released: bool,
}

impl WorkingCopy {
    pub fn location(run_root: &Path, session: &AgentSession) -> PathBuf {
        run_root
            .join(session.task_id.to_string())
            .join("agents")
            .join(session.agent.as_str())
            .join(session.id.to_string())
    }

    /// Creates the directory and writes every file that still exists at the
    /// head revision. Deleted files are left out.
    pub async fn provision(
        run_root: &Path,
        session: &AgentSession,
        files: &[ChangedFile],
    ) -> Result<Self> {
        let root = Self::location(run_root, session);
        if root.exists() {
            return Err(OrchestratorError::setup(format!(
                "working copy {} already exists",
                root.display()
            )));
        }

        let copy = Self {
            repo: root.join("repo"),
            root,
            released: false,
        };
        tokio::fs::create_dir_all(&copy.repo).await?;

        let mut written = 0usize;
        for file in files {
            let Some(content) = &file.content else {
                continue;
            };
            let relative = safe_relative(&file.path)?;
            let dst = copy.repo.join(relative);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dst, content).await?;
            written += 1;
        }

        info!(
            session_id = %session.id,
            path = %copy.repo.display(),
            files = written,
            "Working copy provisioned"
        );
        Ok(copy)
    }

    /// Directory the agent runs in.
    pub fn path(&self) -> &Path {
        &self.repo
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if self.root.exists() {
            tokio::fs::remove_dir_all(&self.root).await?;
        }
        debug!(path = %self.root.display(), "Working copy released");
        Ok(())
    }
}

impl Drop for WorkingCopy {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.root.display(), error = %e, "Failed to remove working copy");
            }
        }
    }
}

/// Rejects absolute paths and paths that climb out of the working copy.
fn safe_relative(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    let escapes = p
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || escapes {
        return Err(OrchestratorError::setup(format!(
            "refusing to write changed file outside the working copy: {path}"
        )));
    }
    Ok(p)
}
