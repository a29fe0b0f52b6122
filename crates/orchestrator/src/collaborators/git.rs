use std::path::Path;

use async_trait::async_trait;
use membreak_core::{ChangedFile, EvalTarget};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::ChangeSource;
use crate::error::{OrchestratorError, Result};

/// Reads the changed-file set between two revisions of a local git
/// repository.
#[derive(Debug, Clone)]
pub struct GitChangeSource {
    max_files: usize,
}

impl GitChangeSource {
    pub fn new(max_files: usize) -> Self {
        Self { max_files }
    }

    async fn run_git(&self, args: &[&str], cwd: &Path) -> Result<String> {
        debug!("Running git {:?} in {:?}", args, cwd);

        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| OrchestratorError::collaborator("git", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::collaborator(
                "git",
                format!("git {} failed: {}", args.join(" "), stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Content at `head`, or `None` when the path no longer exists there.
    async fn content_at(&self, target: &EvalTarget, path: &str) -> Option<String> {
        let spec = format!("{}:{}", target.head, path);
        match self.run_git(&["show", &spec], &target.repo_path).await {
            Ok(content) => Some(content),
            Err(e) => {
                debug!(path, error = %e, "No content at head");
                None
            }
        }
    }
}

#[async_trait]
impl ChangeSource for GitChangeSource {
    async fn changed_files(&self, target: &EvalTarget) -> Result<Vec<ChangedFile>> {
        if !target.repo_path.is_dir() {
            return Err(OrchestratorError::collaborator(
                "git",
                format!("repository {} does not exist", target.repo_path.display()),
            ));
        }

        let names = self
            .run_git(
                &["diff", "--name-only", &target.base, &target.head],
                &target.repo_path,
            )
            .await?;

        let paths: Vec<&str> = names.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if paths.len() > self.max_files {
            warn!(
                total = paths.len(),
                max_files = self.max_files,
                "Change touches more files than allowed, truncating"
            );
        }

        let mut files = Vec::new();
        for path in paths.into_iter().take(self.max_files) {
            let content = self.content_at(target, path).await;
            let diff = self
                .run_git(
                    &["diff", &target.base, &target.head, "--", path],
                    &target.repo_path,
                )
                .await?;
            files.push(ChangedFile {
                path: path.to_string(),
                content,
                diff,
            });
        }

        info!(
            target = %target.display_name(),
            files = files.len(),
            "Collected changed files"
        );
        Ok(files)
    }
}
