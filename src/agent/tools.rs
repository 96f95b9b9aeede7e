//! File-system tools delivered to agents.
//!
//! Every path argument is normalised and rejected if its resolved real
//! path (after symlink resolution) lies outside the CR's worktree
//! directory. `run_command` enforces a timeout and kills the process on
//! expiry.

use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Path escapes the worktree: {path}")]
    PathEscape { path: String },

    #[error("Command timed out after {timeout_secs}s")]
    CommandTimeout { timeout_secs: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Captured output of a `run_command` invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Tools confined to one worktree directory.
pub struct WorktreeTools {
    /// Canonicalized worktree root.
    root: PathBuf,
}

impl WorktreeTools {
    pub fn new(worktree: &Path) -> Result<Self> {
        let root = worktree
            .canonicalize()
            .with_context(|| format!("Failed to canonicalize worktree {}", worktree.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path argument against the worktree root.
    ///
    /// Symlinks are resolved component by component as long as the prefix
    /// exists; `..` is then applied to the already-resolved prefix, so a
    /// traversal cannot smuggle the path outside via a link.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let joined = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            self.root.join(raw)
        };

        let mut resolved = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => resolved.push(component),
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::Normal(part) => {
                    resolved.push(part);
                    if resolved.exists()
                        && let Ok(canonical) = resolved.canonicalize()
                    {
                        resolved = canonical;
                    }
                }
            }
        }

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(ToolError::PathEscape {
                path: raw.to_string(),
            })
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<String, ToolError> {
        let resolved = self.resolve(path)?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .with_context(|| format!("Failed to read {}", resolved.display()))?;
        Ok(content)
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), ToolError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .with_context(|| format!("Failed to write {}", resolved.display()))?;
        Ok(())
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<String>, ToolError> {
        let resolved = self.resolve(path)?;
        let mut entries = tokio::fs::read_dir(&resolved)
            .await
            .with_context(|| format!("Failed to list {}", resolved.display()))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("Failed to read directory entry")?
        {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    /// Run a shell command in the worktree with a timeout (default 120 s).
    /// On expiry the process is killed and a timeout error returned.
    pub async fn run_command(
        &self,
        cmd: &str,
        timeout_secs: Option<u64>,
    ) -> Result<CommandOutput, ToolError> {
        let timeout_secs = timeout_secs.unwrap_or(120);
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.root)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn command")?;
        // Close stdin explicitly for commands that read it.
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.shutdown().await;
        }

        let waited =
            tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await;
        match waited {
            Ok(output) => {
                let output = output.context("Failed to collect command output")?;
                Ok(CommandOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                })
            }
            Err(_) => Err(ToolError::CommandTimeout { timeout_secs }),
        }
    }
}
