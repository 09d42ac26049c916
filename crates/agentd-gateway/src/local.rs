//! In-process sandbox running actions against a rooted workspace directory.

use std::{
    path::{Component, Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

use agentd_events::{Action, ObservationKind, SessionId};

use crate::transport::{
    SandboxProvider, SandboxRequest, SandboxResponse, SandboxTransport, TransportError,
};

/// Local sandbox configuration.
#[derive(Debug, Clone)]
pub struct LocalSandboxConfig {
    /// Directory all file paths and command working directories resolve
    /// under. Paths escaping it are rejected in-band.
    pub workspace_root: PathBuf,
    /// Cap on captured command/browse output.
    pub max_output_bytes: usize,
}

impl LocalSandboxConfig {
    /// Config rooted at `workspace_root` with a 1 MiB output cap.
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self { workspace_root: workspace_root.into(), max_output_bytes: 1_048_576 }
    }
}

/// In-process execution environment for local runs and tests.
///
/// Runs commands through `sh -c` in the workspace root, serves file reads
/// and writes under it, and fetches URLs for browse actions. All expected
/// failures are reported in-band as observations.
pub struct LocalSandbox {
    config: LocalSandboxConfig,
    http: reqwest::Client,
}

impl LocalSandbox {
    /// Create a sandbox over `config`.
    #[must_use]
    pub fn new(config: LocalSandboxConfig) -> Self {
        Self { config, http: reqwest::Client::new() }
    }

    /// Resolve `path` under the workspace root, rejecting absolute paths and
    /// parent traversal.
    fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            return Err(format!("absolute paths are not allowed: {path}"));
        }
        if candidate.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(format!("path escapes the workspace: {path}"));
        }
        Ok(self.config.workspace_root.join(candidate))
    }

    fn truncate(&self, mut output: String) -> String {
        if output.len() > self.config.max_output_bytes {
            output.truncate(self.config.max_output_bytes);
            output.push_str("\n[output truncated]");
        }
        output
    }

    async fn run_command(
        &self,
        command: &str,
        budget: Duration,
    ) -> Result<ObservationKind, TransportError> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.config.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Unreachable(format!("spawn failed: {e}")))?;

        let output = match tokio::time::timeout(budget, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Ok(ObservationKind::Error { message: format!("command wait failed: {e}") });
            }
            Err(_elapsed) => {
                // kill_on_drop reaps the child; report the timeout in-band.
                return Ok(ObservationKind::CommandOutput {
                    command: command.to_string(),
                    output: String::new(),
                    exit_code: None,
                    error: true,
                    timeout: true,
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ObservationKind::CommandOutput {
            command: command.to_string(),
            output: self.truncate(combined),
            exit_code: output.status.code(),
            error: !output.status.success(),
            timeout: false,
        })
    }

    async fn read_file(&self, path: &str) -> ObservationKind {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(message) => return ObservationKind::Error { message },
        };
        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => ObservationKind::FileContent {
                path: path.to_string(),
                content: self.truncate(content),
            },
            Err(e) => ObservationKind::Error { message: format!("read {path}: {e}") },
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> ObservationKind {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(message) => return ObservationKind::Error { message },
        };
        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ObservationKind::Error { message: format!("write {path}: {e}") };
            }
        }
        match tokio::fs::write(&resolved, content.as_bytes()).await {
            Ok(()) => ObservationKind::FileWritten {
                path: path.to_string(),
                bytes_written: content.len() as u64,
            },
            Err(e) => ObservationKind::Error { message: format!("write {path}: {e}") },
        }
    }

    async fn browse(&self, url: &str, budget: Duration) -> ObservationKind {
        let response = match self.http.get(url).timeout(budget).send().await {
            Ok(r) => r,
            Err(e) => return ObservationKind::Error { message: format!("browse {url}: {e}") },
        };
        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => ObservationKind::BrowseResult {
                url: url.to_string(),
                status,
                content: self.truncate(body),
            },
            Err(e) => ObservationKind::Error { message: format!("browse {url}: {e}") },
        }
    }
}

#[async_trait]
impl SandboxTransport for LocalSandbox {
    async fn connect(&self) -> Result<(), TransportError> {
        // In-process; nothing to re-establish.
        Ok(())
    }

    async fn execute_action(
        &self,
        request: SandboxRequest,
    ) -> Result<SandboxResponse, TransportError> {
        let budget = Duration::from_secs(request.max_duration_secs);
        let observation = match &request.action {
            Action::RunCommand { command, timeout_secs } => {
                let budget = timeout_secs.map_or(budget, |secs| {
                    budget.min(Duration::from_secs(secs))
                });
                self.run_command(command, budget).await?
            }
            Action::ReadFile { path } => self.read_file(path).await,
            Action::WriteFile { path, content } => self.write_file(path, content).await,
            Action::Browse { url } => self.browse(url, budget).await,
            other => ObservationKind::Error {
                message: format!("{} is not executable in a sandbox", other.kind_name()),
            },
        };
        Ok(SandboxResponse { observation })
    }
}

/// Provisions one `LocalSandbox` per session, each rooted in its own
/// subdirectory of a shared base.
pub struct LocalSandboxProvider {
    base_root: PathBuf,
    max_output_bytes: usize,
}

impl LocalSandboxProvider {
    /// Provider creating per-session workspaces under `base_root`.
    #[must_use]
    pub fn new(base_root: impl Into<PathBuf>) -> Self {
        Self { base_root: base_root.into(), max_output_bytes: 1_048_576 }
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn provision(
        &self,
        session_id: SessionId,
    ) -> Result<Arc<dyn SandboxTransport>, TransportError> {
        let workspace_root = self.base_root.join(session_id.to_string());
        tokio::fs::create_dir_all(&workspace_root)
            .await
            .map_err(|e| TransportError::Provision(e.to_string()))?;

        let config = LocalSandboxConfig {
            workspace_root,
            max_output_bytes: self.max_output_bytes,
        };
        Ok(Arc::new(LocalSandbox::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(dir: &Path) -> LocalSandbox {
        LocalSandbox::new(LocalSandboxConfig::new(dir))
    }

    fn request(action: Action) -> SandboxRequest {
        SandboxRequest { action, max_duration_secs: 5 }
    }

    #[tokio::test]
    async fn echo_produces_literal_output() {
        let dir = tempfile::tempdir().unwrap();
        let response = sandbox(dir.path())
            .execute_action(request(Action::RunCommand {
                command: "echo hi".to_string(),
                timeout_secs: None,
            }))
            .await
            .unwrap();

        match response.observation {
            ObservationKind::CommandOutput { output, exit_code, error, timeout, .. } => {
                assert_eq!(output, "hi\n");
                assert_eq!(exit_code, Some(0));
                assert!(!error);
                assert!(!timeout);
            }
            other => panic!("unexpected observation: {other:?}"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_is_in_band() {
        let dir = tempfile::tempdir().unwrap();
        let response = sandbox(dir.path())
            .execute_action(request(Action::RunCommand {
                command: "exit 3".to_string(),
                timeout_secs: None,
            }))
            .await
            .unwrap();

        match response.observation {
            ObservationKind::CommandOutput { exit_code, error, .. } => {
                assert_eq!(exit_code, Some(3));
                assert!(error);
            }
            other => panic!("unexpected observation: {other:?}"),
        }
    }

    #[tokio::test]
    async fn overlong_command_reports_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let response = sandbox(dir.path())
            .execute_action(SandboxRequest {
                action: Action::RunCommand {
                    command: "sleep 5".to_string(),
                    timeout_secs: Some(1),
                },
                max_duration_secs: 1,
            })
            .await
            .unwrap();

        match response.observation {
            ObservationKind::CommandOutput { error, timeout, .. } => {
                assert!(error);
                assert!(timeout);
            }
            other => panic!("unexpected observation: {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(dir.path());

        let written = sandbox
            .execute_action(request(Action::WriteFile {
                path: "notes/todo.txt".to_string(),
                content: "ship it".to_string(),
            }))
            .await
            .unwrap();
        assert!(matches!(
            written.observation,
            ObservationKind::FileWritten { bytes_written: 7, .. }
        ));

        let read = sandbox
            .execute_action(request(Action::ReadFile { path: "notes/todo.txt".to_string() }))
            .await
            .unwrap();
        match read.observation {
            ObservationKind::FileContent { content, .. } => assert_eq!(content, "ship it"),
            other => panic!("unexpected observation: {other:?}"),
        }
    }

    #[tokio::test]
    async fn path_traversal_is_rejected_in_band() {
        let dir = tempfile::tempdir().unwrap();
        let response = sandbox(dir.path())
            .execute_action(request(Action::ReadFile { path: "../etc/passwd".to_string() }))
            .await
            .unwrap();
        assert!(matches!(response.observation, ObservationKind::Error { .. }));

        let response = sandbox(dir.path())
            .execute_action(request(Action::ReadFile { path: "/etc/passwd".to_string() }))
            .await
            .unwrap();
        assert!(matches!(response.observation, ObservationKind::Error { .. }));
    }

    #[tokio::test]
    async fn missing_file_is_in_band() {
        let dir = tempfile::tempdir().unwrap();
        let response = sandbox(dir.path())
            .execute_action(request(Action::ReadFile { path: "nope.txt".to_string() }))
            .await
            .unwrap();
        assert!(matches!(response.observation, ObservationKind::Error { .. }));
    }
}
