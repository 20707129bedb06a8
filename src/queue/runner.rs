//! Build runner.
//!
//! Executes one dispatched build end to end: clone the repository into a
//! scratch checkout, detach onto the requested sha, and build a Docker
//! image tagged for the application. Every line the child processes print
//! is streamed to the status hub so a build can be followed live.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::errors::BuildError;
use crate::status::StatusHub;

/// How many characters of the sha end up in the image tag.
const TAG_SHA_LEN: usize = 10;

/// One build, as handed over by the queue.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub application_id: i64,
    pub application_name: String,
    pub repository: String,
    pub remote: String,
    pub sha: String,
    pub age: Option<DateTime<Utc>>,
}

/// Executes builds. The production implementation shells out to `git` and
/// `docker`; tests substitute scripted runners.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run(&self, request: &BuildRequest) -> Result<(), BuildError>;
}

/// Runs builds through `git` and `docker` child processes.
pub struct ProcessBuildRunner {
    builds_dir: PathBuf,
    hub: StatusHub,
}

impl ProcessBuildRunner {
    pub fn new(builds_dir: PathBuf, hub: StatusHub) -> Self {
        Self { builds_dir, hub }
    }

    fn checkout_dir(&self, request: &BuildRequest) -> PathBuf {
        self.builds_dir.join(format!(
            "app-{}-{}",
            request.application_id,
            short_sha(&request.sha)
        ))
    }

    /// Spawn a command and forward its stdout and stderr line by line to
    /// the status hub. Returns the exit code.
    async fn run_streamed(
        &self,
        mut command: Command,
        label: &str,
        request: &BuildRequest,
    ) -> Result<i32, BuildError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| BuildError::Spawn {
            command: label.to_string(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stream_stdout = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    self.hub
                        .build_log(request.application_id, &request.remote, line);
                }
            }
        };
        let stream_stderr = async {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    self.hub
                        .build_log(request.application_id, &request.remote, line);
                }
            }
        };
        tokio::join!(stream_stdout, stream_stderr);

        let status = child.wait().await.map_err(|source| BuildError::Spawn {
            command: label.to_string(),
            source,
        })?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[async_trait]
impl BuildRunner for ProcessBuildRunner {
    async fn run(&self, request: &BuildRequest) -> Result<(), BuildError> {
        let checkout = self.checkout_dir(request);
        std::fs::create_dir_all(&self.builds_dir).map_err(|source| BuildError::Workspace {
            path: self.builds_dir.clone(),
            source,
        })?;
        if checkout.exists() {
            // Leftover checkout from an interrupted build.
            std::fs::remove_dir_all(&checkout).map_err(|source| BuildError::Workspace {
                path: checkout.clone(),
                source,
            })?;
        }

        let mut clone = Command::new("git");
        clone.arg("clone").arg(&request.repository).arg(&checkout);
        let code = self.run_streamed(clone, "git clone", request).await?;
        if code != 0 {
            return Err(BuildError::CloneFailed {
                repository: request.repository.clone(),
                exit_code: code,
            });
        }

        let mut detach = Command::new("git");
        detach
            .arg("-C")
            .arg(&checkout)
            .arg("checkout")
            .arg("--detach")
            .arg(&request.sha);
        let code = self.run_streamed(detach, "git checkout", request).await?;
        if code != 0 {
            cleanup_checkout(&checkout);
            return Err(BuildError::CheckoutFailed {
                sha: request.sha.clone(),
                exit_code: code,
            });
        }

        let tag = image_tag(&request.application_name, &request.sha);
        let mut build = Command::new("docker");
        build.arg("build").arg("-t").arg(&tag).arg(&checkout);
        let code = self.run_streamed(build, "docker build", request).await?;

        cleanup_checkout(&checkout);
        if code != 0 {
            return Err(BuildError::ImageBuildFailed { exit_code: code });
        }
        tracing::info!(
            application_id = request.application_id,
            remote = %request.remote,
            image = %tag,
            "Image built"
        );
        Ok(())
    }
}

fn cleanup_checkout(checkout: &std::path::Path) {
    if let Err(e) = std::fs::remove_dir_all(checkout) {
        tracing::warn!(path = %checkout.display(), error = %e, "Failed to remove build checkout");
    }
}

fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(TAG_SHA_LEN)]
}

/// Docker image tag for an application build. Names are slugged down to
/// the character set Docker repositories accept.
pub fn image_tag(application_name: &str, sha: &str) -> String {
    let slug: String = application_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("slipway/{}:{}", slug.trim_matches('-'), short_sha(sha))
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusEvent;
    use tempfile::tempdir;

    fn sample_request() -> BuildRequest {
        BuildRequest {
            application_id: 5,
            application_name: "My App".to_string(),
            repository: "/tmp/nowhere".to_string(),
            remote: "main".to_string(),
            sha: "0123456789abcdef0123456789abcdef01234567".to_string(),
            age: Some(Utc::now()),
        }
    }

    #[test]
    fn test_image_tag_slugs_name_and_shortens_sha() {
        let tag = image_tag("My App", "0123456789abcdef0123456789abcdef01234567");
        assert_eq!(tag, "slipway/my-app:0123456789");
    }

    #[test]
    fn test_image_tag_handles_short_sha() {
        let tag = image_tag("demo", "abc");
        assert_eq!(tag, "slipway/demo:abc");
    }

    #[test]
    fn test_checkout_dir_is_unique_per_app_and_sha() {
        let dir = tempdir().unwrap();
        let runner = ProcessBuildRunner::new(dir.path().to_path_buf(), StatusHub::new());
        let path = runner.checkout_dir(&sample_request());
        assert!(path.ends_with("app-5-0123456789"));
    }

    #[tokio::test]
    async fn test_run_streamed_forwards_output_lines() {
        let dir = tempdir().unwrap();
        let hub = StatusHub::new();
        let mut rx = hub.subscribe();
        let runner = ProcessBuildRunner::new(dir.path().to_path_buf(), hub);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo one; echo two 1>&2");
        let code = runner
            .run_streamed(cmd, "sh", &sample_request())
            .await
            .unwrap();
        assert_eq!(code, 0);

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StatusEvent::BuildLog { line, .. } = event {
                lines.push(line);
            }
        }
        lines.sort();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_run_streamed_reports_exit_code() {
        let dir = tempdir().unwrap();
        let runner = ProcessBuildRunner::new(dir.path().to_path_buf(), StatusHub::new());

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 3");
        let code = runner
            .run_streamed(cmd, "sh", &sample_request())
            .await
            .unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_spawn_failure_names_the_command() {
        let dir = tempdir().unwrap();
        let runner = ProcessBuildRunner::new(dir.path().to_path_buf(), StatusHub::new());

        let cmd = Command::new("definitely-not-a-real-binary-1f2e3d");
        let err = runner
            .run_streamed(cmd, "definitely-not-a-real-binary-1f2e3d", &sample_request())
            .await
            .unwrap_err();
        match err {
            BuildError::Spawn { command, .. } => {
                assert_eq!(command, "definitely-not-a-real-binary-1f2e3d")
            }
            other => panic!("Expected Spawn error, got {other:?}"),
        }
    }
}
