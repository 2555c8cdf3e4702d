//! Deployment handoff.
//!
//! Once the readiness gate passes, the published outputs are handed to
//! the deployment collaborator: a remote executor runs the delegated
//! container rollover (pull, stop old, start new) and a notifier tells
//! whoever listens. Both collaborators are capability traits; this
//! module composes and dispatches, it does not deploy.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::DeployTargetConfig;
use crate::error::{GangwayError, HandoffError, OutputError, Result};
use crate::outputs::{OutputSet, OUTPUT_PUBLIC_IP};

/// Output of a remote command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code of the command.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the command exited successfully.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Registry credentials resolved by the caller.
#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    /// Registry server.
    pub server: String,
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: String,
}

/// Capability trait for remote command execution.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Executes a script on a remote host as the given user.
    async fn execute(&self, host: &str, user: &str, script: &str) -> Result<CommandOutput>;
}

/// Capability trait for downstream notification.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers a notification.
    async fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

/// Remote executor that shells out to the system `ssh`.
#[derive(Debug)]
pub struct SshRemoteExecutor {
    /// Optional identity file.
    identity_file: Option<PathBuf>,
    /// SSH connect timeout in seconds.
    connect_timeout_secs: u64,
}

impl Default for SshRemoteExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SshRemoteExecutor {
    /// Creates a new executor with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            identity_file: None,
            connect_timeout_secs: 10,
        }
    }

    /// Sets the identity file.
    #[must_use]
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }
}

#[async_trait]
impl RemoteExecutor for SshRemoteExecutor {
    async fn execute(&self, host: &str, user: &str, script: &str) -> Result<CommandOutput> {
        debug!("Executing remote script on {user}@{host}");

        let mut command = Command::new("ssh");
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs));

        if let Some(identity) = &self.identity_file {
            command.arg("-i").arg(identity);
        }

        command
            .arg(format!("{user}@{host}"))
            .arg("bash -s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            GangwayError::Handoff(HandoffError::Launch {
                message: format!("Failed to spawn ssh: {e}"),
            })
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await.map_err(|e| {
                GangwayError::Handoff(HandoffError::Launch {
                    message: format!("Failed to write script to ssh: {e}"),
                })
            })?;
        }

        let output = child.wait_with_output().await.map_err(|e| {
            GangwayError::Handoff(HandoffError::Launch {
                message: format!("Failed to wait for ssh: {e}"),
            })
        })?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Notifier that records the handoff in the log stream.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    /// Creates a new log notifier.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        info!("{subject}: {body}");
        Ok(())
    }
}

/// Report of a completed handoff.
#[derive(Debug, Clone)]
pub struct HandoffReport {
    /// Host the deployment ran on.
    pub host: String,
    /// Image that was deployed.
    pub image: String,
    /// Container name.
    pub container_name: String,
}

/// Hands published outputs to the deployment collaborator.
#[derive(Debug)]
pub struct HandoffNotifier<E: RemoteExecutor, N: Notifier> {
    /// Remote executor collaborator.
    executor: E,
    /// Notification collaborator.
    notifier: N,
}

impl<E: RemoteExecutor, N: Notifier> HandoffNotifier<E, N> {
    /// Creates a new handoff notifier.
    #[must_use]
    pub const fn new(executor: E, notifier: N) -> Self {
        Self { executor, notifier }
    }

    /// Forwards the output set to the deployment collaborator.
    ///
    /// # Errors
    ///
    /// Returns `MissingOutput` when the public address is absent from
    /// the set, or a handoff error when the remote rollover fails.
    pub async fn handoff(
        &self,
        outputs: &OutputSet,
        target: &DeployTargetConfig,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<HandoffReport> {
        let host = outputs.get(OUTPUT_PUBLIC_IP).ok_or_else(|| {
            GangwayError::Output(OutputError::missing(
                OUTPUT_PUBLIC_IP,
                "handoff requires the public address output",
            ))
        })?;

        info!(
            "Handing off deployment of {} to {}@{host}",
            target.image, target.user
        );

        let script = build_deploy_script(target, credentials);
        let output = self.executor.execute(host, &target.user, &script).await?;

        if !output.success() {
            return Err(GangwayError::Handoff(HandoffError::RemoteFailed {
                host: host.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            }));
        }

        let report = HandoffReport {
            host: host.to_string(),
            image: target.image.clone(),
            container_name: target.container_name.clone(),
        };

        if let Err(e) = self
            .notifier
            .notify(
                "deployment handoff complete",
                &format!("{} running {} on {}", report.container_name, report.image, report.host),
            )
            .await
        {
            // The deployment itself succeeded; a lost notification is
            // not worth failing the whole sequence over
            warn!("Handoff notification failed: {e}");
        }

        Ok(report)
    }
}

/// Builds the delegated rollover script.
///
/// The sequence mirrors the usual container rollover: login when
/// credentials are supplied, pull the new image, stop and remove the
/// old container, start the new one.
#[must_use]
pub fn build_deploy_script(
    target: &DeployTargetConfig,
    credentials: Option<&RegistryCredentials>,
) -> String {
    let mut lines = vec![String::from("set -euo pipefail")];

    if let Some(creds) = credentials {
        lines.push(format!(
            "printf '%s' '{}' | docker login {} -u '{}' --password-stdin",
            creds.password, creds.server, creds.username
        ));
    }

    lines.push(format!("docker pull {}", target.image));
    lines.push(format!(
        "docker stop {0} >/dev/null 2>&1 || true",
        target.container_name
    ));
    lines.push(format!(
        "docker rm {0} >/dev/null 2>&1 || true",
        target.container_name
    ));

    let mut run = format!("docker run -d --restart unless-stopped --name {}", target.container_name);
    for publication in &target.ports {
        run.push_str(&format!(" -p {publication}"));
    }

    let mut env: Vec<_> = target.env.iter().collect();
    env.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in env {
        run.push_str(&format!(" -e {key}='{value}'"));
    }

    run.push(' ');
    run.push_str(&target.image);
    lines.push(run);

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn target() -> DeployTargetConfig {
        DeployTargetConfig {
            user: String::from("ubuntu"),
            image: String::from("ghcr.io/acme/demo-api:latest"),
            container_name: String::from("demo-api"),
            ports: vec![String::from("80:8080")],
            env: HashMap::from([(String::from("RUST_LOG"), String::from("info"))]),
            registry: None,
        }
    }

    fn outputs_with_ip() -> OutputSet {
        let mut outputs = OutputSet::new();
        outputs.insert(OUTPUT_PUBLIC_IP, "54.210.1.2");
        outputs
    }

    #[test]
    fn test_deploy_script_shape() {
        let script = build_deploy_script(&target(), None);

        assert!(script.starts_with("set -euo pipefail"));
        assert!(script.contains("docker pull ghcr.io/acme/demo-api:latest"));
        assert!(script.contains("docker stop demo-api"));
        assert!(script.contains("docker rm demo-api"));
        assert!(script.contains("-p 80:8080"));
        assert!(script.contains("-e RUST_LOG='info'"));
        // No login line without credentials
        assert!(!script.contains("docker login"));
    }

    #[test]
    fn test_deploy_script_with_credentials() {
        let creds = RegistryCredentials {
            server: String::from("ghcr.io"),
            username: String::from("bot"),
            password: String::from("token123"),
        };
        let script = build_deploy_script(&target(), Some(&creds));

        assert!(script.contains("docker login ghcr.io -u 'bot' --password-stdin"));
        let login_line = script
            .lines()
            .position(|l| l.contains("docker login"))
            .expect("login line present");
        let pull_line = script
            .lines()
            .position(|l| l.contains("docker pull"))
            .expect("pull line present");
        assert!(login_line < pull_line);
    }

    #[tokio::test]
    async fn test_handoff_executes_and_notifies() {
        let mut executor = MockRemoteExecutor::new();
        executor
            .expect_execute()
            .withf(|host, user, script| {
                host == "54.210.1.2" && user == "ubuntu" && script.contains("docker pull")
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(CommandOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            });

        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(1).returning(|_, _| Ok(()));

        let handoff = HandoffNotifier::new(executor, notifier);
        let report = handoff
            .handoff(&outputs_with_ip(), &target(), None)
            .await
            .expect("handoff should succeed");

        assert_eq!(report.host, "54.210.1.2");
        assert_eq!(report.container_name, "demo-api");
    }

    #[tokio::test]
    async fn test_handoff_fails_on_remote_failure() {
        let mut executor = MockRemoteExecutor::new();
        executor.expect_execute().times(1).returning(|_, _, _| {
            Ok(CommandOutput {
                exit_code: 125,
                stdout: String::new(),
                stderr: String::from("docker: image not found"),
            })
        });

        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(0);

        let handoff = HandoffNotifier::new(executor, notifier);
        let result = handoff.handoff(&outputs_with_ip(), &target(), None).await;

        assert!(matches!(
            result,
            Err(GangwayError::Handoff(HandoffError::RemoteFailed {
                exit_code: 125,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_handoff_requires_public_ip() {
        let executor = MockRemoteExecutor::new();
        let notifier = MockNotifier::new();

        let handoff = HandoffNotifier::new(executor, notifier);
        let result = handoff
            .handoff(&OutputSet::new(), &target(), None)
            .await;

        assert!(matches!(
            result,
            Err(GangwayError::Output(OutputError::MissingOutput { .. }))
        ));
    }
}
