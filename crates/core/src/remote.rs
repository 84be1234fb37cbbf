//! Remote command execution over SSH.
//!
//! [`SshExecutor`] drives the system `ssh` binary. `connect` starts a
//! ControlMaster process whose socket every later `run`/`upload` multiplexes
//! over; the master is killed when the session is dropped, so a session never
//! outlives the scope that opened it.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::debug;

use crate::error::RemoteError;

/// Process-independent SSH settings handed to [`SshExecutor::new`].
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub ssh_binary: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            user: "root".to_string(),
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
            ssh_binary: "ssh".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait RemoteSession: Send {
    fn host(&self) -> &str;

    async fn run(&mut self, command: &str) -> Result<CommandOutput, RemoteError>;

    /// Writes `content` to `remote_path` and applies the octal `mode`.
    async fn upload(
        &mut self,
        content: &[u8],
        remote_path: &str,
        mode: u32,
    ) -> Result<(), RemoteError>;

    async fn close(&mut self);

    /// Like [`RemoteSession::run`] but a non-zero exit is an error.
    async fn run_checked(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        let output = self.run(command).await?;
        if output.code != 0 {
            return Err(RemoteError::NonZeroExit {
                host: self.host().to_string(),
                command: command.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

pub struct SshExecutor {
    config: SshConfig,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        SshExecutor { config }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
            "-l".to_string(),
            self.config.user.clone(),
        ];
        if let Some(identity) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn connect(&self, host: &str) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let control_path = std::env::temp_dir().join(format!("hcp-{}.sock", &id[..12]));

        let mut args = self.base_args();
        args.extend([
            "-M".to_string(),
            "-N".to_string(),
            "-S".to_string(),
            control_path.display().to_string(),
        ]);

        let master = Command::new(&self.config.ssh_binary)
            .args(&args)
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut session = SshSession {
            host: host.to_string(),
            ssh_binary: self.config.ssh_binary.clone(),
            base_args: self.base_args(),
            control_path,
            master: Some(master),
        };

        let deadline = Instant::now() + self.config.connect_timeout + Duration::from_secs(1);
        loop {
            if let Some(err) = session.master_exited().await? {
                return Err(err);
            }
            if session.control_check().await {
                debug!(host, "ssh session established");
                return Ok(Box::new(session));
            }
            if Instant::now() >= deadline {
                return Err(RemoteError::Unreachable {
                    host: host.to_string(),
                    reason: "timed out establishing ssh session".to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

pub struct SshSession {
    host: String,
    ssh_binary: String,
    base_args: Vec<String>,
    control_path: PathBuf,
    master: Option<Child>,
}

impl SshSession {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.ssh_binary);
        command
            .args(&self.base_args)
            .arg("-S")
            .arg(&self.control_path)
            .arg("-o")
            .arg("ControlMaster=no");
        command
    }

    /// `Some(error)` when the master process died before the socket came up.
    async fn master_exited(&mut self) -> Result<Option<RemoteError>, RemoteError> {
        let Some(master) = self.master.as_mut() else {
            return Ok(None);
        };
        let Some(_status) = master.try_wait()? else {
            return Ok(None);
        };

        let mut stderr = String::new();
        if let Some(mut pipe) = master.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        self.master = None;
        Ok(Some(classify_failure(&self.host, &stderr)))
    }

    async fn control_check(&self) -> bool {
        self.command()
            .arg("-O")
            .arg("check")
            .arg(&self.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        let output = self
            .command()
            .arg(&self.host)
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        // ssh reserves 255 for its own failures.
        match output.status.code() {
            Some(255) | None => Err(classify_failure(&self.host, &stderr)),
            Some(code) => Ok(CommandOutput {
                code,
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr,
            }),
        }
    }

    async fn upload(
        &mut self,
        content: &[u8],
        remote_path: &str,
        mode: u32,
    ) -> Result<(), RemoteError> {
        let path = shell_quote(remote_path);
        let remote_command = format!("cat > {path} && chmod {mode:o} {path}");

        let mut child = self
            .command()
            .arg(&self.host)
            .arg("--")
            .arg(&remote_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        match output.status.code() {
            Some(0) => Ok(()),
            Some(255) | None => Err(classify_failure(&self.host, &stderr)),
            Some(code) => Err(RemoteError::NonZeroExit {
                host: self.host.clone(),
                command: remote_command,
                code,
                stderr: stderr.trim().to_string(),
            }),
        }
    }

    async fn close(&mut self) {
        let _ = self
            .command()
            .arg("-O")
            .arg("exit")
            .arg(&self.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Some(mut master) = self.master.take() {
            let _ = master.kill().await;
        }
        let _ = std::fs::remove_file(&self.control_path);
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if let Some(master) = self.master.as_mut() {
            let _ = master.start_kill();
        }
        let _ = std::fs::remove_file(&self.control_path);
    }
}

fn classify_failure(host: &str, stderr: &str) -> RemoteError {
    let stderr = stderr.trim();
    if stderr.contains("Permission denied") || stderr.contains("Authentication failed") {
        return RemoteError::AuthRejected {
            host: host.to_string(),
        };
    }
    let reason = stderr
        .lines()
        .last()
        .filter(|line| !line.is_empty())
        .unwrap_or("ssh exited without a message");
    RemoteError::Unreachable {
        host: host.to_string(),
        reason: reason.to_string(),
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
