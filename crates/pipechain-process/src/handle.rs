//! Process handle abstraction
//!
//! [`ManagedCommand`](crate::ManagedCommand) drives processes through the
//! [`ProcessHandle`] and [`Launcher`] traits so tests can substitute fake
//! processes. [`OsLauncher`] is the real implementation on top of
//! `tokio::process`.

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::config::CommandConfig;

/// Boxed output stream of a running process
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Capabilities of a spawned process
#[async_trait]
pub trait ProcessHandle: Send {
    /// OS process id, if still known
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit. Must be cancel safe.
    async fn wait(&mut self) -> io::Result<ExitStatus>;

    /// Deliver a forced kill without waiting for the exit
    fn start_kill(&mut self) -> io::Result<()>;

    /// Take the captured stdout stream
    fn take_stdout(&mut self) -> Option<BoxedReader>;

    /// Take the captured stderr stream
    fn take_stderr(&mut self) -> Option<BoxedReader>;
}

/// Where a process reads its stdin from
#[derive(Debug)]
pub enum StdinSource {
    /// The null device
    Null,
    /// The read end of an inter-stage pipe
    Fd(OwnedFd),
}

/// Where a process writes an output stream to
#[derive(Debug)]
pub enum OutputTarget {
    /// The null device
    Null,
    /// A pipe back to the parent, exposed through `take_stdout`/`take_stderr`
    Capture,
    /// A copy of an inter-stage pipe write end
    Fd(OwnedFd),
}

impl From<StdinSource> for Stdio {
    fn from(source: StdinSource) -> Self {
        match source {
            StdinSource::Null => Stdio::null(),
            StdinSource::Fd(fd) => Stdio::from(fd),
        }
    }
}

impl From<OutputTarget> for Stdio {
    fn from(target: OutputTarget) -> Self {
        match target {
            OutputTarget::Null => Stdio::null(),
            OutputTarget::Capture => Stdio::piped(),
            OutputTarget::Fd(fd) => Stdio::from(fd),
        }
    }
}

/// Everything needed to spawn one process
#[derive(Debug)]
pub struct LaunchRequest<'a> {
    pub config: &'a CommandConfig,
    pub stdin: StdinSource,
    pub stdout: OutputTarget,
    pub stderr: OutputTarget,
}

/// Spawns processes
pub trait Launcher: Send + Sync + fmt::Debug {
    /// Spawn a process. Must be called from within a tokio runtime.
    fn launch(&self, request: LaunchRequest<'_>) -> io::Result<Box<dyn ProcessHandle>>;
}

/// Spawns real OS processes with `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl Launcher for OsLauncher {
    fn launch(&self, request: LaunchRequest<'_>) -> io::Result<Box<dyn ProcessHandle>> {
        let config = request.config;
        debug!(
            program = %config.program,
            args = ?config.args,
            "Spawning process"
        );

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args);

        if let Some(ref env) = config.env {
            cmd.env_clear();
            cmd.envs(env);
        }

        if let Some(ref dir) = config.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::from(request.stdin));
        cmd.stdout(Stdio::from(request.stdout));
        cmd.stderr(Stdio::from(request.stderr));

        let child = cmd.spawn()?;
        info!(pid = ?child.id(), command = %config.command_line(), "Process spawned");

        Ok(Box::new(OsProcess { child }))
    }
}

/// A `tokio::process::Child` behind the [`ProcessHandle`] trait
struct OsProcess {
    child: Child,
}

#[async_trait]
impl ProcessHandle for OsProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as BoxedReader)
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as BoxedReader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_launch_captures_stdout() {
        let config = CommandConfig::new("echo").args(["hello"]);
        let mut process = OsLauncher
            .launch(LaunchRequest {
                config: &config,
                stdin: StdinSource::Null,
                stdout: OutputTarget::Capture,
                stderr: OutputTarget::Null,
            })
            .unwrap();

        assert!(process.id().is_some());
        let mut stdout = process.take_stdout().unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();

        assert_eq!(out, "hello\n");
        assert!(process.wait().await.unwrap().success());
        assert!(process.take_stderr().is_none());
    }

    #[tokio::test]
    async fn test_env_override_replaces_environment() {
        let config = CommandConfig::new("/usr/bin/env").env("PIPECHAIN_ONLY", "1");
        let mut process = OsLauncher
            .launch(LaunchRequest {
                config: &config,
                stdin: StdinSource::Null,
                stdout: OutputTarget::Capture,
                stderr: OutputTarget::Null,
            })
            .unwrap();

        let mut out = String::new();
        process
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        process.wait().await.unwrap();

        assert_eq!(out, "PIPECHAIN_ONLY=1\n");
    }

    #[tokio::test]
    async fn test_launch_missing_program_fails() {
        let config = CommandConfig::new("/nonexistent/pipechain-missing");
        let result = OsLauncher.launch(LaunchRequest {
            config: &config,
            stdin: StdinSource::Null,
            stdout: OutputTarget::Null,
            stderr: OutputTarget::Null,
        });

        assert!(result.is_err());
    }
}
