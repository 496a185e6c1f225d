//! Managed command - one process with timeout and stop handling

use std::fmt;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    config::CommandConfig,
    error::{ProcessError, Result},
    handle::{BoxedReader, LaunchRequest, Launcher, OsLauncher, OutputTarget, ProcessHandle, StdinSource},
    pipe::{PipeReadEnd, PipeWriteEnd},
    reader::OutputReceiver,
    stop::{stop_channel, StopHandle, StopSignal},
};

/// Read size for stdout chunks
pub const STDOUT_CHUNK_SIZE: usize = 512;
/// Read size for stderr chunks
pub const STDERR_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Finished,
}

/// An external process with a timeout-aware, stoppable wait.
///
/// A command runs at most once. Use [`Clone`] to get a fresh, unstarted copy.
pub struct ManagedCommand {
    config: CommandConfig,
    launcher: Arc<dyn Launcher>,
    state: State,
    process: Option<Box<dyn ProcessHandle>>,
    pid: Option<u32>,
    stdin_pipe: Option<PipeReadEnd>,
    stdout_pipe: Option<PipeWriteEnd>,
    stop_handle: StopHandle,
    stop_signal: StopSignal,
    stdout_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stderr_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stdout_rx: Option<OutputReceiver>,
    stderr_rx: Option<OutputReceiver>,
}

impl ManagedCommand {
    /// Create a command that spawns real OS processes
    pub fn new(config: CommandConfig) -> Self {
        Self::with_launcher(config, Arc::new(OsLauncher))
    }

    /// Create a command with a custom launcher
    pub fn with_launcher(config: CommandConfig, launcher: Arc<dyn Launcher>) -> Self {
        let (stop_handle, stop_signal) = stop_channel();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();

        Self {
            config,
            launcher,
            state: State::Idle,
            process: None,
            pid: None,
            stdin_pipe: None,
            stdout_pipe: None,
            stop_handle,
            stop_signal,
            stdout_tx: Some(stdout_tx),
            stderr_tx: Some(stderr_tx),
            stdout_rx: Some(stdout_rx),
            stderr_rx: Some(stderr_rx),
        }
    }

    /// Get command configuration
    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    /// Mutable configuration. Changes only take effect before `start`.
    pub fn config_mut(&mut self) -> &mut CommandConfig {
        &mut self.config
    }

    /// Get process ID while running
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether `start` has been called
    pub fn is_started(&self) -> bool {
        self.state != State::Idle
    }

    /// Handle that stops this command's `wait`
    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    /// Take the stdout channel.
    ///
    /// The channel buffers every chunk until it is read, so it may be drained
    /// after `wait` returns. Closes with no data if the command is started
    /// without streaming.
    pub fn stdout_chan(&mut self) -> Result<OutputReceiver> {
        self.stdout_rx.take().ok_or_else(|| ProcessError::StreamTaken {
            command: self.config.command_line(),
        })
    }

    /// Take the stderr channel
    pub fn stderr_chan(&mut self) -> Result<OutputReceiver> {
        self.stderr_rx.take().ok_or_else(|| ProcessError::StreamTaken {
            command: self.config.command_line(),
        })
    }

    pub(crate) fn take_outputs(&mut self) -> (Option<OutputReceiver>, Option<OutputReceiver>) {
        (self.stdout_rx.take(), self.stderr_rx.take())
    }

    pub(crate) fn set_stdin_pipe(&mut self, pipe: PipeReadEnd) {
        self.stdin_pipe = Some(pipe);
    }

    pub(crate) fn set_stdout_pipe(&mut self, pipe: PipeWriteEnd) {
        self.stdout_pipe = Some(pipe);
    }

    /// Spawn the process.
    ///
    /// With `stream_output`, stdout and stderr are pumped into the output
    /// channels in fixed-size chunks. A stdout bound to a downstream pipe
    /// takes precedence over streaming. A spawn failure is fatal for this
    /// instance.
    pub async fn start(&mut self, stream_output: bool) -> Result<()> {
        let command = self.config.command_line();
        if self.state != State::Idle {
            return Err(ProcessError::AlreadyStarted { command });
        }
        self.state = State::Running;

        // Senders that are not handed to a pump are dropped here, closing
        // their channels with no data.
        let stdout_tx = self.stdout_tx.take();
        let stderr_tx = self.stderr_tx.take();

        let stdin = match self.stdin_pipe.take() {
            Some(pipe) => StdinSource::Fd(pipe.into_fd()),
            None => StdinSource::Null,
        };
        let stdout = match self.stdout_pipe.as_ref().map(PipeWriteEnd::duplicate) {
            Some(Ok(fd)) => OutputTarget::Fd(fd),
            Some(Err(source)) => {
                self.state = State::Finished;
                return Err(ProcessError::Spawn { command, source });
            }
            None if stream_output => OutputTarget::Capture,
            None => OutputTarget::Null,
        };
        let stderr = if stream_output {
            OutputTarget::Capture
        } else {
            OutputTarget::Null
        };

        let launched = self.launcher.launch(LaunchRequest {
            config: &self.config,
            stdin,
            stdout,
            stderr,
        });
        let mut process = match launched {
            Ok(process) => process,
            Err(source) => {
                warn!(command = %command, error = %source, "Failed to spawn process");
                self.state = State::Finished;
                self.close_stdout_pipe_quietly();
                return Err(ProcessError::Spawn { command, source });
            }
        };

        if stream_output {
            if let (Some(source), Some(sink)) = (process.take_stdout(), stdout_tx) {
                tokio::spawn(pump(source, sink, STDOUT_CHUNK_SIZE));
            }
            if let (Some(source), Some(sink)) = (process.take_stderr(), stderr_tx) {
                tokio::spawn(pump(source, sink, STDERR_CHUNK_SIZE));
            }
        }

        self.pid = process.id();
        self.process = Some(process);
        Ok(())
    }

    /// Wait for the process, racing a stop request and the timeout.
    ///
    /// Streamed output never blocks the process, so the output channels can
    /// be read before, during or after this call.
    ///
    /// The timeout clock starts here, not at `start`. A stop or timeout kills
    /// the process. On failure paths the downstream pipe write end is closed
    /// so the next stage sees end-of-input; on success closing it is left to
    /// [`close_stdout_pipe`](Self::close_stdout_pipe).
    pub async fn wait(&mut self) -> Result<()> {
        let command = self.config.command_line();
        let mut process = match self.process.take() {
            Some(process) => process,
            None => return Err(ProcessError::NotStarted { command }),
        };
        let timeout = self.config.timeout;

        debug!(pid = ?self.pid, command = %command, ?timeout, "Waiting for process");

        let outcome = tokio::select! {
            biased;

            _ = self.stop_signal.requested() => {
                warn!(pid = ?self.pid, command = %command, "Stop requested, killing process");
                let killed = kill(&mut *process, &command).await;
                Err(ProcessError::Cancelled { command, kill: Box::new(killed) })
            }
            _ = tokio::time::sleep(timeout), if !timeout.is_zero() => {
                warn!(pid = ?self.pid, command = %command, ?timeout, "Process timed out, killing");
                let killed = kill(&mut *process, &command).await;
                Err(ProcessError::Timeout { command, after: timeout, kill: Box::new(killed) })
            }
            status = process.wait() => match status {
                Ok(status) if status.success() => {
                    debug!(pid = ?self.pid, command = %command, "Process exited");
                    Ok(())
                }
                Ok(status) => {
                    debug!(pid = ?self.pid, command = %command, %status, "Process failed");
                    Err(ProcessError::Stage { command, status })
                }
                Err(source) => Err(ProcessError::Wait { command, source }),
            },
        };

        self.state = State::Finished;
        self.pid = None;
        if outcome.is_err() {
            self.close_stdout_pipe_quietly();
        }
        outcome
    }

    /// Start and wait
    pub async fn run(&mut self, stream_output: bool) -> Result<()> {
        self.start(stream_output).await?;
        self.wait().await
    }

    /// Close the parent's copy of the downstream pipe write end.
    ///
    /// No-op when there is no downstream pipe or it is already closed.
    pub fn close_stdout_pipe(&mut self) -> Result<()> {
        match self.stdout_pipe.as_mut() {
            Some(pipe) => pipe.close().map_err(|source| ProcessError::PipeClose {
                command: self.config.command_line(),
                source,
            }),
            None => Ok(()),
        }
    }

    fn close_stdout_pipe_quietly(&mut self) {
        if let Err(e) = self.close_stdout_pipe() {
            debug!(error = %e, "Ignoring pipe close failure");
        }
    }

    /// Kill a still running process if a stop was requested for it.
    ///
    /// Used for stages that will never be waited on. Without a pending stop
    /// the process is left to finish on its own.
    pub(crate) async fn abandon(&mut self) {
        self.close_stdout_pipe_quietly();
        if !self.stop_signal.try_requested() {
            return;
        }
        if let Some(mut process) = self.process.take() {
            let command = self.config.command_line();
            let outcome = kill(&mut *process, &command).await;
            debug!(command = %command, outcome = %outcome, "Abandoned stage stopped");
            self.state = State::Finished;
            self.pid = None;
        }
    }
}

impl Clone for ManagedCommand {
    /// A fresh, unstarted command with the same configuration and launcher
    fn clone(&self) -> Self {
        Self::with_launcher(self.config.clone(), Arc::clone(&self.launcher))
    }
}

impl fmt::Debug for ManagedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedCommand")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Force-kill a process and reap it. Always yields an error: a killed process
/// did not finish on its own.
async fn kill(process: &mut dyn ProcessHandle, command: &str) -> ProcessError {
    if let Err(source) = process.start_kill() {
        warn!(command = %command, error = %source, "Failed to kill process");
        return ProcessError::KillFailed {
            command: command.to_string(),
            source,
        };
    }

    // Reap so the exit is observed exactly once.
    if let Err(e) = process.wait().await {
        warn!(command = %command, error = %e, "Error waiting for killed process");
    }

    ProcessError::Killed {
        command: command.to_string(),
    }
}

/// Forward fixed-size reads into `sink` until end-of-input or a read error.
/// If the consumer goes away the stream is still drained so the writer
/// never blocks on a full pipe.
async fn pump(mut source: BoxedReader, sink: mpsc::UnboundedSender<Vec<u8>>, chunk_size: usize) {
    let mut buffer = vec![0u8; chunk_size];
    let mut forwarding = true;

    loop {
        match source.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if forwarding && sink.send(buffer[..n].to_vec()).is_err() {
                    forwarding = false;
                }
            }
            Err(e) => {
                debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::drain;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_streams_stdout_and_stderr() {
        let config = CommandConfig::new("sh").args(["-c", "echo out; echo err >&2"]);
        let mut command = ManagedCommand::new(config);
        let stdout = command.stdout_chan().unwrap();
        let stderr = command.stderr_chan().unwrap();

        command.start(true).await.unwrap();
        assert!(command.pid().is_some());
        command.wait().await.unwrap();

        assert_eq!(drain(stdout).await, b"out\n");
        assert_eq!(drain(stderr).await, b"err\n");
    }

    #[tokio::test]
    async fn test_large_output_can_be_read_after_wait() {
        let config = CommandConfig::new("seq")
            .args(["1", "100000"])
            .timeout_secs(30);
        let mut command = ManagedCommand::new(config);
        let stdout = command.stdout_chan().unwrap();

        command.run(true).await.unwrap();

        let expected: String = (1..=100_000).map(|n| format!("{n}\n")).collect();
        assert_eq!(drain(stdout).await, expected.into_bytes());
    }

    #[tokio::test]
    async fn test_failing_process_reports_stage_error() {
        let mut command = ManagedCommand::new(CommandConfig::new("false"));
        let stdout = command.stdout_chan().unwrap();

        let err = command.run(true).await.unwrap_err();
        assert!(err.is_stage_failure());
        assert!(drain(stdout).await.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let config = CommandConfig::new("sleep")
            .args(["10"])
            .timeout(Duration::from_millis(100));
        let mut command = ManagedCommand::new(config);

        let started = Instant::now();
        let err = command.run(false).await.unwrap_err();

        assert!(err.is_timeout());
        assert!(matches!(
            err,
            ProcessError::Timeout { ref kill, .. } if matches!(**kill, ProcessError::Killed { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_zero_timeout_never_expires() {
        let config = CommandConfig::new("sleep").args(["0.3"]);
        let mut command = ManagedCommand::new(config);

        command.run(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_wait_cancels() {
        let config = CommandConfig::new("sleep").args(["10"]);
        let mut command = ManagedCommand::new(config);
        command.start(false).await.unwrap();

        assert!(command.stop_handle().stop());
        let err = command.wait().await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(err.to_string().contains("was stopped"));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut command = ManagedCommand::new(CommandConfig::new("true"));
        command.start(false).await.unwrap();

        let err = command.start(false).await.unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyStarted { .. }));
        command.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_without_start() {
        let mut command = ManagedCommand::new(CommandConfig::new("true"));
        let err = command.wait().await.unwrap_err();
        assert!(matches!(err, ProcessError::NotStarted { .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure_closes_channels() {
        let mut command = ManagedCommand::new(CommandConfig::new("/nonexistent/pipechain-missing"));
        let stdout = command.stdout_chan().unwrap();

        let err = command.start(true).await.unwrap_err();
        assert!(err.is_spawn_failure());
        assert!(drain(stdout).await.is_empty());
        assert!(command.start(true).await.is_err());
    }

    #[tokio::test]
    async fn test_clone_is_fresh() {
        let config = CommandConfig::new("echo")
            .args(["again"])
            .timeout_secs(5);
        let mut original = ManagedCommand::new(config.clone());
        original.run(false).await.unwrap();

        let mut clone = original.clone();
        assert!(!clone.is_started());
        assert_eq!(clone.config(), &config);

        let stdout = clone.stdout_chan().unwrap();
        clone.run(true).await.unwrap();
        assert_eq!(drain(stdout).await, b"again\n");
    }

    #[tokio::test]
    async fn test_stream_taken_once() {
        let mut command = ManagedCommand::new(CommandConfig::new("true"));
        let _stdout = command.stdout_chan().unwrap();
        assert!(matches!(
            command.stdout_chan(),
            Err(ProcessError::StreamTaken { .. })
        ));
    }
}
