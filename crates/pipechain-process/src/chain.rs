//! Command chain - stages connected stdout to stdin

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    command::ManagedCommand,
    config::CommandConfig,
    error::{ProcessError, Result},
    handle::{Launcher, OsLauncher},
    pipe::stage_pipe,
    reader::OutputReceiver,
    stop::{stop_channel, StopHandle, StopSignal},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Building,
    Started,
    Waited,
}

/// An ordered set of commands, each stage's stdout piped into the next
/// stage's stdin.
///
/// Only the last stage's output is exposed, through
/// [`stdout_chan`](Self::stdout_chan) and [`stderr_chan`](Self::stderr_chan).
/// A chain runs once; [`clone_fresh`](Self::clone_fresh) builds an unstarted
/// copy for a rerun.
pub struct CommandChain {
    /// Maximum time each stage may run once waited on (zero = no timeout)
    timeout: Duration,
    launcher: Arc<dyn Launcher>,
    state: State,
    commands: Vec<ManagedCommand>,
    /// Stage configurations, kept once the commands move into the wait task
    steps: Vec<CommandConfig>,
    stdout_rx: Option<OutputReceiver>,
    stderr_rx: Option<OutputReceiver>,
    stop_handle: StopHandle,
    /// Moved into the stage task by `wait`
    stop_signal: Option<StopSignal>,
    teardown: Option<JoinHandle<Result<()>>>,
}

impl CommandChain {
    /// Create an empty chain that spawns real OS processes
    pub fn new(timeout: Duration) -> Self {
        Self::with_launcher(timeout, Arc::new(OsLauncher))
    }

    /// Create an empty chain with a custom launcher
    pub fn with_launcher(timeout: Duration, launcher: Arc<dyn Launcher>) -> Self {
        let (stop_handle, stop_signal) = stop_channel();
        Self {
            timeout,
            launcher,
            state: State::Building,
            commands: Vec::new(),
            steps: Vec::new(),
            stdout_rx: None,
            stderr_rx: None,
            stop_handle,
            stop_signal: Some(stop_signal),
            teardown: None,
        }
    }

    /// Per-stage timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        if self.commands.is_empty() {
            self.steps.len()
        } else {
            self.commands.len()
        }
    }

    /// Whether no steps were added
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configurations of every stage, in pipeline order
    pub fn steps(&self) -> Vec<CommandConfig> {
        if self.commands.is_empty() {
            self.steps.clone()
        } else {
            self.commands.iter().map(|c| c.config().clone()).collect()
        }
    }

    /// Render `a x | b y` for diagnostics
    pub fn command_line(&self) -> String {
        self.steps()
            .iter()
            .map(CommandConfig::command_line)
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Handle that stops the whole chain
    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    /// Append a stage running `program` with `args`.
    ///
    /// From the second step on, a pipe connects the previous stage's stdout
    /// to this stage's stdin. The returned command can be configured further
    /// (environment, working directory) before `start`.
    pub fn add_step<I, S>(&mut self, program: impl Into<String>, args: I) -> Result<&mut ManagedCommand>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let config = CommandConfig::new(program).args(args).timeout(self.timeout);
        self.push(config)
    }

    fn push(&mut self, config: CommandConfig) -> Result<&mut ManagedCommand> {
        if self.state != State::Building {
            return Err(ProcessError::AlreadyStarted {
                command: self.command_line(),
            });
        }

        let mut command = ManagedCommand::with_launcher(config, Arc::clone(&self.launcher));
        if let Some(previous) = self.commands.last_mut() {
            let (read, write) = stage_pipe()?;
            previous.set_stdout_pipe(write);
            command.set_stdin_pipe(read);
        }

        self.commands.push(command);
        let index = self.commands.len() - 1;
        Ok(&mut self.commands[index])
    }

    /// Take the last stage's stdout channel
    pub fn stdout_chan(&mut self) -> Result<OutputReceiver> {
        if self.stdout_rx.is_none() {
            if let Some(last) = self.commands.last_mut() {
                return last.stdout_chan();
            }
        }
        self.detached_output(|chain| chain.stdout_rx.take())
    }

    /// Take the last stage's stderr channel
    pub fn stderr_chan(&mut self) -> Result<OutputReceiver> {
        if self.stderr_rx.is_none() {
            if let Some(last) = self.commands.last_mut() {
                return last.stderr_chan();
            }
        }
        self.detached_output(|chain| chain.stderr_rx.take())
    }

    fn detached_output(
        &mut self,
        take: impl FnOnce(&mut Self) -> Option<OutputReceiver>,
    ) -> Result<OutputReceiver> {
        if self.is_empty() {
            return Err(ProcessError::EmptyChain);
        }
        take(self).ok_or_else(|| ProcessError::StreamTaken {
            command: self.command_line(),
        })
    }

    /// Start every stage in order.
    ///
    /// All stages but the last feed the next stage's pipe; the last one
    /// streams into the output channels. Stops at the first spawn failure
    /// without starting the remaining stages.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != State::Building {
            return Err(ProcessError::AlreadyStarted {
                command: self.command_line(),
            });
        }
        self.state = State::Started;

        info!(chain = %self.command_line(), stages = self.commands.len(), "Starting chain");

        let last = self.commands.len().saturating_sub(1);
        for (index, command) in self.commands.iter_mut().enumerate() {
            if let Err(e) = command.start(index == last).await {
                warn!(stage = index, error = %e, "Chain stage failed to start");
                return Err(ProcessError::StageStart {
                    command: command.config().command_line(),
                    source: Box::new(e),
                });
            }
        }
        Ok(())
    }

    /// Wait for every stage in order, racing the chain stop signal.
    ///
    /// The first stage error ends the wait and is returned; later stages are
    /// not waited on. A stop sends a stop request to every stage, last stage
    /// first, and returns [`ProcessError::ChainStopped`] without waiting for
    /// the stages to exit; use [`wait_for_teardown`](Self::wait_for_teardown)
    /// for that.
    ///
    /// The stages run in a background task. If this future is dropped before
    /// it resolves, the chain can still be stopped through
    /// [`stop_handle`](Self::stop_handle) and joined with
    /// [`wait_for_teardown`](Self::wait_for_teardown).
    pub async fn wait(&mut self) -> Result<()> {
        match self.state {
            State::Building => {
                return Err(ProcessError::NotStarted {
                    command: self.command_line(),
                })
            }
            State::Waited => {
                return Err(ProcessError::AlreadyStarted {
                    command: self.command_line(),
                })
            }
            State::Started => {}
        }
        let signal = match self.stop_signal.take() {
            Some(signal) => signal,
            None => {
                return Err(ProcessError::AlreadyStarted {
                    command: self.command_line(),
                })
            }
        };
        self.state = State::Waited;

        self.steps = self.commands.iter().map(|c| c.config().clone()).collect();
        if let Some(last) = self.commands.last_mut() {
            let (stdout, stderr) = last.take_outputs();
            self.stdout_rx = stdout;
            self.stderr_rx = stderr;
        }

        debug!(chain = %self.command_line(), "Waiting for chain");

        let commands = std::mem::take(&mut self.commands);
        let (stopped_tx, mut stopped_rx) = oneshot::channel();
        let task = self
            .teardown
            .insert(tokio::spawn(supervise(commands, signal, stopped_tx)));

        tokio::select! {
            biased;

            Ok(()) = &mut stopped_rx => {
                warn!(chain = %self.command_line(), "Chain stopped");
                Err(ProcessError::ChainStopped)
            }
            joined = task => {
                self.teardown = None;
                flatten(joined)
            }
        }
    }

    /// Start and wait
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.wait().await
    }

    /// Wait until the background stage loop has finished and return its
    /// outcome. Use after a stopped `wait`, or after a `wait` that was
    /// dropped before it resolved.
    ///
    /// Returns `Ok(())` immediately if there is nothing left to wait for.
    pub async fn wait_for_teardown(&mut self) -> Result<()> {
        match self.teardown.take() {
            Some(task) => flatten(task.await),
            None => Ok(()),
        }
    }

    /// Build a fresh, unstarted chain with the same timeout and steps
    pub fn clone_fresh(&self) -> Result<Self> {
        let mut chain = Self::with_launcher(self.timeout, Arc::clone(&self.launcher));
        for step in self.steps() {
            chain.push(step)?;
        }
        Ok(chain)
    }
}

impl fmt::Debug for CommandChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandChain")
            .field("timeout", &self.timeout)
            .field("state", &self.state)
            .field("steps", &self.steps())
            .finish_non_exhaustive()
    }
}

/// Run the ordered stage loop, relaying a chain stop to every stage.
///
/// `stopped` fires once the stop requests are out; the loop is then left to
/// unwind as the stages die.
async fn supervise(
    commands: Vec<ManagedCommand>,
    mut signal: StopSignal,
    stopped: oneshot::Sender<()>,
) -> Result<()> {
    let stops: Vec<StopHandle> = commands.iter().map(ManagedCommand::stop_handle).collect();
    let stages = wait_in_order(commands);
    tokio::pin!(stages);

    tokio::select! {
        biased;

        _ = signal.requested() => {
            stop_stages(&stops, |index| debug!(stage = index, "Stop sent to stage"));
            let _ = stopped.send(());
            stages.await
        }
        outcome = &mut stages => outcome,
    }
}

/// Send a stop to every stage, last stage first. `sent` sees each stage
/// index right after its request goes out.
fn stop_stages(stops: &[StopHandle], mut sent: impl FnMut(usize)) {
    for (index, stop) in stops.iter().enumerate().rev() {
        stop.stop();
        sent(index);
    }
}

/// Wait each stage in pipeline order, closing a finished stage's pipe so the
/// next stage sees end-of-input. The last stage's output is left alone.
async fn wait_in_order(mut commands: Vec<ManagedCommand>) -> Result<()> {
    let last = commands.len().saturating_sub(1);

    for index in 0..commands.len() {
        let outcome = match commands[index].wait().await {
            Ok(()) if index < last => commands[index].close_stdout_pipe(),
            other => other,
        };

        if let Err(e) = outcome {
            debug!(stage = index, error = %e, "Chain stage failed");
            for remaining in &mut commands[index + 1..] {
                remaining.abandon().await;
            }
            return Err(e);
        }
    }
    Ok(())
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| ProcessError::Join(e.to_string()))?
}
