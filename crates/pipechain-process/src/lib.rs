//! # pipechain-process
//!
//! **Purpose**: Subprocess chains for the pipechain log and metrics pipeline
//!
//! Composes external commands into a shell-style pipeline, each stage's
//! stdout feeding the next stage's stdin, and exposes the last stage's output
//! as streams of byte chunks.
//!
//! ## Features
//!
//! - **Managed Commands**: One process with a timeout-aware, stoppable wait
//! - **Command Chains**: Ordered stages connected by OS pipes
//! - **Timeouts**: Per-stage limits, measured from the call to `wait`
//! - **Cancellation**: Single-slot stop signals for commands and chains
//! - **Output Streaming**: Chunked stdout/stderr channels and an `AsyncRead`
//!   adapter over them
//! - **Restart**: Fresh clones of commands and chains, since processes are
//!   single-use
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use pipechain_process::{drain, CommandChain};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut chain = CommandChain::new(Duration::from_secs(30));
//! chain.add_step("printf", ["hello\\n"])?;
//! chain.add_step("tr", ["a-z", "A-Z"])?;
//!
//! let stdout = chain.stdout_chan()?;
//! chain.start().await?;
//! chain.wait().await?;
//!
//! assert_eq!(drain(stdout).await, b"HELLO\n");
//! # Ok(())
//! # }
//! ```
//!
//! Unix only: stages are connected with OS pipes.

#![cfg(unix)]

pub mod chain;
pub mod command;
pub mod config;
pub mod error;
pub mod handle;
pub mod pipe;
pub mod reader;
pub mod stop;

pub use chain::CommandChain;
pub use command::ManagedCommand;
pub use config::CommandConfig;
pub use error::{ProcessError, Result};
pub use handle::{Launcher, OsLauncher, ProcessHandle};
pub use reader::{drain, ChunkReader, OutputReceiver};
pub use stop::{StopHandle, StopSignal};
