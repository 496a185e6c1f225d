//! Command configuration

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Identity and timeout policy of a single command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConfig {
    /// Executable path
    pub program: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Environment override (None = inherit the parent environment).
    /// When set, the child sees exactly these variables.
    pub env: Option<HashMap<String, String>>,
    /// Working directory (None = current dir)
    pub working_dir: Option<PathBuf>,
    /// Maximum runtime once waited on (zero = no timeout)
    pub timeout: Duration,
}

impl CommandConfig {
    /// Create new command configuration
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            env: None,
            working_dir: None,
            timeout: Duration::ZERO,
        }
    }

    /// Set command arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Append a single argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable to the override set
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Replace the environment override
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set timeout in seconds
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    /// Set timeout duration
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = duration;
        self
    }

    /// Whether a timeout is enforced
    pub fn has_timeout(&self) -> bool {
        !self.timeout.is_zero()
    }

    /// Render `program arg1 arg2` for diagnostics
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}
