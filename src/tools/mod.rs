//! Adapters for the external measurement and provisioning tools.
//!
//! Each submodule builds the command line for one tool family and turns its
//! output into typed readings. Parsing is kept in pure functions next to the
//! call so it can be tested without the tool installed.

pub mod fio;
pub mod fs;
pub mod nvme;
pub mod platform;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{secs, ToolsConfig};
use crate::error::ToolError;
use crate::shell::{self, CommandRunner, CommandSpec};

/// Shared handle on the command runner plus the timeout policy.
#[derive(Clone)]
pub struct Toolbox {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    grace: Duration,
}

impl Toolbox {
    pub fn new(runner: Arc<dyn CommandRunner>, cfg: &ToolsConfig) -> Self {
        Toolbox {
            runner,
            timeout: secs(cfg.command_timeout),
            grace: secs(cfg.workload_grace),
        }
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// A command carrying the default timeout.
    pub fn command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program, self.timeout)
    }

    pub fn run(&self, spec: &CommandSpec) -> Result<String, ToolError> {
        shell::run(self.runner.as_ref(), spec)
    }

    /// Timeout for a call expected to take `runtime`.
    pub fn long_timeout(&self, runtime: Duration) -> Duration {
        runtime + self.grace
    }
}

impl std::fmt::Debug for Toolbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolbox")
            .field("timeout", &self.timeout)
            .field("grace", &self.grace)
            .finish()
    }
}
