//! NVMe QA orchestration engine.
//!
//! Resolves the controllers and namespaces under test, provisions them,
//! runs health monitoring and fio workloads side by side with platform
//! telemetry, then correlates and persists everything as one [`Report`].

pub mod config;
pub mod correlate;
pub mod engine;
pub mod error;
pub mod export;
pub mod extract;
pub mod health;
pub mod logging;
pub mod orchestrator;
pub mod path_utils;
pub mod provision;
pub mod report;
pub mod sampling;
pub mod shell;
pub mod telemetry;
pub mod tools;
pub mod topology;
pub mod workload;

#[cfg(test)]
mod testutil;

pub use config::{Config, ConfigError};
pub use engine::{Engine, EngineError};
pub use error::{Diagnostic, FaultKind, ToolError};
pub use orchestrator::{NoopObserver, RunObserver};
pub use report::{Report, ReportError};
pub use sampling::StopSignal;
