//! End-to-end run: resolve, provision, test, tear down, aggregate.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::config::{secs, Config, ConfigError};
use crate::error::Diagnostic;
use crate::orchestrator::{run_pool, RunObserver};
use crate::report::{Aggregator, Report, ReportError, RunMetadata};
use crate::sampling::StopSignal;
use crate::shell::{CommandRunner, SystemRunner};
use crate::telemetry::capture_controller_telemetry;
use crate::tools::Toolbox;
use crate::topology::resolve;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("nothing to test: no namespace was resolved ({} diagnostic(s))", .diagnostics.len())]
    NothingToTest { diagnostics: Vec<Diagnostic> },
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Report(#[from] ReportError),
}

pub struct Engine {
    config: Config,
    tools: Toolbox,
    stop: StopSignal,
}

impl Engine {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>) -> Result<Self, EngineError> {
        config.validate()?;
        let tools = Toolbox::new(runner, &config.tools);
        Ok(Engine {
            config,
            tools,
            stop: StopSignal::new(),
        })
    }

    /// Engine driving the real tools on this machine.
    pub fn on_host(config: Config) -> Result<Self, EngineError> {
        let runner = Arc::new(SystemRunner::new(config.tools.use_sudo));
        Engine::new(config, runner)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle that ends every sampling loop early when stopped. Partial
    /// series are kept and the report is still produced.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn run(&self, observer: &dyn RunObserver) -> Result<Report, EngineError> {
        let cfg = &self.config;
        let metadata = RunMetadata::collect(Utc::now(), cfg);
        if !metadata.privileged {
            log::warn!("not running as root; privileged tools go through sudo={}", cfg.tools.use_sudo);
        }

        let topology = resolve(&self.tools, cfg)?;
        for d in &topology.diagnostics {
            log::warn!("{d}");
        }
        if topology.is_empty() {
            log::error!("no testable namespace found");
            return Err(EngineError::NothingToTest {
                diagnostics: topology
                    .diagnostics
                    .into_iter()
                    .chain(topology.controllers.into_iter().flat_map(|c| c.diagnostics))
                    .collect(),
            });
        }
        log::info!(
            "resolved {} controller(s), {} namespace(s)",
            topology.controllers.len(),
            topology.namespace_count()
        );
        observer.resolved(&topology);

        let (outcomes, gates) = run_pool(&self.tools, cfg, &topology, &self.stop, observer);

        let mut aggregator = Aggregator::new(metadata, topology.diagnostics);
        for plan in topology.controllers {
            let ctrl = plan.controller.path.clone();
            let telemetry = (cfg.telemetry.nvme_telemetry && !self.stop.is_stopped())
                .then(|| capture_controller_telemetry(&self.tools, &ctrl, secs(cfg.tools.command_timeout)));
            let sanitize = gates.get(&ctrl).and_then(|g| g.sanitize_record().cloned());
            aggregator.add_controller(plan, sanitize, &outcomes, telemetry);
        }
        let report = aggregator.finish(Utc::now());
        if self.stop.is_stopped() {
            log::warn!("run was stopped early; the report holds partial results");
        }
        Ok(report)
    }

    /// Run and persist the report under the configured output directory.
    pub fn run_to_disk(&self, observer: &dyn RunObserver) -> Result<(Report, PathBuf), EngineError> {
        let report = self.run(observer)?;
        let path = report.persist(&self.config.output_dir)?;
        Ok((report, path))
    }
}
