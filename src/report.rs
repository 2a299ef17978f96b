//! Result aggregation and the persisted report.
//!
//! The report is the single record a renderer works from: everything a run
//! measured or failed at, keyed by controller then namespace, in resolution
//! order. Nothing here talks to hardware.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::config::Config;
use crate::correlate::correlate;
use crate::error::{Diagnostic, FaultKind};
use crate::health::HealthTimeline;
use crate::orchestrator::NamespaceOutcome;
use crate::provision::{ActionRecord, NamespaceState, ProvisionAction};
use crate::telemetry::ControllerTelemetry;
use crate::topology::{Controller, ControllerPlan, Namespace, NamespaceId};
use crate::workload::WorkloadRun;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("report io error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("report json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("report csv error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub tool_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub host: Option<String>,
    pub os: Option<String>,
    pub kernel: Option<String>,
    pub cpus: usize,
    pub privileged: bool,
    pub config: Config,
}

impl RunMetadata {
    /// Host facts as of `started_at`.
    pub fn collect(started_at: DateTime<Utc>, config: &Config) -> Self {
        RunMetadata {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            started_at,
            finished_at: None,
            host: System::host_name(),
            os: System::long_os_version(),
            kernel: System::kernel_version(),
            cpus: num_cpus::get(),
            privileged: crate::shell::is_root(),
            config: config.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceReport {
    pub namespace: Namespace,
    pub state: NamespaceState,
    pub mountpoint: Option<PathBuf>,
    pub provisioning: Vec<ActionRecord>,
    pub teardown: Vec<ActionRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub health: HealthTimeline,
    pub workloads: Vec<WorkloadRun>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl NamespaceReport {
    fn from_outcome(outcome: NamespaceOutcome) -> Self {
        let NamespaceOutcome {
            provisioning,
            mut result,
            started_at,
            finished_at,
        } = outcome;

        let temperature = result.health.temperature();
        for run in &mut result.workloads {
            run.correlated = correlate(&run.pattern, &temperature, &run.iops, &run.latency_us);
            if run.correlated.is_none() && run.succeeded() {
                log::debug!(
                    "{}:{}: too few points to correlate",
                    provisioning.namespace.path,
                    run.pattern
                );
            }
        }

        let (teardown, provisioning_log): (Vec<_>, Vec<_>) = provisioning
            .log
            .into_iter()
            .partition(|r| r.action == ProvisionAction::Unmount);
        NamespaceReport {
            namespace: provisioning.namespace,
            state: provisioning.state,
            mountpoint: provisioning.mountpoint,
            provisioning: provisioning_log,
            teardown,
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            health: result.health,
            workloads: result.workloads,
            diagnostics: result.diagnostics,
        }
    }

    /// A namespace the pool never recorded.
    fn missing(namespace: Namespace) -> Self {
        let diagnostic = Diagnostic::new(
            &namespace.path,
            FaultKind::Interrupted,
            "no result was recorded for this namespace",
        );
        NamespaceReport {
            namespace,
            state: NamespaceState::Untouched,
            mountpoint: None,
            provisioning: Vec::new(),
            teardown: Vec::new(),
            started_at: None,
            finished_at: None,
            health: HealthTimeline::default(),
            workloads: Vec::new(),
            diagnostics: vec![diagnostic],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub controller: Controller,
    /// The controller-wide sanitize, recorded once for every namespace.
    pub sanitize: Option<ActionRecord>,
    pub namespaces: Vec<NamespaceReport>,
    pub telemetry: Option<ControllerTelemetry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub metadata: RunMetadata,
    pub controllers: Vec<RunReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

/// Builds a [`Report`] controller by controller.
pub struct Aggregator {
    metadata: RunMetadata,
    controllers: Vec<RunReport>,
    diagnostics: Vec<Diagnostic>,
}

impl Aggregator {
    pub fn new(metadata: RunMetadata, diagnostics: Vec<Diagnostic>) -> Self {
        Aggregator {
            metadata,
            controllers: Vec::new(),
            diagnostics,
        }
    }

    /// Take the outcomes of `plan`'s namespaces out of `outcomes`, keeping
    /// the plan's namespace order.
    pub fn add_controller(
        &mut self,
        plan: ControllerPlan,
        sanitize: Option<ActionRecord>,
        outcomes: &DashMap<NamespaceId, NamespaceOutcome>,
        telemetry: Option<ControllerTelemetry>,
    ) {
        let namespaces = plan
            .namespaces
            .into_iter()
            .map(|ns| match outcomes.remove(&ns.id) {
                Some((_, outcome)) => NamespaceReport::from_outcome(outcome),
                None => NamespaceReport::missing(ns),
            })
            .collect();
        self.controllers.push(RunReport {
            controller: plan.controller,
            sanitize,
            namespaces,
            telemetry,
            diagnostics: plan.diagnostics,
        });
    }

    pub fn finish(mut self, finished_at: DateTime<Utc>) -> Report {
        self.metadata.finished_at = Some(finished_at);
        Report {
            metadata: self.metadata,
            controllers: self.controllers,
            diagnostics: self.diagnostics,
        }
    }
}

impl Report {
    pub fn controller(&self, path: &str) -> Option<&RunReport> {
        self.controllers.iter().find(|c| c.controller.path == path)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &NamespaceReport> {
        self.controllers.iter().flat_map(|c| &c.namespaces)
    }

    pub fn file_name(&self) -> String {
        self.metadata
            .started_at
            .with_timezone(&Local)
            .format("ssd_report_%Y-%m-%d_%H-%M-%S.json")
            .to_string()
    }

    /// Write the report as pretty JSON under `dir` and return its path.
    pub fn persist(&self, dir: &Path) -> Result<PathBuf, ReportError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ReportError::Io { path, source }
        };
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let path = dir.join(self.file_name());
        let file = File::create(&path).map_err(io_err(&path))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        log::info!("report written to {}", path.display());
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Report, ReportError> {
        let file = File::open(path).map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Plain-text digest of the record.
    pub fn summary(&self) -> String {
        let m = &self.metadata;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "nvme-qa {} on {} ({}, kernel {}, {} CPUs)",
            m.tool_version,
            m.host.as_deref().unwrap_or("unknown host"),
            m.os.as_deref().unwrap_or("unknown OS"),
            m.kernel.as_deref().unwrap_or("?"),
            m.cpus
        );
        let finished = m
            .finished_at
            .map(|f| f.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into());
        let _ = writeln!(
            out,
            "run: {} -> {}",
            m.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            finished
        );
        for d in &self.diagnostics {
            let _ = writeln!(out, "  ! {d}");
        }

        for c in &self.controllers {
            let ctrl = &c.controller;
            let _ = writeln!(
                out,
                "\n{}  {} (SN {}, FW {})",
                ctrl.path, ctrl.model, ctrl.serial, ctrl.firmware
            );
            if let (Some(speed), Some(width)) = (&ctrl.link.link_speed, &ctrl.link.link_width) {
                let _ = writeln!(out, "  link: {speed} x{width}");
            }
            if let Some(s) = &c.sanitize {
                let _ = writeln!(out, "  sanitize: {:?}", s.outcome);
            }
            if let Some(t) = &c.telemetry {
                let status = match &t.fault {
                    None => "captured".to_string(),
                    Some(d) => d.kind.to_string(),
                };
                let _ = writeln!(out, "  telemetry log: {status}");
            }
            for d in &c.diagnostics {
                let _ = writeln!(out, "  ! {d}");
            }
            for ns in &c.namespaces {
                summarize_namespace(&mut out, ns);
            }
        }
        out
    }
}

fn summarize_namespace(out: &mut String, ns: &NamespaceReport) {
    let temps = ns.health.temperature();
    let temp = match temps.max() {
        Some(max) => format!("max {max:.1} C over {} sample(s)", temps.values().len()),
        None => "no temperature readings".to_string(),
    };
    let _ = writeln!(out, "  {} [{:?}] {temp}", ns.namespace.path, ns.state);
    for r in ns.provisioning.iter().chain(&ns.teardown) {
        let _ = writeln!(out, "    {}: {:?}", r.action, r.outcome);
    }
    for w in &ns.workloads {
        match &w.error {
            None => {
                let _ = writeln!(
                    out,
                    "    {:<10} {:>10.0} IOPS  {:>8.1} us  ({} point(s){})",
                    w.pattern,
                    w.iops.mean().unwrap_or(0.0),
                    w.latency_us.mean().unwrap_or(0.0),
                    w.iops.values().len(),
                    if w.correlated.is_some() { ", correlated" } else { "" }
                );
            }
            Some(d) => {
                let _ = writeln!(out, "    {:<10} failed: [{}] {}", w.pattern, d.kind, d.message);
            }
        }
    }
    for d in ns.diagnostics.iter().chain(&ns.health.diagnostics) {
        let _ = writeln!(out, "    ! {d}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthSample;
    use crate::orchestrator::NamespaceResult;
    use crate::provision::Provisioning;
    use crate::topology::{Confidence, LinkAttributes};
    use chrono::TimeZone;

    fn at(s: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + s, 0).single().unwrap()
    }

    fn namespace(ctrl: &str, nsid: u32) -> Namespace {
        Namespace {
            id: NamespaceId {
                controller: ctrl.into(),
                nsid,
            },
            path: format!("{ctrl}n{nsid}"),
            confidence: Confidence::Discovered,
        }
    }

    fn controller(path: &str) -> Controller {
        Controller {
            path: path.into(),
            model: "QA Model".into(),
            serial: "SN0001".into(),
            firmware: "FW1.0".into(),
            link: LinkAttributes::default(),
        }
    }

    fn outcome(ns: &Namespace) -> NamespaceOutcome {
        let mut health = HealthTimeline::default();
        for (i, t) in [40.0, 42.0, 44.0].into_iter().enumerate() {
            health.samples.push(HealthSample {
                at: at(i as i64),
                temperature_c: Some(t),
                percentage_used: Some(2.0),
                media_errors: Some(0.0),
                critical_warning: Some(0.0),
                available_spare: Some(100.0),
                fault: None,
            });
        }
        let mut run = WorkloadRun::new("randread", PathBuf::from(&ns.path), false);
        for (i, v) in [100.0, 200.0].into_iter().enumerate() {
            run.iops.record(at(i as i64), v);
            run.latency_us.record(at(i as i64), 50.0);
        }
        NamespaceOutcome {
            provisioning: Provisioning::new(ns.clone()),
            result: NamespaceResult {
                health,
                workloads: vec![run],
                diagnostics: Vec::new(),
            },
            started_at: at(0),
            finished_at: at(10),
        }
    }

    fn sample_report() -> Report {
        let cfg = Config::default();
        let (a, b) = (namespace("/dev/nvme0", 2), namespace("/dev/nvme0", 1));
        let outcomes = DashMap::new();
        outcomes.insert(a.id.clone(), outcome(&a));
        outcomes.insert(b.id.clone(), outcome(&b));
        let mut agg = Aggregator::new(RunMetadata::collect(at(0), &cfg), Vec::new());
        agg.add_controller(
            ControllerPlan {
                controller: controller("/dev/nvme0"),
                namespaces: vec![a, b, namespace("/dev/nvme0", 3)],
                diagnostics: Vec::new(),
            },
            None,
            &outcomes,
            None,
        );
        agg.finish(at(20))
    }

    #[test]
    fn aggregation_keeps_order_and_correlates() {
        let report = sample_report();
        let paths: Vec<_> = report.namespaces().map(|n| n.namespace.path.as_str()).collect();
        assert_eq!(paths, vec!["/dev/nvme0n2", "/dev/nvme0n1", "/dev/nvme0n3"]);

        let first = &report.controllers[0].namespaces[0];
        let c = first.workloads[0].correlated.as_ref().unwrap();
        assert_eq!(c.points.len(), 3);
        assert_eq!(c.points[1].iops, 150.0);

        let missing = &report.controllers[0].namespaces[2];
        assert_eq!(missing.diagnostics[0].kind, FaultKind::Interrupted);
        assert_eq!(report.metadata.finished_at, Some(at(20)));
    }

    #[test]
    fn persisted_report_reloads_with_the_same_structure() {
        let dir = tempfile::tempdir().unwrap();
        let report = sample_report();
        let path = report.persist(&dir.path().join("out")).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("ssd_report_") && name.ends_with(".json"));

        let loaded = Report::load(&path).unwrap();
        assert_eq!(loaded.controllers.len(), 1);
        assert_eq!(loaded.controllers[0].controller, report.controllers[0].controller);
        for (a, b) in loaded.namespaces().zip(report.namespaces()) {
            assert_eq!(a.namespace, b.namespace);
            assert_eq!(a.workloads.len(), b.workloads.len());
            assert_eq!(a.health, b.health);
        }
        assert_eq!(
            loaded.controllers[0].namespaces[0].workloads[0],
            report.controllers[0].namespaces[0].workloads[0]
        );
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(Report::load(&path), Err(ReportError::Json(_))));
        assert!(matches!(
            Report::load(&dir.path().join("absent.json")),
            Err(ReportError::Io { .. })
        ));
    }

    #[test]
    fn summary_reads_from_the_record() {
        let text = sample_report().summary();
        assert!(text.contains("/dev/nvme0  QA Model (SN SN0001, FW FW1.0)"));
        assert!(text.contains("/dev/nvme0n1 [Untouched] max 44.0 C over 3 sample(s)"));
        assert!(text.contains("randread"));
        assert!(text.contains("correlated"));
        assert!(text.contains("[interrupted]"));
    }
}
