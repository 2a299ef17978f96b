//! One workload run: a single fio execution with its three telemetry
//! samplers running alongside.

use std::path::{Path, PathBuf};
use std::thread;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{secs, Config, WorkloadSpec};
use crate::correlate::CorrelatedTimeline;
use crate::error::{panic_message, Diagnostic, FaultKind, ToolError};
use crate::path_utils::{basename, is_inside, workload_file};
use crate::sampling::{Pacing, SampleSeries, StopSignal};
use crate::telemetry::{self, WorkloadTelemetry};
use crate::tools::fio::{self, FioRequest};
use crate::tools::Toolbox;
use crate::topology::Namespace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadRun {
    pub pattern: String,
    pub target: PathBuf,
    pub on_filesystem: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Tool output as produced, kept even when it could not be parsed.
    pub raw_output: Option<String>,
    pub iops: SampleSeries,
    pub latency_us: SampleSeries,
    pub telemetry: WorkloadTelemetry,
    pub correlated: Option<CorrelatedTimeline>,
    pub error: Option<Diagnostic>,
}

impl WorkloadRun {
    pub fn new(pattern: &str, target: PathBuf, on_filesystem: bool) -> Self {
        WorkloadRun {
            pattern: pattern.to_string(),
            target,
            on_filesystem,
            started_at: None,
            finished_at: None,
            raw_output: None,
            iops: SampleSeries::new("iops", "IO/s"),
            latency_us: SampleSeries::new("latency_us", "us"),
            telemetry: WorkloadTelemetry::default(),
            correlated: None,
            error: None,
        }
    }

    /// A run that never started, e.g. a branch that panicked.
    pub fn failed(pattern: &str, error: Diagnostic) -> Self {
        WorkloadRun {
            error: Some(error),
            ..WorkloadRun::new(pattern, PathBuf::new(), false)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Where a workload writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub path: PathBuf,
    pub on_filesystem: bool,
}

/// Resolve the workload target. On-filesystem targets must sit strictly
/// inside `mountpoint`.
pub fn plan_target(
    cfg: &Config,
    spec: &WorkloadSpec,
    ns: &Namespace,
    mountpoint: Option<&Path>,
) -> Result<Target, ToolError> {
    let fs_mode = cfg.filesystem.fs_workloads;
    match (&spec.target, mountpoint) {
        (Some(t), Some(mp)) if fs_mode || t.is_relative() => {
            let path = if t.is_relative() { mp.join(t) } else { t.clone() };
            if is_inside(mp, &path) {
                Ok(Target {
                    path,
                    on_filesystem: true,
                })
            } else {
                Err(ToolError::Path(format!(
                    "{} is outside mountpoint {}",
                    path.display(),
                    mp.display()
                )))
            }
        }
        (Some(t), _) => Ok(Target {
            path: t.clone(),
            on_filesystem: false,
        }),
        (None, Some(mp)) if fs_mode => workload_file(mp, &cfg.filesystem.file_prefix, &spec.pattern)
            .map(|path| Target {
                path,
                on_filesystem: true,
            })
            .ok_or_else(|| ToolError::Path(format!("no workload file inside {}", mp.display()))),
        (None, _) => {
            if fs_mode {
                log::warn!("{}: not mounted, {} runs on the raw device", ns.path, spec.pattern);
            }
            Ok(Target {
                path: PathBuf::from(&ns.path),
                on_filesystem: false,
            })
        }
    }
}

/// A raw target must exist; a file target needs its mountpoint.
fn preflight(tools: &Toolbox, target: &Target, mountpoint: Option<&Path>) -> Result<(), ToolError> {
    let must_exist = if target.on_filesystem {
        mountpoint.unwrap_or(target.path.as_path())
    } else {
        target.path.as_path()
    };
    if tools.runner().path_exists(must_exist) {
        Ok(())
    } else {
        Err(ToolError::Path(format!("{} does not exist", must_exist.display())))
    }
}

/// Run one workload on `ns` and sample telemetry until it returns.
pub fn run_workload(
    tools: &Toolbox,
    cfg: &Config,
    ns: &Namespace,
    mountpoint: Option<&Path>,
    spec: &WorkloadSpec,
    stop: &StopSignal,
) -> WorkloadRun {
    let scope = format!("{}:{}", ns.path, spec.pattern);
    let target = match plan_target(cfg, spec, ns, mountpoint)
        .and_then(|t| preflight(tools, &t, mountpoint).map(|_| t))
    {
        Ok(t) => t,
        Err(e) => {
            log::error!("{scope}: {e}");
            let target = spec.target.clone().unwrap_or_else(|| PathBuf::from(&ns.path));
            let mut run = WorkloadRun::new(&spec.pattern, target, false);
            run.error = Some(Diagnostic::from_tool(&scope, &e));
            return run;
        }
    };

    let runtime = secs(cfg.fio.runtime);
    let request = FioRequest {
        name: format!("{}_{}", basename(&ns.path), spec.pattern),
        filename: target.path.clone(),
        pattern: spec.pattern.clone(),
        bs: cfg.fio.bs.clone(),
        iodepth: cfg.fio.iodepth,
        runtime,
        ioengine: cfg.fio.ioengine.clone(),
        size: target.on_filesystem.then(|| cfg.filesystem.file_size.clone()),
        status_interval: secs(cfg.smart.interval),
    };
    let mut run = WorkloadRun::new(&spec.pattern, target.path, target.on_filesystem);
    let tel = &cfg.telemetry;
    let ctrl = ns.id.controller.as_str();
    let done = stop.child();

    thread::scope(|s| {
        let thermal = s.spawn(|| {
            telemetry::sample_thermal(tools, &scope, Pacing::new(runtime, secs(tel.sensors_interval)), &done)
        });
        let cpu = s.spawn(|| {
            telemetry::sample_cpu(tools, &scope, Pacing::new(runtime, secs(tel.turbostat_interval)), &done)
        });
        let power = s.spawn(|| {
            telemetry::sample_power_state(
                tools,
                ctrl,
                &scope,
                Pacing::new(runtime, secs(tel.power_state_interval)),
                &done,
            )
        });

        let started = Utc::now();
        run.started_at = Some(started);
        log::info!("{scope}: fio started on {}", request.filename.display());
        let result = fio::run(tools, &request, started);
        run.finished_at = Some(Utc::now());
        done.stop();

        match result {
            Ok(out) => {
                for p in &out.points {
                    run.iops.record(p.at, p.iops);
                    match p.latency_us {
                        Some(l) => run.latency_us.record(p.at, l),
                        None => run.latency_us.record_fault(p.at, "not reported"),
                    }
                }
                log::info!(
                    "{scope}: {} point(s), mean {:.0} IOPS",
                    out.points.len(),
                    run.iops.mean().unwrap_or(0.0)
                );
                run.raw_output = Some(out.raw);
            }
            Err(e) => {
                log::error!("{scope}: {e}");
                run.raw_output = e.raw_output().map(str::to_string);
                run.error = Some(Diagnostic::from_tool(&scope, &e));
            }
        }

        let mut diagnostics = Vec::new();
        match thermal.join() {
            Ok((series, d)) => {
                run.telemetry.thermal = series;
                diagnostics.extend(d);
            }
            Err(p) => diagnostics.push(panicked(&scope, "thermal sampler", p.as_ref())),
        }
        match cpu.join() {
            Ok((freq, power, d)) => {
                run.telemetry.cpu_frequency = freq;
                run.telemetry.cpu_power = power;
                diagnostics.extend(d);
            }
            Err(p) => diagnostics.push(panicked(&scope, "cpu sampler", p.as_ref())),
        }
        match power.join() {
            Ok((series, d)) => {
                run.telemetry.power_state = series;
                diagnostics.extend(d);
            }
            Err(p) => diagnostics.push(panicked(&scope, "power-state sampler", p.as_ref())),
        }
        run.telemetry.diagnostics = diagnostics;
    });
    run
}

fn panicked(scope: &str, what: &str, payload: &(dyn std::any::Any + Send)) -> Diagnostic {
    let msg = format!("{what} panicked: {}", panic_message(payload));
    log::error!("{scope}: {msg}");
    Diagnostic::new(scope, FaultKind::Panicked, msg)
}
