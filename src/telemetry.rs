//! Platform and device telemetry sampled alongside a workload, plus the
//! one-off controller telemetry log.

use std::ops::ControlFlow;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Diagnostic, FaultKind, ToolError};
use crate::sampling::{sample_loop, Pacing, SampleSeries, StopSignal};
use crate::tools::{nvme, platform, Toolbox};

/// Series sampled during one workload run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadTelemetry {
    pub thermal: SampleSeries,
    pub cpu_frequency: SampleSeries,
    pub cpu_power: SampleSeries,
    pub power_state: SampleSeries,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl Default for WorkloadTelemetry {
    fn default() -> Self {
        WorkloadTelemetry {
            thermal: SampleSeries::new("platform_temperature_c", "C"),
            cpu_frequency: SampleSeries::new("cpu_avg_mhz", "MHz"),
            cpu_power: SampleSeries::new("cpu_package_w", "W"),
            power_state: SampleSeries::new("device_power_state", "ps"),
            diagnostics: Vec::new(),
        }
    }
}

/// Sentinel in every series the failed reading feeds. A missing tool breaks
/// the loop, anything else lets it resume on the next interval.
fn sentinel(
    scope: &str,
    series: &mut [&mut SampleSeries],
    diagnostics: &mut Vec<Diagnostic>,
    e: &ToolError,
) -> ControlFlow<()> {
    let at = Utc::now();
    for s in series.iter_mut() {
        s.record_fault(at, e.kind().to_string());
    }
    if diagnostics.iter().all(|d| d.kind != e.kind()) {
        log::warn!("{scope}: {e}");
        diagnostics.push(Diagnostic::from_tool(scope, e));
    }
    if e.kind() == FaultKind::ToolUnavailable {
        ControlFlow::Break(())
    } else {
        ControlFlow::Continue(())
    }
}

pub fn sample_thermal(
    tools: &Toolbox,
    scope: &str,
    pacing: Pacing,
    stop: &StopSignal,
) -> (SampleSeries, Vec<Diagnostic>) {
    let mut series = WorkloadTelemetry::default().thermal;
    let mut diags = Vec::new();
    sample_loop(pacing, stop, || match platform::max_temperature(tools) {
        Ok(t) => {
            series.record(Utc::now(), t);
            ControlFlow::Continue(())
        }
        Err(e) => sentinel(scope, &mut [&mut series], &mut diags, &e),
    });
    (series, diags)
}

/// CPU frequency and package power from the same turbostat reading.
pub fn sample_cpu(
    tools: &Toolbox,
    scope: &str,
    pacing: Pacing,
    stop: &StopSignal,
) -> (SampleSeries, SampleSeries, Vec<Diagnostic>) {
    let base = WorkloadTelemetry::default();
    let (mut freq, mut power) = (base.cpu_frequency, base.cpu_power);
    let mut diags = Vec::new();
    sample_loop(pacing, stop, || match platform::cpu_summary(tools, pacing.interval) {
        Ok(r) => {
            let at = Utc::now();
            match r.avg_mhz {
                Some(v) => freq.record(at, v),
                None => freq.record_fault(at, "not reported"),
            }
            match r.pkg_watt {
                Some(v) => power.record(at, v),
                None => power.record_fault(at, "not reported"),
            }
            ControlFlow::Continue(())
        }
        Err(e) => sentinel(scope, &mut [&mut freq, &mut power], &mut diags, &e),
    });
    (freq, power, diags)
}

pub fn sample_power_state(
    tools: &Toolbox,
    ctrl: &str,
    scope: &str,
    pacing: Pacing,
    stop: &StopSignal,
) -> (SampleSeries, Vec<Diagnostic>) {
    let mut series = WorkloadTelemetry::default().power_state;
    let mut diags = Vec::new();
    sample_loop(pacing, stop, || match nvme::power_state(tools, ctrl) {
        Ok(ps) => {
            series.record(Utc::now(), f64::from(ps));
            ControlFlow::Continue(())
        }
        Err(e) => sentinel(scope, &mut [&mut series], &mut diags, &e),
    });
    (series, diags)
}

/// Controller telemetry log captured once after testing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerTelemetry {
    pub captured_at: DateTime<Utc>,
    pub output: Option<String>,
    pub fault: Option<Diagnostic>,
}

pub fn capture_controller_telemetry(tools: &Toolbox, ctrl: &str, timeout: Duration) -> ControllerTelemetry {
    let result = nvme::telemetry_log(tools, ctrl, timeout);
    let captured_at = Utc::now();
    match result {
        Ok(output) => ControllerTelemetry {
            captured_at,
            output: Some(output),
            fault: None,
        },
        Err(e) => {
            log::warn!("{ctrl}: telemetry log unavailable: {e}");
            ControllerTelemetry {
                captured_at,
                output: e.raw_output().map(str::to_string),
                fault: Some(Diagnostic::from_tool(ctrl, &e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fast_config, Reply, ScriptedRunner, SENSORS_JSON, TURBOSTAT_TXT};
    use std::sync::Arc;

    fn toolbox(r: ScriptedRunner) -> Toolbox {
        Toolbox::new(Arc::new(r), &fast_config().tools)
    }

    fn pacing() -> Pacing {
        Pacing::new(Duration::from_millis(150), Duration::from_millis(50))
    }

    #[test]
    fn thermal_series() {
        let r = ScriptedRunner::new();
        r.on("sensors", &["-j"], Reply::ok(SENSORS_JSON));
        let (s, d) = sample_thermal(&toolbox(r), "t", pacing(), &StopSignal::new());
        assert_eq!(s.values(), vec![51.0, 51.0, 51.0]);
        assert!(d.is_empty());
    }

    #[test]
    fn cpu_reading_feeds_two_series() {
        let r = ScriptedRunner::new();
        r.on("turbostat", &[], Reply::ok(TURBOSTAT_TXT));
        let (f, p, d) = sample_cpu(&toolbox(r), "t", pacing(), &StopSignal::new());
        assert_eq!(f.values(), vec![900.0, 900.0, 900.0]);
        assert_eq!(p.values(), vec![15.25, 15.25, 15.25]);
        assert!(d.is_empty());
    }

    #[test]
    fn permission_failure_resumes_next_interval() {
        let r = ScriptedRunner::new();
        r.on("turbostat", &[], Reply::ok(TURBOSTAT_TXT))
            .once("turbostat", &[], Reply::fail("turbostat: Permission denied"));
        let (f, p, d) = sample_cpu(&toolbox(r), "t", pacing(), &StopSignal::new());
        assert_eq!(f.len(), 3);
        assert!(f.samples[0].is_sentinel() && p.samples[0].is_sentinel());
        assert_eq!(f.values().len(), 2);
        assert_eq!(d[0].kind, FaultKind::PermissionDenied);
    }

    #[test]
    fn missing_sensors_tool_is_one_sentinel() {
        let (s, d) = sample_thermal(&toolbox(ScriptedRunner::new()), "t", pacing(), &StopSignal::new());
        assert_eq!(s.len(), 1);
        assert_eq!(s.samples[0].fault.as_deref(), Some("tool-unavailable"));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn power_state_series() {
        let r = ScriptedRunner::new();
        r.on(
            "nvme",
            &["get-feature", "/dev/nvme0"],
            Reply::ok("get-feature:0x02 (Power Management), Current value:0x00000004"),
        );
        let (s, _) = sample_power_state(&toolbox(r), "/dev/nvme0", "t", pacing(), &StopSignal::new());
        assert_eq!(s.values(), vec![4.0, 4.0, 4.0]);
    }

    #[test]
    fn controller_telemetry_unsupported() {
        let r = ScriptedRunner::new();
        r.on("nvme", &["telemetry-log"], Reply::fail("NVMe status: Invalid Field in Command"));
        let t = capture_controller_telemetry(&toolbox(r), "/dev/nvme0", Duration::from_secs(1));
        assert_eq!(t.fault.unwrap().kind, FaultKind::Unsupported);
        assert!(t.output.is_none());
    }
}
