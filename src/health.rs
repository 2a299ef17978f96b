//! Health-log (SMART) monitoring of one namespace.

use std::ops::ControlFlow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Diagnostic, FaultKind};
use crate::sampling::{sample_loop, Pacing, SampleSeries, StopSignal};
use crate::tools::nvme::{self, HealthReading};
use crate::tools::Toolbox;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub at: DateTime<Utc>,
    pub temperature_c: Option<f64>,
    pub percentage_used: Option<f64>,
    pub media_errors: Option<f64>,
    pub critical_warning: Option<f64>,
    pub available_spare: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl HealthSample {
    fn reading(at: DateTime<Utc>, r: HealthReading) -> Self {
        HealthSample {
            at,
            temperature_c: r.temperature_c,
            percentage_used: r.percentage_used,
            media_errors: r.media_errors,
            critical_warning: r.critical_warning,
            available_spare: r.available_spare,
            fault: None,
        }
    }

    fn sentinel(at: DateTime<Utc>, fault: String) -> Self {
        HealthSample {
            fault: Some(fault),
            ..HealthSample::reading(at, HealthReading::default())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthMetric {
    Temperature,
    PercentageUsed,
    MediaErrors,
    CriticalWarning,
    AvailableSpare,
}

impl HealthMetric {
    pub const ALL: [HealthMetric; 5] = [
        HealthMetric::Temperature,
        HealthMetric::PercentageUsed,
        HealthMetric::MediaErrors,
        HealthMetric::CriticalWarning,
        HealthMetric::AvailableSpare,
    ];

    fn name_and_unit(self) -> (&'static str, &'static str) {
        match self {
            HealthMetric::Temperature => ("temperature_c", "C"),
            HealthMetric::PercentageUsed => ("percentage_used", "%"),
            HealthMetric::MediaErrors => ("media_errors", "count"),
            HealthMetric::CriticalWarning => ("critical_warning", "bits"),
            HealthMetric::AvailableSpare => ("available_spare", "%"),
        }
    }

    fn pick(self, s: &HealthSample) -> Option<f64> {
        match self {
            HealthMetric::Temperature => s.temperature_c,
            HealthMetric::PercentageUsed => s.percentage_used,
            HealthMetric::MediaErrors => s.media_errors,
            HealthMetric::CriticalWarning => s.critical_warning,
            HealthMetric::AvailableSpare => s.available_spare,
        }
    }
}

/// Health samples of one namespace over its test window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthTimeline {
    pub samples: Vec<HealthSample>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl HealthTimeline {
    /// One metric as a series; sentinels stay in as gaps.
    pub fn series(&self, metric: HealthMetric) -> SampleSeries {
        let (name, unit) = metric.name_and_unit();
        let mut out = SampleSeries::new(name, unit);
        for s in &self.samples {
            match (metric.pick(s), &s.fault) {
                (Some(v), _) => out.record(s.at, v),
                (None, Some(f)) => out.record_fault(s.at, f.clone()),
                (None, None) => out.record_fault(s.at, "not reported"),
            }
        }
        out
    }

    /// Temperature readings, the axis timelines are correlated on.
    pub fn temperature(&self) -> SampleSeries {
        self.series(HealthMetric::Temperature)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Sample the health log of `ns` on `pacing` until the window closes or
/// `stop` fires. A missing tool ends sampling after one sentinel; any other
/// failure leaves a sentinel for that interval and sampling goes on.
pub fn monitor_health(tools: &Toolbox, ns: &str, pacing: Pacing, stop: &StopSignal) -> HealthTimeline {
    let mut timeline = HealthTimeline::default();
    sample_loop(pacing, stop, || {
        let result = nvme::smart_log(tools, ns);
        let at = Utc::now();
        match result {
            Ok(r) => {
                log::debug!("{ns}: temperature {:?} C", r.temperature_c);
                timeline.samples.push(HealthSample::reading(at, r));
                ControlFlow::Continue(())
            }
            Err(e) => {
                let fatal = e.kind() == FaultKind::ToolUnavailable;
                if timeline.diagnostics.iter().all(|d| d.kind != e.kind()) {
                    log::warn!("{ns}: health sample failed: {e}");
                    timeline.diagnostics.push(Diagnostic::from_tool(ns, &e));
                }
                timeline.samples.push(HealthSample::sentinel(at, e.kind().to_string()));
                if fatal {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        }
    });
    log::info!("{ns}: {} health sample(s) collected", timeline.len());
    timeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fast_config, smart_json, Reply, ScriptedRunner};
    use std::sync::Arc;
    use std::time::Duration;

    fn toolbox(r: ScriptedRunner) -> Toolbox {
        Toolbox::new(Arc::new(r), &fast_config().tools)
    }

    fn pacing(ms_duration: u64, ms_interval: u64) -> Pacing {
        Pacing::new(
            Duration::from_millis(ms_duration),
            Duration::from_millis(ms_interval),
        )
    }

    #[test]
    fn collects_one_sample_per_interval() {
        let r = ScriptedRunner::new();
        r.on("nvme", &["smart-log", "/dev/nvme0n1"], Reply::ok(smart_json(313)));
        let t = monitor_health(&toolbox(r), "/dev/nvme0n1", pacing(200, 100), &StopSignal::new());
        assert_eq!(t.len(), 2);
        assert_eq!(t.temperature().values(), vec![39.85, 39.85]);
        assert!(t.diagnostics.is_empty());
    }

    #[test]
    fn malformed_interval_leaves_a_gap() {
        let r = ScriptedRunner::new();
        r.on("nvme", &["smart-log"], Reply::ok(smart_json(300)))
            .once("nvme", &["smart-log"], Reply::ok("garbage"));
        let t = monitor_health(&toolbox(r), "/dev/nvme0n1", pacing(150, 50), &StopSignal::new());
        assert_eq!(t.len(), 3);
        assert_eq!(t.samples[0].fault.as_deref(), Some("malformed-output"));
        let temps = t.temperature();
        assert!(temps.samples[0].is_sentinel());
        assert_eq!(temps.values().len(), 2);
        assert_eq!(t.diagnostics.len(), 1);
    }

    #[test]
    fn missing_tool_stops_after_one_sentinel() {
        let t = monitor_health(
            &toolbox(ScriptedRunner::new()),
            "/dev/nvme0n1",
            pacing(500, 10),
            &StopSignal::new(),
        );
        assert_eq!(t.len(), 1);
        assert_eq!(t.diagnostics[0].kind, FaultKind::ToolUnavailable);
    }

    #[test]
    fn every_metric_has_a_series() {
        let r = ScriptedRunner::new();
        r.on("nvme", &["smart-log"], Reply::ok(smart_json(310)));
        let t = monitor_health(&toolbox(r), "/dev/nvme0n1", pacing(100, 100), &StopSignal::new());
        for m in HealthMetric::ALL {
            assert_eq!(t.series(m).len(), 1);
        }
        assert_eq!(t.series(HealthMetric::PercentageUsed).values(), vec![2.0]);
    }
}
