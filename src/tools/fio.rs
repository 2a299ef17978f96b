//! `fio` workload execution and the derived performance series.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use super::Toolbox;
use crate::error::ToolError;
use crate::extract::{self, as_f64, lookup};

const FIO: &str = "fio";

#[derive(Debug, Clone, PartialEq)]
pub struct FioRequest {
    pub name: String,
    pub filename: PathBuf,
    pub pattern: String,
    pub bs: String,
    pub iodepth: u32,
    pub runtime: Duration,
    pub ioengine: String,
    /// File size for on-filesystem targets; raw devices use their full size.
    pub size: Option<String>,
    pub status_interval: Duration,
}

impl FioRequest {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--name={}", self.name),
            format!("--filename={}", self.filename.display()),
            format!("--rw={}", self.pattern),
            format!("--bs={}", self.bs),
            format!("--iodepth={}", self.iodepth),
            format!("--runtime={}", whole_secs(self.runtime)),
            "--time_based=1".to_string(),
            format!("--ioengine={}", self.ioengine),
            "--output-format=json".to_string(),
            format!("--status-interval={}", whole_secs(self.status_interval)),
        ];
        if let Some(size) = &self.size {
            args.push(format!("--size={size}"));
        }
        args
    }
}

/// fio takes whole seconds; anything shorter still runs for one.
fn whole_secs(d: Duration) -> u64 {
    (d.as_secs_f64().ceil() as u64).max(1)
}

/// One derived point: throughput and mean completion latency at `at`.
#[derive(Debug, Clone, PartialEq)]
pub struct PerfPoint {
    pub at: DateTime<Utc>,
    pub iops: f64,
    pub latency_us: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FioOutput {
    pub raw: String,
    pub points: Vec<PerfPoint>,
}

pub fn run(tools: &Toolbox, req: &FioRequest, started: DateTime<Utc>) -> Result<FioOutput, ToolError> {
    let spec = tools
        .command(FIO)
        .args(req.args())
        .privileged()
        .timeout(tools.long_timeout(req.runtime));
    let raw = tools.run(&spec)?;
    let points = parse_stream(&raw, started, req.status_interval)?;
    Ok(FioOutput { raw, points })
}

/// Every status report in the output becomes one point. fio closes the
/// stream with a whole-run report; it is dropped when status reports precede
/// it, and used alone otherwise. Reports without a `timestamp_ms` are placed
/// at `started + k·interval`.
pub fn parse_stream(
    raw: &str,
    started: DateTime<Utc>,
    interval: Duration,
) -> Result<Vec<PerfPoint>, ToolError> {
    let step = chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());
    let mut reports: Vec<Value> = extract::json_documents(raw)
        .into_iter()
        .filter(|doc| doc.get("jobs").and_then(Value::as_array).is_some())
        .collect();
    if reports.len() > 1 {
        reports.pop();
    }
    let mut points: Vec<PerfPoint> = reports
        .iter()
        .enumerate()
        .map(|(k, doc)| {
            let fallback = started + step * (k as i32 + 1);
            report_point(doc, fallback)
        })
        .collect();
    if points.is_empty() {
        return Err(ToolError::malformed(FIO, "no fio JSON report in output", raw));
    }
    for i in 1..points.len() {
        if points[i].at < points[i - 1].at {
            points[i].at = points[i - 1].at;
        }
    }
    Ok(points)
}

fn report_point(doc: &Value, fallback: DateTime<Utc>) -> PerfPoint {
    let at = doc
        .get("timestamp_ms")
        .and_then(extract::as_u64)
        .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single())
        .unwrap_or(fallback);

    let mut iops = 0.0;
    let mut weighted_lat = 0.0;
    let mut lat_sum = 0.0;
    let mut lat_count = 0usize;
    let jobs = doc.get("jobs").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);
    for job in jobs {
        for dir in ["read", "write"] {
            let dir_iops = lookup(job, &[dir, "iops"]).and_then(as_f64).unwrap_or(0.0);
            iops += dir_iops;
            if let Some(lat_ns) = lookup(job, &[dir, "clat_ns", "mean"]).and_then(as_f64) {
                if lat_ns > 0.0 {
                    weighted_lat += dir_iops * lat_ns / 1000.0;
                    lat_sum += lat_ns / 1000.0;
                    lat_count += 1;
                }
            }
        }
    }
    let latency_us = if iops > 0.0 && weighted_lat > 0.0 {
        Some(weighted_lat / iops)
    } else if lat_count > 0 {
        Some(lat_sum / lat_count as f64)
    } else {
        None
    };
    PerfPoint { at, iops, latency_us }
}
