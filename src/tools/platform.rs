//! Host telemetry: `sensors` (lm-sensors) and `turbostat`.

use std::time::Duration;

use serde_json::Value;

use super::Toolbox;
use crate::error::ToolError;
use crate::extract::{self, as_f64};

const SENSORS: &str = "sensors";
const TURBOSTAT: &str = "turbostat";

/// Hottest `temp*_input` reading across every chip `sensors -j` reports.
pub fn max_temperature(tools: &Toolbox) -> Result<f64, ToolError> {
    let spec = tools.command(SENSORS).arg("-j");
    let raw = tools.run(&spec)?;
    parse_sensors(&raw)
}

pub fn parse_sensors(raw: &str) -> Result<f64, ToolError> {
    let doc = extract::parse_json(SENSORS, raw)?;
    let mut hottest: Option<f64> = None;
    visit_inputs(&doc, &mut |v| {
        hottest = Some(hottest.map_or(v, |h: f64| h.max(v)));
    });
    hottest.ok_or_else(|| ToolError::malformed(SENSORS, "no temperature inputs", raw))
}

fn visit_inputs(value: &Value, f: &mut dyn FnMut(f64)) {
    if let Value::Object(map) = value {
        for (key, v) in map {
            if key.starts_with("temp") && key.ends_with("_input") {
                if let Some(t) = as_f64(v) {
                    f(t);
                }
            } else {
                visit_inputs(v, f);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuReading {
    pub avg_mhz: Option<f64>,
    pub pkg_watt: Option<f64>,
}

/// One summary row measured over `interval`.
pub fn cpu_summary(tools: &Toolbox, interval: Duration) -> Result<CpuReading, ToolError> {
    let secs = (interval.as_secs_f64().ceil() as u64).max(1);
    let spec = tools
        .command(TURBOSTAT)
        .args(["--quiet", "--Summary", "--num_iterations", "1", "--interval"])
        .arg(secs.to_string())
        .privileged()
        .timeout(tools.long_timeout(interval));
    let raw = tools.run(&spec)?;
    parse_turbostat(&raw)
}

/// Reads the last data row under the last header row.
pub fn parse_turbostat(raw: &str) -> Result<CpuReading, ToolError> {
    let mut header: Option<Vec<&str>> = None;
    let mut row: Option<Vec<&str>> = None;
    for line in raw.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.iter().any(|c| *c == "Avg_MHz" || *c == "PkgWatt") {
            header = Some(cols);
        } else if header.is_some()
            && !cols.is_empty()
            && cols.iter().all(|c| c.parse::<f64>().is_ok() || *c == "-")
        {
            row = Some(cols);
        }
    }
    let (Some(header), Some(row)) = (header, row) else {
        return Err(ToolError::malformed(TURBOSTAT, "no summary table", raw));
    };
    let column = |name: &str| {
        header
            .iter()
            .position(|h| *h == name)
            .and_then(|i| row.get(i))
            .and_then(|v| v.parse::<f64>().ok())
    };
    let reading = CpuReading {
        avg_mhz: column("Avg_MHz"),
        pkg_watt: column("PkgWatt"),
    };
    if reading == CpuReading::default() {
        return Err(ToolError::malformed(TURBOSTAT, "summary lacks Avg_MHz and PkgWatt", raw));
    }
    Ok(reading)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensors_hottest_input() {
        let raw = r#"{
            "coretemp-isa-0000": {"Adapter": "ISA adapter",
                "Package id 0": {"temp1_input": 52.0, "temp1_max": 100.0},
                "Core 0": {"temp2_input": 49.0}},
            "nvme-pci-0100": {"Composite": {"temp1_input": 38.85, "temp1_crit": 84.85}}
        }"#;
        assert_eq!(parse_sensors(raw).unwrap(), 52.0);
    }

    #[test]
    fn sensors_without_inputs() {
        assert!(parse_sensors(r#"{"acpitz-acpi-0": {"Adapter": "ACPI"}}"#).is_err());
    }

    #[test]
    fn turbostat_summary_row() {
        let raw = "Avg_MHz\tBusy%\tBzy_MHz\tTSC_MHz\tPkgWatt\tRAMWatt\n812\t20.53\t3956\t2995\t12.34\t1.50\n";
        let r = parse_turbostat(raw).unwrap();
        assert_eq!(r.avg_mhz, Some(812.0));
        assert_eq!(r.pkg_watt, Some(12.34));
    }

    #[test]
    fn turbostat_without_power_column() {
        let raw = "Avg_MHz Busy%\n1200 10.0\n";
        let r = parse_turbostat(raw).unwrap();
        assert_eq!(r.pkg_watt, None);
        assert!(parse_turbostat("turbostat: no /dev/cpu/0/msr").is_err());
    }
}
