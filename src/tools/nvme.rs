//! `nvme-cli` calls: enumeration, identify, health log, feature and
//! provisioning commands.

use std::collections::BTreeSet;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Toolbox;
use crate::error::ToolError;
use crate::extract::{self, first_f64, first_u64};
use crate::path_utils::{device_node, split_namespace};

const NVME: &str = "nvme";

/// Kelvin readings are told apart from Celsius by magnitude.
const KELVIN_THRESHOLD: f64 = 200.0;

/// Namespace nodes reported by one `nvme list` call. Controllers are derived
/// from these paths, never listed separately.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListSnapshot {
    pub namespaces: Vec<String>,
}

pub fn list(tools: &Toolbox) -> Result<ListSnapshot, ToolError> {
    let spec = tools.command(NVME).args(["list", "-o", "json"]).privileged();
    let raw = tools.run(&spec)?;
    parse_list(&raw)
}

/// Accepts the flat (`Devices[].DevicePath`) and the nested
/// (`Devices[].Subsystems[].Controllers[].Namespaces[].NameSpace`) layouts.
pub fn parse_list(raw: &str) -> Result<ListSnapshot, ToolError> {
    let doc = extract::parse_json(NVME, raw)?;
    let devices = doc
        .get("Devices")
        .and_then(Value::as_array)
        .ok_or_else(|| ToolError::malformed(NVME, "no Devices array in nvme list output", raw))?;

    let mut found = BTreeSet::new();
    for dev in devices {
        collect_namespace_nodes(dev, &mut found);
    }
    Ok(ListSnapshot {
        namespaces: found.into_iter().collect(),
    })
}

fn collect_namespace_nodes(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if key == "DevicePath" || key == "NameSpace" {
                    if let Some(name) = v.as_str() {
                        let node = device_node(name.trim());
                        if split_namespace(&node).is_some() {
                            out.insert(node);
                        }
                    }
                } else {
                    collect_namespace_nodes(v, out);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_namespace_nodes(v, out)),
        _ => {}
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyController {
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

pub fn id_ctrl(tools: &Toolbox, ctrl: &str) -> Result<IdentifyController, ToolError> {
    let spec = tools
        .command(NVME)
        .args(["id-ctrl", ctrl, "-o", "json"])
        .privileged();
    let raw = tools.run(&spec)?;
    parse_id_ctrl(&raw)
}

pub fn parse_id_ctrl(raw: &str) -> Result<IdentifyController, ToolError> {
    let doc = extract::parse_json(NVME, raw)?;
    let field = |name| extract::text(&doc, name).unwrap_or_else(|| "unknown".to_string());
    Ok(IdentifyController {
        model: field("mn"),
        serial: field("sn"),
        firmware: field("fr"),
    })
}

/// One health-log snapshot. Fields the device or tool version did not
/// report stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReading {
    pub temperature_c: Option<f64>,
    pub percentage_used: Option<f64>,
    pub media_errors: Option<f64>,
    pub critical_warning: Option<f64>,
    pub available_spare: Option<f64>,
}

pub fn smart_log(tools: &Toolbox, ns: &str) -> Result<HealthReading, ToolError> {
    let spec = tools
        .command(NVME)
        .args(["smart-log", ns, "-o", "json"])
        .privileged();
    let raw = tools.run(&spec)?;
    parse_smart_log(&raw)
}

pub fn parse_smart_log(raw: &str) -> Result<HealthReading, ToolError> {
    let doc = extract::parse_json(NVME, raw)?;
    let log = extract::unwrap_keyed(&doc, "critical_warning")
        .or_else(|| extract::unwrap_keyed(&doc, "temperature"))
        .unwrap_or(&doc);

    let reading = HealthReading {
        temperature_c: first_f64(log, &["temperature", "composite_temperature"]).map(to_celsius),
        percentage_used: first_f64(log, &["percent_used", "percentage_used"]),
        media_errors: first_f64(log, &["media_errors"]),
        critical_warning: first_f64(log, &["critical_warning"]),
        available_spare: first_f64(log, &["avail_spare", "available_spare"]),
    };
    if reading == HealthReading::default() {
        return Err(ToolError::malformed(NVME, "no health fields in smart-log output", raw));
    }
    Ok(reading)
}

pub fn to_celsius(t: f64) -> f64 {
    if t > KELVIN_THRESHOLD {
        ((t - 273.15) * 100.0).round() / 100.0
    } else {
        t
    }
}

/// Namespace write protect, feature 0x82.
pub fn set_write_protect(
    tools: &Toolbox,
    ctrl: &str,
    nsid: u32,
    value: u32,
) -> Result<String, ToolError> {
    let spec = tools
        .command(NVME)
        .args(["set-feature", ctrl, "-n"])
        .arg(nsid.to_string())
        .args(["-f", "0x82", "-v"])
        .arg(value.to_string())
        .privileged();
    tools.run(&spec)
}

pub fn sanitize(
    tools: &Toolbox,
    ctrl: &str,
    sanact: u8,
    ause: bool,
    owpass: Option<u32>,
) -> Result<String, ToolError> {
    let mut spec = tools
        .command(NVME)
        .args(["sanitize", ctrl])
        .arg(format!("--sanact={sanact}"))
        .privileged();
    if ause {
        spec = spec.arg("--ause=1");
    }
    if let Some(n) = owpass {
        spec = spec.arg(format!("--owpass={n}"));
    }
    tools.run(&spec)
}

/// Sanitize status field, low three bits of SSTAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanitizeStatus {
    Idle,
    Completed,
    InProgress,
    Failed,
    CompletedNoDeallocate,
    Unknown,
}

impl SanitizeStatus {
    fn from_sstat(sstat: u64) -> Self {
        match sstat & 0x7 {
            0 => SanitizeStatus::Idle,
            1 => SanitizeStatus::Completed,
            2 => SanitizeStatus::InProgress,
            3 => SanitizeStatus::Failed,
            4 => SanitizeStatus::CompletedNoDeallocate,
            _ => SanitizeStatus::Unknown,
        }
    }

    /// An end state the device posts only once a sanitize has run.
    /// Idle also reads as "no sanitize yet", so it is not conclusive alone.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SanitizeStatus::Completed | SanitizeStatus::Failed | SanitizeStatus::CompletedNoDeallocate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SanitizeProgress {
    pub status: SanitizeStatus,
    /// Fraction of the operation completed, when reported.
    pub fraction: Option<f64>,
}

pub fn sanitize_log(tools: &Toolbox, ctrl: &str) -> Result<SanitizeProgress, ToolError> {
    let spec = tools
        .command(NVME)
        .args(["sanitize-log", ctrl, "-o", "json"])
        .privileged();
    let raw = tools.run(&spec)?;
    parse_sanitize_log(&raw)
}

pub fn parse_sanitize_log(raw: &str) -> Result<SanitizeProgress, ToolError> {
    let doc = extract::parse_json(NVME, raw)?;
    let log = extract::unwrap_keyed(&doc, "sstat")
        .ok_or_else(|| ToolError::malformed(NVME, "no sstat in sanitize-log output", raw))?;
    let sstat = log
        .get("sstat")
        .and_then(|v| match v {
            Value::Object(_) => first_u64(v, &["status", "value"]),
            other => extract::as_u64(other),
        })
        .ok_or_else(|| ToolError::malformed(NVME, "unreadable sstat", raw))?;
    let mut status = SanitizeStatus::from_sstat(sstat);
    let fraction = first_u64(log, &["sprog"]).map(|p| p as f64 / 65535.0);
    if status == SanitizeStatus::InProgress && fraction.is_some_and(|f| f >= 1.0) {
        status = SanitizeStatus::Completed;
    }
    Ok(SanitizeProgress { status, fraction })
}

pub fn format_namespace(tools: &Toolbox, ns: &str, lbaf: u32, ses: u32) -> Result<String, ToolError> {
    let spec = tools
        .command(NVME)
        .args(["format", ns])
        .arg(format!("--lbaf={lbaf}"))
        .arg(format!("--ses={ses}"))
        .privileged();
    tools.run(&spec)
}

/// Controller-scoped format addressing the namespace by id.
pub fn format_by_nsid(
    tools: &Toolbox,
    ctrl: &str,
    nsid: u32,
    lbaf: u32,
    ses: u32,
) -> Result<String, ToolError> {
    let spec = tools
        .command(NVME)
        .args(["format", ctrl, "-n"])
        .arg(nsid.to_string())
        .arg(format!("--lbaf={lbaf}"))
        .arg(format!("--ses={ses}"))
        .privileged();
    tools.run(&spec)
}

static PS_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(PS\)\s*:\s*(\d+)").expect("power state regex"));
static CURRENT_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)current value\s*:\s*(?:0x)?([0-9a-f]+)").expect("feature value regex")
});

/// Current power state (feature 0x02).
pub fn power_state(tools: &Toolbox, ctrl: &str) -> Result<u32, ToolError> {
    let spec = tools
        .command(NVME)
        .args(["get-feature", ctrl, "-f", "2", "-H"])
        .privileged();
    let raw = tools.run(&spec)?;
    parse_power_state(&raw)
}

pub fn parse_power_state(raw: &str) -> Result<u32, ToolError> {
    if let Some(ps) = PS_FIELD
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
    {
        return Ok(ps);
    }
    CURRENT_VALUE
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| u32::from_str_radix(m.as_str(), 16).ok())
        .map(|v| v & 0x1f)
        .ok_or_else(|| ToolError::malformed(NVME, "no power state in get-feature output", raw))
}

/// Controller telemetry log, kept as text (JSON when the tool supports it).
pub fn telemetry_log(tools: &Toolbox, ctrl: &str, timeout: Duration) -> Result<String, ToolError> {
    let spec = tools
        .command(NVME)
        .args(["telemetry-log", ctrl, "-o", "json"])
        .timeout(timeout);
    tools.run(&spec)
}
