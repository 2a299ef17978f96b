//! CSV export of a persisted report's series.
//!
//! Two flat tables: one row per health sample, one row per performance point.
//! Both are written from the record alone.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::report::{NamespaceReport, Report, ReportError, RunReport};

const HEALTH_HEADER: [&str; 11] = [
    "timestamp",
    "controller",
    "namespace",
    "model",
    "serial",
    "temperature_c",
    "percentage_used",
    "media_errors",
    "critical_warning",
    "available_spare",
    "fault",
];

const PERFORMANCE_HEADER: [&str; 7] = [
    "timestamp",
    "controller",
    "namespace",
    "workload",
    "iops",
    "latency_us",
    "fault",
];

fn cell(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

fn open_writer(path: &Path) -> Result<csv::Writer<File>, ReportError> {
    let file = File::create(path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(csv::Writer::from_writer(file))
}

fn write_health(w: &mut csv::Writer<File>, c: &RunReport, ns: &NamespaceReport) -> Result<(), csv::Error> {
    for s in &ns.health.samples {
        w.write_record([
            s.at.to_rfc3339(),
            c.controller.path.clone(),
            ns.namespace.path.clone(),
            c.controller.model.clone(),
            c.controller.serial.clone(),
            cell(s.temperature_c),
            cell(s.percentage_used),
            cell(s.media_errors),
            cell(s.critical_warning),
            cell(s.available_spare),
            s.fault.clone().unwrap_or_default(),
        ])?;
    }
    Ok(())
}

/// IOPS and latency points come from the same status reports, so they pair by index.
fn write_performance(w: &mut csv::Writer<File>, c: &RunReport, ns: &NamespaceReport) -> Result<(), csv::Error> {
    for run in &ns.workloads {
        for (i, p) in run.iops.samples.iter().enumerate() {
            let latency = run.latency_us.samples.get(i).and_then(|s| s.value);
            w.write_record([
                p.at.to_rfc3339(),
                c.controller.path.clone(),
                ns.namespace.path.clone(),
                run.pattern.clone(),
                cell(p.value),
                cell(latency),
                p.fault.clone().unwrap_or_default(),
            ])?;
        }
    }
    Ok(())
}

impl Report {
    /// File stem shared by the JSON report and its CSV tables.
    fn stem(&self) -> String {
        let name = self.file_name();
        name.trim_end_matches(".json").to_string()
    }

    /// Write `<stem>_health.csv` and `<stem>_performance.csv` under `dir`.
    pub fn export_csv(&self, dir: &Path) -> Result<Vec<PathBuf>, ReportError> {
        fs::create_dir_all(dir).map_err(|source| ReportError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let stem = self.stem();
        let health_path = dir.join(format!("{stem}_health.csv"));
        let perf_path = dir.join(format!("{stem}_performance.csv"));

        let mut health = open_writer(&health_path)?;
        let mut perf = open_writer(&perf_path)?;
        health.write_record(HEALTH_HEADER)?;
        perf.write_record(PERFORMANCE_HEADER)?;
        for c in &self.controllers {
            for ns in &c.namespaces {
                write_health(&mut health, c, ns)?;
                write_performance(&mut perf, c, ns)?;
            }
        }
        health.flush().map_err(|source| ReportError::Io {
            path: health_path.clone(),
            source,
        })?;
        perf.flush().map_err(|source| ReportError::Io {
            path: perf_path.clone(),
            source,
        })?;
        log::info!("csv written to {} and {}", health_path.display(), perf_path.display());
        Ok(vec![health_path, perf_path])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::health::{HealthSample, HealthTimeline};
    use crate::report::RunMetadata;
    use crate::topology::{Confidence, Controller, LinkAttributes, Namespace, NamespaceId};
    use crate::workload::WorkloadRun;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(s: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + s, 0).single().unwrap()
    }

    fn namespace_report() -> NamespaceReport {
        let mut health = HealthTimeline::default();
        health.samples.push(HealthSample {
            at: at(0),
            temperature_c: Some(40.0),
            percentage_used: Some(2.0),
            media_errors: Some(0.0),
            critical_warning: Some(0.0),
            available_spare: Some(100.0),
            fault: None,
        });
        health.samples.push(HealthSample {
            at: at(1),
            temperature_c: None,
            percentage_used: None,
            media_errors: None,
            critical_warning: None,
            available_spare: None,
            fault: Some("timeout".into()),
        });
        let mut run = WorkloadRun::new("randwrite", PathBuf::from("/dev/nvme0n1"), false);
        run.iops.record(at(0), 1200.0);
        run.latency_us.record(at(0), 85.5);
        run.iops.record(at(1), 1300.0);
        run.latency_us.record(at(1), 80.0);
        NamespaceReport {
            namespace: Namespace {
                id: NamespaceId {
                    controller: "/dev/nvme0".into(),
                    nsid: 1,
                },
                path: "/dev/nvme0n1".into(),
                confidence: Confidence::Discovered,
            },
            state: crate::provision::NamespaceState::Untouched,
            mountpoint: None,
            provisioning: Vec::new(),
            teardown: Vec::new(),
            started_at: Some(at(0)),
            finished_at: Some(at(2)),
            health,
            workloads: vec![run],
            diagnostics: Vec::new(),
        }
    }

    fn report() -> Report {
        Report {
            metadata: RunMetadata::collect(at(0), &Config::default()),
            controllers: vec![RunReport {
                controller: Controller {
                    path: "/dev/nvme0".into(),
                    model: "QA Model".into(),
                    serial: "SN0001".into(),
                    firmware: "FW1.0".into(),
                    link: LinkAttributes::default(),
                },
                sanitize: None,
                namespaces: vec![namespace_report()],
                telemetry: None,
                diagnostics: Vec::new(),
            }],
            diagnostics: Vec::new(),
        }
    }

    #[test]
    fn tables_carry_one_row_per_point() {
        let dir = tempfile::tempdir().unwrap();
        let paths = report().export_csv(dir.path()).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].to_string_lossy().ends_with("_health.csv"));

        let mut health = csv::Reader::from_path(&paths[0]).unwrap();
        assert_eq!(health.headers().unwrap().len(), HEALTH_HEADER.len());
        let rows: Vec<csv::StringRecord> = health.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][2], "/dev/nvme0n1");
        assert_eq!(&rows[0][5], "40");
        assert_eq!(&rows[1][5], "");
        assert_eq!(&rows[1][10], "timeout");

        let mut perf = csv::Reader::from_path(&paths[1]).unwrap();
        let rows: Vec<csv::StringRecord> = perf.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][3], "randwrite");
        assert_eq!(&rows[0][4], "1200");
        assert_eq!(&rows[0][5], "85.5");
    }

    #[test]
    fn export_shares_the_report_stem() {
        let dir = tempfile::tempdir().unwrap();
        let r = report();
        let json = r.persist(dir.path()).unwrap();
        let paths = r.export_csv(dir.path()).unwrap();
        let stem = json.file_stem().unwrap().to_string_lossy().to_string();
        assert!(paths
            .iter()
            .all(|p| p.file_name().unwrap().to_string_lossy().starts_with(&stem)));
    }
}
