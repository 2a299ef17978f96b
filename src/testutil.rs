//! Scripted stand-in for the host, used by unit tests across the crate.

use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::Config;
use crate::shell::{CommandOutput, CommandRunner, CommandSpec};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ok(String),
    Fail { status: i32, stderr: String },
    Io(ErrorKind),
    Panic(&'static str),
}

impl Reply {
    pub(crate) fn ok(s: impl Into<String>) -> Self {
        Reply::Ok(s.into())
    }

    pub(crate) fn fail(stderr: &str) -> Self {
        Reply::Fail {
            status: 1,
            stderr: stderr.to_string(),
        }
    }
}

struct Rule {
    program: String,
    needles: Vec<String>,
    reply: Reply,
    delay: Duration,
    once: bool,
}

impl Rule {
    fn matches(&self, spec: &CommandSpec) -> bool {
        let line = spec.args.join(" ");
        spec.program == self.program && self.needles.iter().all(|n| line.contains(n.as_str()))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub program: String,
    pub args: Vec<String>,
    pub started: Instant,
    pub finished: Instant,
}

impl Call {
    pub fn line(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Rules are searched newest first, so later rules override earlier ones.
/// A call no rule matches behaves like a missing program.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    journal: Mutex<Vec<Call>>,
    paths: Mutex<HashSet<PathBuf>>,
    attrs: Mutex<HashMap<PathBuf, String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        ScriptedRunner::default()
    }

    fn add(&self, program: &str, needles: &[&str], reply: Reply, delay: Duration, once: bool) {
        self.rules.lock().push(Rule {
            program: program.to_string(),
            needles: needles.iter().map(|s| s.to_string()).collect(),
            reply,
            delay,
            once,
        });
    }

    pub fn on(&self, program: &str, needles: &[&str], reply: Reply) -> &Self {
        self.add(program, needles, reply, Duration::ZERO, false);
        self
    }

    pub fn on_delayed(&self, program: &str, needles: &[&str], reply: Reply, delay: Duration) -> &Self {
        self.add(program, needles, reply, delay, false);
        self
    }

    /// Answer one matching call, then fall through to older rules.
    pub fn once(&self, program: &str, needles: &[&str], reply: Reply) -> &Self {
        self.add(program, needles, reply, Duration::ZERO, true);
        self
    }

    pub fn with_path(&self, path: impl Into<PathBuf>) -> &Self {
        self.paths.lock().insert(path.into());
        self
    }

    pub fn with_attr(&self, path: impl Into<PathBuf>, value: &str) -> &Self {
        self.attrs.lock().insert(path.into(), value.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.journal.lock().clone()
    }

    pub fn calls_to(&self, program: &str, needle: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program && c.args.join(" ").contains(needle))
            .collect()
    }

    fn pick(&self, spec: &CommandSpec) -> Option<(Reply, Duration)> {
        let mut rules = self.rules.lock();
        let idx = rules.iter().rposition(|r| r.matches(spec))?;
        let picked = (rules[idx].reply.clone(), rules[idx].delay);
        if rules[idx].once {
            rules.remove(idx);
        }
        Some(picked)
    }
}

impl CommandRunner for ScriptedRunner {
    fn execute(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        let started = Instant::now();
        let picked = self.pick(spec);
        let result = match picked {
            None => Err(io::Error::new(ErrorKind::NotFound, spec.program.clone())),
            Some((_, delay)) if delay > spec.timeout => {
                thread::sleep(spec.timeout);
                Err(io::Error::new(ErrorKind::TimedOut, spec.program.clone()))
            }
            Some((reply, delay)) => {
                thread::sleep(delay);
                match reply {
                    Reply::Ok(stdout) => Ok(CommandOutput {
                        status: Some(0),
                        stdout,
                        stderr: String::new(),
                    }),
                    Reply::Fail { status, stderr } => Ok(CommandOutput {
                        status: Some(status),
                        stdout: String::new(),
                        stderr,
                    }),
                    Reply::Io(kind) => Err(io::Error::new(kind, spec.program.clone())),
                    Reply::Panic(msg) => panic!("{msg}"),
                }
            }
        };
        self.journal.lock().push(Call {
            program: spec.program.clone(),
            args: spec.args.clone(),
            started,
            finished: Instant::now(),
        });
        result
    }

    fn read_attr(&self, path: &Path) -> io::Result<String> {
        self.attrs
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, path.display().to_string()))
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        self.read_attr(path).map(|s| PathBuf::from(s.trim()))
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.paths.lock().contains(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.paths.lock().insert(path.to_path_buf());
        Ok(())
    }
}

pub(crate) fn nvme_list_json(namespaces: &[&str]) -> String {
    let devices: Vec<String> = namespaces
        .iter()
        .map(|ns| format!(r#"{{"DevicePath":"{ns}","ModelNumber":"QA Model"}}"#))
        .collect();
    format!(r#"{{"Devices":[{}]}}"#, devices.join(","))
}

pub(crate) fn smart_json(temp_kelvin: u32) -> String {
    format!(
        r#"{{"critical_warning":0,"temperature":{temp_kelvin},"avail_spare":100,"percent_used":2,"media_errors":0}}"#
    )
}

/// Two status reports followed by the whole-run one.
pub(crate) fn fio_json(iops: f64) -> String {
    let report = |scale: f64| {
        format!(
            r#"{{"jobs":[{{"jobname":"t","read":{{"iops":{},"clat_ns":{{"mean":80000.0}}}},"write":{{"iops":0,"clat_ns":{{"mean":0}}}}}}]}}"#,
            iops * scale
        )
    };
    format!("{}\n{}\n{}\n", report(0.9), report(1.0), report(1.1))
}

pub(crate) const ID_CTRL_JSON: &str = r#"{"mn":"QA Model","sn":"SN0001","fr":"FW1.0"}"#;
pub(crate) const SENSORS_JSON: &str = r#"{"coretemp-isa-0000":{"Package id 0":{"temp1_input":51.0}}}"#;
pub(crate) const TURBOSTAT_TXT: &str = "Avg_MHz\tBusy%\tPkgWatt\n900\t12.5\t15.25\n";
pub(crate) const POWER_STATE_TXT: &str = "get-feature:0x02 (Power Management), Current value:00000000\n\tPower State   (PS): 0";

/// Runner that answers every oracle successfully for `namespaces`.
pub(crate) fn healthy_runner(namespaces: &[&str]) -> ScriptedRunner {
    let r = ScriptedRunner::new();
    r.on("nvme", &["list", "-o", "json"], Reply::ok(nvme_list_json(namespaces)))
        .on("nvme", &["id-ctrl"], Reply::ok(ID_CTRL_JSON))
        .on("nvme", &["smart-log"], Reply::ok(smart_json(313)))
        .on("nvme", &["get-feature"], Reply::ok(POWER_STATE_TXT))
        .on("nvme", &["telemetry-log"], Reply::ok(r#"{"telemetry":"ok"}"#))
        .on_delayed("fio", &[], Reply::ok(fio_json(1000.0)), Duration::from_millis(150))
        .on("sensors", &["-j"], Reply::ok(SENSORS_JSON))
        .on("turbostat", &[], Reply::ok(TURBOSTAT_TXT));
    for ns in namespaces {
        r.with_path(*ns);
    }
    r
}

/// Short windows so scenarios finish in well under a second.
pub(crate) fn fast_config() -> Config {
    let mut cfg = Config::default();
    cfg.smart.duration = 0.2;
    cfg.smart.interval = 0.1;
    cfg.fio.runtime = 0.2;
    cfg.fio.workloads = vec![crate::config::WorkloadSpec::pattern("randread")];
    cfg.telemetry.sensors_interval = 0.05;
    cfg.telemetry.turbostat_interval = 0.05;
    cfg.telemetry.power_state_interval = 0.05;
    cfg.format.wait_after = 0.0;
    cfg.sanitize.interval = 0.02;
    cfg.sanitize.timeout = 1.0;
    cfg.tools.command_timeout = 5.0;
    cfg.tools.workload_grace = 5.0;
    cfg.tools.use_sudo = false;
    cfg
}
