//! External command execution.
//!
//! Every measurement and provisioning tool is reached through
//! [`CommandRunner`], so tests can script the oracles and the engine never
//! talks to `std::process` directly.

use std::fs;
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ToolError;

const POLL_STEP: Duration = Duration::from_millis(20);

/// One invocation of an external program.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Needs root; run through `sudo -n` when the process is not root.
    pub privileged: bool,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            privileged: false,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for a in &self.args {
            line.push(' ');
            line.push_str(a);
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Access to the host: external programs plus the few filesystem reads the
/// engine needs (sysfs attributes, target pre-flight checks, mountpoints).
pub trait CommandRunner: Send + Sync {
    /// Run to completion or until `spec.timeout`. A missing program is
    /// `ErrorKind::NotFound`, a hang is `ErrorKind::TimedOut`.
    fn execute(&self, spec: &CommandSpec) -> io::Result<CommandOutput>;

    fn read_attr(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(path)
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }
}

/// Runs commands on this machine.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    use_sudo: bool,
}

impl SystemRunner {
    pub fn new(use_sudo: bool) -> Self {
        SystemRunner { use_sudo }
    }

    fn build(&self, spec: &CommandSpec) -> Command {
        if spec.privileged && self.use_sudo && !is_root() {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(&spec.program).args(&spec.args);
            cmd
        } else {
            let mut cmd = Command::new(&spec.program);
            cmd.args(&spec.args);
            cmd
        }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        SystemRunner::new(true)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut p) = pipe {
            let _ = p.read_to_end(&mut buf);
        }
        buf
    })
}

impl CommandRunner for SystemRunner {
    fn execute(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        let mut child = self
            .build(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        // Pipes are drained on their own threads so a chatty tool cannot
        // block on a full pipe while we wait on it.
        let out = drain(child.stdout.take());
        let err = drain(child.stderr.take());

        let deadline = Instant::now() + spec.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(
                    ErrorKind::TimedOut,
                    format!("{} did not finish", spec.program),
                ));
            }
            thread::sleep(POLL_STEP);
        };

        let stdout = out.join().unwrap_or_default();
        let stderr = err.join().unwrap_or_default();
        Ok(CommandOutput {
            status: status.code(),
            stdout: clean_output(&String::from_utf8_lossy(&stdout)),
            stderr: clean_output(&String::from_utf8_lossy(&stderr)),
        })
    }
}

pub fn is_root() -> bool {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            unsafe { libc::geteuid() == 0 }
        } else {
            false
        }
    }
}

static ANSI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1B\[[0-9;?]*[ -/]*[@-~]").expect("ANSI escape regex"));

/// Strip terminal noise some tools emit even when piped: ANSI escapes,
/// carriage-return progress rewrites, backspaces and NULs.
pub fn clean_output(raw: &str) -> String {
    let no_ansi = ANSI.replace_all(raw, "");
    let lines: Vec<&str> = no_ansi
        .lines()
        .map(|line| line.rsplit('\r').next().unwrap_or(line))
        .collect();
    let joined = lines.join("\n");
    let mut out = String::with_capacity(joined.len());
    for ch in joined.chars() {
        match ch {
            '\u{8}' => {
                out.pop();
            }
            '\0' => {}
            c => out.push(c),
        }
    }
    out.trim().to_string()
}

/// Run `spec` and return its stdout, classifying every failure.
pub fn run(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<String, ToolError> {
    let tool = spec.program.clone();
    log::debug!("exec: {}", spec.command_line());
    let output = match runner.execute(spec) {
        Ok(o) => o,
        Err(e) => {
            return Err(match e.kind() {
                ErrorKind::NotFound => ToolError::Unavailable { tool },
                ErrorKind::TimedOut => ToolError::Timeout {
                    tool,
                    secs: spec.timeout.as_secs_f64(),
                },
                ErrorKind::PermissionDenied => ToolError::PermissionDenied {
                    tool,
                    detail: e.to_string(),
                },
                _ => ToolError::Io(e),
            })
        }
    };
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(classify_failure(&tool, &output))
    }
}

fn classify_failure(tool: &str, output: &CommandOutput) -> ToolError {
    let detail = if output.stderr.trim().is_empty() {
        output.stdout.trim().to_string()
    } else {
        output.stderr.trim().to_string()
    };
    let lower = detail.to_ascii_lowercase();
    let tool = tool.to_string();

    if output.status == Some(127) || lower.contains("command not found") {
        return ToolError::Unavailable { tool };
    }
    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("a password is required")
        || lower.contains("must be root")
    {
        return ToolError::PermissionDenied { tool, detail };
    }
    if lower.contains("invalid field")
        || lower.contains("invalid command opcode")
        || lower.contains("not supported")
        || lower.contains("unsupported")
    {
        return ToolError::Unsupported { tool, detail };
    }
    ToolError::Failed {
        tool,
        status: output.status,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;

    struct Fixed(io::Result<CommandOutput>);

    impl CommandRunner for Fixed {
        fn execute(&self, _spec: &CommandSpec) -> io::Result<CommandOutput> {
            match &self.0 {
                Ok(o) => Ok(o.clone()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            }
        }
    }

    fn failing(status: i32, stderr: &str) -> Fixed {
        Fixed(Ok(CommandOutput {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }))
    }

    fn spec() -> CommandSpec {
        CommandSpec::new("nvme", Duration::from_secs(1)).arg("list")
    }

    #[test]
    fn classifies_failures() {
        let cases = [
            (failing(1, "sudo: a password is required"), FaultKind::PermissionDenied),
            (failing(1, "NVMe status: INVALID_FIELD: Invalid Field in Command"), FaultKind::Unsupported),
            (failing(127, "sh: nvme: not found"), FaultKind::ToolUnavailable),
            (failing(2, "No such device"), FaultKind::ToolFailed),
            (Fixed(Err(io::Error::new(ErrorKind::NotFound, "x"))), FaultKind::ToolUnavailable),
            (Fixed(Err(io::Error::new(ErrorKind::TimedOut, "x"))), FaultKind::Timeout),
        ];
        for (runner, kind) in cases {
            assert_eq!(run(&runner, &spec()).unwrap_err().kind(), kind);
        }
    }

    #[test]
    fn success_returns_stdout() {
        let runner = Fixed(Ok(CommandOutput {
            status: Some(0),
            stdout: "{}".into(),
            stderr: String::new(),
        }));
        assert_eq!(run(&runner, &spec()).unwrap(), "{}");
    }

    #[test]
    fn clean_output_strips_terminal_noise() {
        let raw = "\x1b[1mbold\x1b[0m\nprogress 10%\rprogress 100%\nab\u{8}c\0\n";
        assert_eq!(clean_output(raw), "bold\nprogress 100%\nac");
    }

    #[test]
    fn builder_collects_arguments() {
        let s = CommandSpec::new("fio", Duration::from_secs(5))
            .arg("--name=x")
            .args(["--rw=read", "--bs=4k"])
            .privileged();
        assert!(s.privileged);
        assert_eq!(s.command_line(), "fio --name=x --rw=read --bs=4k");
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_times_out_hung_tools() {
        let runner = SystemRunner::new(false);
        let spec = CommandSpec::new("sleep", Duration::from_millis(100)).arg("5");
        let err = runner.execute(&spec).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_reports_missing_program() {
        let runner = SystemRunner::new(false);
        let spec = CommandSpec::new("definitely-not-a-real-tool-xyz", Duration::from_secs(1));
        assert_eq!(run(&runner, &spec).unwrap_err().kind(), FaultKind::ToolUnavailable);
    }
}
