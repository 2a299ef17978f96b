//! Run log: `env_logger` lines go to stderr and to `nvme_qa.log` in the
//! output directory. While a progress bar is attached, stderr writes are
//! made with the bar suspended so the two do not interleave.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use env_logger::{Builder, Env, Target, WriteStyle};
use indicatif::ProgressBar;
use parking_lot::Mutex;

pub const LOG_FILE: &str = "nvme_qa.log";

pub fn current_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Handle on the installed logger.
#[derive(Clone, Default)]
pub struct RunLog {
    path: Option<PathBuf>,
    bar: Arc<Mutex<Option<ProgressBar>>>,
}

impl RunLog {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn attach(&self, bar: ProgressBar) {
        *self.bar.lock() = Some(bar);
    }

    pub fn detach(&self) {
        *self.bar.lock() = None;
    }
}

struct Tee {
    file: Option<Arc<Mutex<File>>>,
    bar: Arc<Mutex<Option<ProgressBar>>>,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &*self.bar.lock() {
            Some(pb) => pb.suspend(|| io::stderr().write_all(buf))?,
            None => io::stderr().write_all(buf)?,
        }
        if let Some(f) = &self.file {
            let mut guard = f.lock();
            let _ = guard.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(f) = &self.file {
            let _ = f.lock().flush();
        }
        io::stderr().flush()
    }
}

fn open_log_file(dir: &Path) -> io::Result<(PathBuf, File)> {
    fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, file))
}

/// Install the global logger. `RUST_LOG` wins over `verbose`. Without
/// `log_dir`, or when the file cannot be opened, lines go to stderr only.
pub fn init(log_dir: Option<&Path>, verbose: bool) -> RunLog {
    let mut handle = RunLog::default();
    let file = match log_dir.map(open_log_file) {
        Some(Ok((path, file))) => {
            handle.path = Some(path);
            Some(Arc::new(Mutex::new(file)))
        }
        Some(Err(e)) => {
            eprintln!(
                "[{}] Failed to open log file in {}: {e}. Further logs will only go to stderr.",
                current_timestamp(),
                log_dir.map(Path::display).map(|d| d.to_string()).unwrap_or_default()
            );
            None
        }
        None => None,
    };

    let tee = Tee {
        file,
        bar: handle.bar.clone(),
    };
    let default_level = if verbose { "debug" } else { "info" };
    let installed = Builder::from_env(Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {:<5} {}",
                current_timestamp(),
                record.level(),
                record.args()
            )
        })
        .write_style(WriteStyle::Never)
        .target(Target::Pipe(Box::new(tee)))
        .try_init();
    if let Err(e) = installed {
        eprintln!("[{}] logger already installed: {e}", current_timestamp());
    }
    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tee_appends_to_the_run_log() {
        let dir = tempfile::tempdir().unwrap();
        let (path, file) = open_log_file(&dir.path().join("logs")).unwrap();
        assert!(path.ends_with(LOG_FILE));
        let mut tee = Tee {
            file: Some(Arc::new(Mutex::new(file))),
            bar: Arc::new(Mutex::new(Some(ProgressBar::hidden()))),
        };
        tee.write_all(b"[2024-01-01 00:00:00] INFO  first\n").unwrap();
        tee.write_all(b"second\n").unwrap();
        tee.flush().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().collect::<Vec<_>>(), vec!["[2024-01-01 00:00:00] INFO  first", "second"]);
    }

    #[test]
    fn timestamp_shape() {
        let ts = current_timestamp();
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], " ");
    }
}
