//! src/main.rs

use std::panic;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use nvme_qa::error::panic_message;
use nvme_qa::logging::{self, current_timestamp, RunLog};
use nvme_qa::topology::{Namespace, Topology};
use nvme_qa::{Config, Engine, EngineError, Report, RunObserver, StopSignal};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Provision, test and report every selected namespace.
    Run {
        /// JSON or YAML config; built-in defaults when omitted.
        #[clap(long)]
        config: Option<PathBuf>,
        #[clap(long)]
        output_dir: Option<PathBuf>,
        #[clap(short, long)]
        verbose: bool,
    },
    /// Print a plain-text digest of a persisted report.
    Summary { report: PathBuf },
    /// Write the health and performance series of a persisted report as CSV.
    Export {
        report: PathBuf,
        /// Defaults to the report's directory.
        #[clap(long)]
        output_dir: Option<PathBuf>,
    },
}

/// Progress bar over namespaces.
struct ProgressObserver {
    bar: ProgressBar,
    log: RunLog,
}

impl ProgressObserver {
    fn new(log: RunLog) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} namespaces {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        ProgressObserver { bar, log }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
        self.log.detach();
    }
}

impl RunObserver for ProgressObserver {
    fn resolved(&self, topology: &Topology) {
        self.bar.set_length(topology.namespace_count() as u64);
        self.bar.enable_steady_tick(Duration::from_millis(250));
        self.log.attach(self.bar.clone());
    }

    fn namespace_started(&self, ns: &Namespace) {
        self.bar.set_message(ns.path.clone());
    }

    fn namespace_finished(&self, ns: &Namespace, clean: bool) {
        if !clean {
            log::warn!("{}: finished with diagnostics", ns.path);
        }
        self.bar.inc(1);
    }
}

fn setup_signal_handler(stop: StopSignal) {
    let installed = ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C; stopping sampling and tearing down...");
        stop.stop();
    });
    if let Err(e) = installed {
        log::warn!("could not install Ctrl+C handler: {e}");
    }
}

fn main() {
    let main_result = panic::catch_unwind(main_logic);
    let exit_code = match main_result {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            log::error!("{e}");
            eprintln!("[{}] nvme-qa failed: {e}", current_timestamp());
            1
        }
        Err(payload) => {
            eprintln!(
                "[{}] A critical error occurred: nvme-qa panicked!\nPanic message: {}",
                current_timestamp(),
                panic_message(payload.as_ref())
            );
            101
        }
    };
    std::process::exit(exit_code);
}

fn main_logic() -> Result<(), EngineError> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            output_dir,
            verbose,
        } => {
            let mut cfg = Config::load(config.as_deref())?;
            if let Some(dir) = output_dir {
                cfg.output_dir = dir;
            }
            let run_log = logging::init(Some(cfg.output_dir.as_path()), verbose);
            log::info!("Starting nvme-qa {}", env!("CARGO_PKG_VERSION"));
            log::debug!("CLI config: {:?}", config);
            if let Some(p) = run_log.path() {
                log::info!("run log: {}", p.display());
            }

            let engine = Engine::on_host(cfg)?;
            setup_signal_handler(engine.stop_signal());
            let observer = ProgressObserver::new(run_log);
            let result = engine.run_to_disk(&observer);
            observer.finish();
            let (report, path) = result?;
            log::info!(
                "tested {} namespace(s) on {} controller(s)",
                report.namespaces().count(),
                report.controllers.len()
            );
            println!("{}", path.display());
        }
        Commands::Summary { report } => {
            logging::init(None, false);
            let report = Report::load(&report)?;
            print!("{}", report.summary());
        }
        Commands::Export { report, output_dir } => {
            logging::init(None, false);
            let dir = output_dir
                .or_else(|| report.parent().filter(|p| !p.as_os_str().is_empty()).map(|p| p.to_path_buf()))
                .unwrap_or_else(|| PathBuf::from("."));
            for path in Report::load(&report)?.export_csv(&dir)? {
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}
