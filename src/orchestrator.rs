//! Concurrent test orchestration.
//!
//! Two fan-outs. Per namespace, the health monitor and every workload start
//! together behind a barrier and are joined before the result is final. Per
//! workload, fio runs next to its telemetry samplers (see `workload`).
//! Namespaces themselves are drained from a work queue by a pool of workers;
//! a panic anywhere below a namespace becomes a diagnostic on that namespace.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Barrier;
use std::thread;

use chrono::{DateTime, Utc};
use crossbeam_channel::unbounded;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::{secs, Config};
use crate::error::{panic_message, Diagnostic, FaultKind};
use crate::health::{monitor_health, HealthTimeline};
use crate::provision::{ControllerGate, Provisioner, Provisioning};
use crate::sampling::{Pacing, StopSignal};
use crate::tools::Toolbox;
use crate::topology::{Namespace, NamespaceId, Topology};
use crate::workload::{run_workload, WorkloadRun};

/// Health timeline and workload runs of one namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceResult {
    pub health: HealthTimeline,
    pub workloads: Vec<WorkloadRun>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl NamespaceResult {
    pub fn failed(diagnostic: Diagnostic) -> Self {
        NamespaceResult {
            diagnostics: vec![diagnostic],
            ..NamespaceResult::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty() && self.workloads.iter().all(WorkloadRun::succeeded)
    }
}

/// Progress hooks for a caller that wants to show the run as it goes.
pub trait RunObserver: Send + Sync {
    fn resolved(&self, _topology: &Topology) {}
    fn namespace_started(&self, _ns: &Namespace) {}
    fn namespace_finished(&self, _ns: &Namespace, _clean: bool) {}
}

pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Health monitoring and all workloads of one namespace, concurrently.
pub fn test_namespace(
    tools: &Toolbox,
    cfg: &Config,
    ns: &Namespace,
    mountpoint: Option<&Path>,
    stop: &StopSignal,
) -> NamespaceResult {
    let workloads = cfg.workloads();
    let barrier = Barrier::new(workloads.len() + 1);
    let pacing = Pacing::new(secs(cfg.smart.duration), secs(cfg.smart.interval));
    log::info!(
        "{}: testing with {} workload(s): {}",
        ns.path,
        workloads.len(),
        workloads.iter().map(|w| w.pattern.as_str()).collect::<Vec<_>>().join(", ")
    );

    thread::scope(|s| {
        let barrier = &barrier;
        let health = s.spawn(move || {
            barrier.wait();
            monitor_health(tools, &ns.path, pacing, stop)
        });
        let branches: Vec<_> = workloads
            .iter()
            .map(|w| {
                let handle = s.spawn(move || {
                    barrier.wait();
                    run_workload(tools, cfg, ns, mountpoint, w, stop)
                });
                (w, handle)
            })
            .collect();

        let mut result = NamespaceResult::default();
        result.health = health.join().unwrap_or_else(|p| {
            let msg = format!("health monitor panicked: {}", panic_message(p.as_ref()));
            log::error!("{}: {msg}", ns.path);
            HealthTimeline {
                samples: Vec::new(),
                diagnostics: vec![Diagnostic::new(&ns.path, FaultKind::Panicked, msg)],
            }
        });
        for (w, handle) in branches {
            let run = handle.join().unwrap_or_else(|p| {
                let msg = format!("workload {} panicked: {}", w.pattern, panic_message(p.as_ref()));
                log::error!("{}: {msg}", ns.path);
                WorkloadRun::failed(&w.pattern, Diagnostic::new(&ns.path, FaultKind::Panicked, msg))
            });
            result.workloads.push(run);
        }
        result
    })
}

/// Everything that happened to one namespace.
#[derive(Debug, Clone)]
pub struct NamespaceOutcome {
    pub provisioning: Provisioning,
    pub result: NamespaceResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

fn guarded<T>(scope: &str, stage: &str, f: impl FnOnce() -> T) -> Result<T, Diagnostic> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|p| {
        let msg = format!("{stage} panicked: {}", panic_message(p.as_ref()));
        log::error!("{scope}: {msg}");
        Diagnostic::new(scope, FaultKind::Panicked, msg)
    })
}

/// Provision, test and tear down one namespace. Never panics.
pub fn process_namespace(
    tools: &Toolbox,
    cfg: &Config,
    ns: &Namespace,
    gate: &ControllerGate,
    stop: &StopSignal,
) -> NamespaceOutcome {
    let started_at = Utc::now();
    let provisioner = Provisioner::new(tools, cfg, stop);

    let (mut provisioning, mut early) = match guarded(&ns.path, "provisioning", || provisioner.provision(ns, gate)) {
        Ok(p) => (p, Vec::new()),
        Err(d) => (Provisioning::new(ns.clone()), vec![d]),
    };

    let mut result = if stop.is_stopped() {
        NamespaceResult::failed(Diagnostic::new(
            &ns.path,
            FaultKind::Interrupted,
            "run stopped before testing",
        ))
    } else {
        let mountpoint = provisioning.mountpoint.clone();
        guarded(&ns.path, "testing", || {
            test_namespace(tools, cfg, ns, mountpoint.as_deref(), stop)
        })
        .unwrap_or_else(NamespaceResult::failed)
    };

    if let Err(d) = guarded(&ns.path, "teardown", || provisioner.teardown(&mut provisioning)) {
        early.push(d);
    }
    early.append(&mut result.diagnostics);
    result.diagnostics = early;

    NamespaceOutcome {
        provisioning,
        result,
        started_at,
        finished_at: Utc::now(),
    }
}

/// Test every namespace of `topology` on a bounded worker pool.
pub fn run_pool(
    tools: &Toolbox,
    cfg: &Config,
    topology: &Topology,
    stop: &StopSignal,
    observer: &dyn RunObserver,
) -> (DashMap<NamespaceId, NamespaceOutcome>, HashMap<String, ControllerGate>) {
    let gates: HashMap<String, ControllerGate> = topology
        .controllers
        .iter()
        .map(|c| (c.controller.path.clone(), ControllerGate::new()))
        .collect();
    let outcomes = DashMap::new();

    let jobs: Vec<&Namespace> = topology.controllers.iter().flat_map(|c| &c.namespaces).collect();
    if jobs.is_empty() {
        return (outcomes, gates);
    }
    let workers = match cfg.concurrency.max_namespaces {
        0 => jobs.len(),
        n => n.min(jobs.len()),
    };
    log::info!("testing {} namespace(s) on {} worker(s)", jobs.len(), workers);

    let (tx, rx) = unbounded();
    for ns in jobs {
        // The receiver is alive, so this cannot fail.
        let _ = tx.send(ns);
    }
    drop(tx);

    thread::scope(|s| {
        for _ in 0..workers {
            let rx = rx.clone();
            let (gates, outcomes) = (&gates, &outcomes);
            s.spawn(move || {
                while let Ok(ns) = rx.recv() {
                    observer.namespace_started(ns);
                    let outcome = match gates.get(&ns.id.controller) {
                        Some(gate) => process_namespace(tools, cfg, ns, gate, stop),
                        None => process_namespace(tools, cfg, ns, &ControllerGate::new(), stop),
                    };
                    observer.namespace_finished(ns, outcome.result.is_clean());
                    outcomes.insert(ns.id.clone(), outcome);
                }
            });
        }
    });
    (outcomes, gates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkloadSpec;
    use crate::testutil::{fast_config, healthy_runner, Reply, ScriptedRunner};
    use crate::topology::{resolve, Confidence};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn ns(path: &str) -> Namespace {
        let (c, n) = crate::path_utils::split_namespace(path).unwrap();
        Namespace {
            id: NamespaceId {
                controller: c.into(),
                nsid: n,
            },
            path: path.into(),
            confidence: Confidence::Discovered,
        }
    }

    fn setup(r: ScriptedRunner) -> (Toolbox, Arc<ScriptedRunner>) {
        let r = Arc::new(r);
        (Toolbox::new(r.clone(), &fast_config().tools), r)
    }

    #[test]
    fn workloads_start_together() {
        let (tools, runner) = setup(healthy_runner(&["/dev/nvme0n1"]));
        let mut cfg = fast_config();
        cfg.fio.workloads = ["randread", "randwrite", "read", "write"]
            .iter()
            .map(|p| WorkloadSpec::pattern(p))
            .collect();
        let result = test_namespace(&tools, &cfg, &ns("/dev/nvme0n1"), None, &StopSignal::new());
        assert_eq!(result.workloads.len(), 4);
        assert!(result.is_clean(), "{:?}", result.diagnostics);

        let fio = runner.calls_to("fio", "");
        assert_eq!(fio.len(), 4);
        let first = fio.iter().map(|c| c.started).min().unwrap();
        let last = fio.iter().map(|c| c.started).max().unwrap();
        let first_done = fio.iter().map(|c| c.finished).min().unwrap();
        assert!(last.duration_since(first) < Duration::from_millis(100));
        assert!(
            last < first_done,
            "fio runs did not overlap: {:?}",
            fio.iter().map(|c| c.line()).collect::<Vec<_>>()
        );
        assert_eq!(result.health.len(), 2);
    }

    #[test]
    fn panicking_workload_is_isolated() {
        let r = healthy_runner(&["/dev/nvme0n1"]);
        r.on("fio", &["--rw=write"], Reply::Panic("fio adapter blew up"));
        let (tools, _) = setup(r);
        let mut cfg = fast_config();
        cfg.fio.workloads = vec![WorkloadSpec::pattern("read"), WorkloadSpec::pattern("write")];
        let result = test_namespace(&tools, &cfg, &ns("/dev/nvme0n1"), None, &StopSignal::new());
        assert!(result.workloads[0].succeeded());
        let err = result.workloads[1].error.as_ref().unwrap();
        assert_eq!(err.kind, FaultKind::Panicked);
        assert!(err.message.contains("blew up"));
        assert!(!result.health.is_empty());
    }

    struct Counting(AtomicUsize, AtomicUsize);

    impl RunObserver for Counting {
        fn namespace_started(&self, _ns: &Namespace) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn namespace_finished(&self, _ns: &Namespace, _clean: bool) {
            self.1.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn pool_covers_every_namespace_and_isolates_failures() {
        let r = healthy_runner(&["/dev/nvme0n1", "/dev/nvme0n2", "/dev/nvme1n1"]);
        r.on("nvme", &["smart-log", "/dev/nvme1n1"], Reply::Panic("smart parser exploded"));
        let (tools, _) = setup(r);
        let mut cfg = fast_config();
        cfg.concurrency.max_namespaces = 2;
        let topo = resolve(&tools, &cfg).unwrap();
        let obs = Counting(AtomicUsize::new(0), AtomicUsize::new(0));
        let (outcomes, _) = run_pool(&tools, &cfg, &topo, &StopSignal::new(), &obs);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(obs.0.load(Ordering::SeqCst), 3);
        assert_eq!(obs.1.load(Ordering::SeqCst), 3);

        let bad = outcomes.get(&ns("/dev/nvme1n1").id).unwrap();
        assert_eq!(bad.result.health.diagnostics[0].kind, FaultKind::Panicked);
        assert!(bad.result.workloads.iter().all(WorkloadRun::succeeded));
        let good = outcomes.get(&ns("/dev/nvme0n2").id).unwrap();
        assert!(good.result.is_clean());
    }

    #[test]
    fn stopped_run_skips_testing_but_reports() {
        let (tools, runner) = setup(healthy_runner(&["/dev/nvme0n1"]));
        let cfg = fast_config();
        let stop = StopSignal::new();
        stop.stop();
        let out = process_namespace(&tools, &cfg, &ns("/dev/nvme0n1"), &ControllerGate::new(), &stop);
        assert_eq!(out.result.diagnostics[0].kind, FaultKind::Interrupted);
        assert!(runner.calls_to("fio", "").is_empty());
    }
}
