//! Pre-test provisioning and teardown.
//!
//! Actions run in a fixed order: write protect, sanitize (controller wide),
//! format, filesystem create, mount. Unmount is the only teardown action and
//! only follows a successful mount. Every failure is recorded on the action
//! log; nothing here aborts the run.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use crate::config::{secs, Config};
use crate::error::{Diagnostic, FaultKind, ToolError};
use crate::path_utils::mountpoint_for;
use crate::sampling::StopSignal;
use crate::tools::nvme::{self, SanitizeStatus};
use crate::tools::{fs, Toolbox};
use crate::topology::Namespace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionAction {
    WriteProtect,
    Sanitize,
    Format,
    /// Controller-scoped retry of a rejected namespace format.
    FormatFallback,
    FilesystemCreate,
    Mount,
    Unmount,
}

impl ProvisionAction {
    fn stage(self) -> u8 {
        match self {
            ProvisionAction::WriteProtect => 0,
            ProvisionAction::Sanitize => 1,
            ProvisionAction::Format | ProvisionAction::FormatFallback => 2,
            ProvisionAction::FilesystemCreate => 3,
            ProvisionAction::Mount => 4,
            ProvisionAction::Unmount => 5,
        }
    }
}

impl fmt::Display for ProvisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionAction::WriteProtect => "write-protect",
            ProvisionAction::Sanitize => "sanitize",
            ProvisionAction::Format => "format",
            ProvisionAction::FormatFallback => "format-fallback",
            ProvisionAction::FilesystemCreate => "mkfs",
            ProvisionAction::Mount => "mount",
            ProvisionAction::Unmount => "unmount",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceState {
    Untouched,
    WriteProtected,
    Sanitized,
    Formatted,
    FilesystemReady,
    Mounted,
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    Skipped,
    Failed,
    Unsupported,
    TimedOut,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: ProvisionAction,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ActionOutcome,
    pub output: String,
    pub fault: Option<Diagnostic>,
}

impl ActionRecord {
    fn from_result(
        action: ProvisionAction,
        target: &str,
        started_at: DateTime<Utc>,
        result: Result<String, ToolError>,
    ) -> ActionRecord {
        let (outcome, output, fault) = match result {
            Ok(out) => (ActionOutcome::Applied, out, None),
            Err(e) => {
                let outcome = match e.kind() {
                    FaultKind::Unsupported => ActionOutcome::Unsupported,
                    FaultKind::Timeout => ActionOutcome::TimedOut,
                    _ => ActionOutcome::Failed,
                };
                let raw = e.raw_output().unwrap_or_default().to_string();
                (outcome, raw, Some(Diagnostic::from_tool(target, &e)))
            }
        };
        let rec = ActionRecord {
            action,
            target: target.to_string(),
            started_at,
            finished_at: Utc::now(),
            outcome,
            output,
            fault,
        };
        match &rec.fault {
            None => log::info!("{target}: {action} applied"),
            Some(d) => log::warn!("{target}: {action} {:?}: {}", rec.outcome, d.message),
        }
        rec
    }

    fn run(
        action: ProvisionAction,
        target: &str,
        call: impl FnOnce() -> Result<String, ToolError>,
    ) -> ActionRecord {
        let started_at = Utc::now();
        ActionRecord::from_result(action, target, started_at, call())
    }

    fn note(
        action: ProvisionAction,
        target: &str,
        outcome: ActionOutcome,
        output: impl Into<String>,
    ) -> ActionRecord {
        let now = Utc::now();
        ActionRecord {
            action,
            target: target.to_string(),
            started_at: now,
            finished_at: now,
            outcome,
            output: output.into(),
            fault: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == ActionOutcome::Applied
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProvisionError {
    #[error("{action} cannot follow {after}")]
    OutOfOrder {
        action: ProvisionAction,
        after: ProvisionAction,
    },
    #[error("unmount without a successful mount")]
    NotMounted,
}

/// Provisioning state and action log of one namespace.
#[derive(Debug, Clone)]
pub struct Provisioning {
    pub namespace: Namespace,
    pub state: NamespaceState,
    pub log: Vec<ActionRecord>,
    pub mountpoint: Option<PathBuf>,
    last: Option<ProvisionAction>,
}

impl Provisioning {
    pub fn new(namespace: Namespace) -> Self {
        Provisioning {
            namespace,
            state: NamespaceState::Untouched,
            log: Vec::new(),
            mountpoint: None,
            last: None,
        }
    }

    /// Refuses anything that would break the action order.
    pub fn check(&self, action: ProvisionAction) -> Result<(), ProvisionError> {
        if action == ProvisionAction::Unmount {
            return if self.state == NamespaceState::Mounted {
                Ok(())
            } else {
                Err(ProvisionError::NotMounted)
            };
        }
        if let Some(after) = self.last {
            let fallback_after_format =
                action == ProvisionAction::FormatFallback && after == ProvisionAction::Format;
            if action.stage() <= after.stage() && !fallback_after_format {
                return Err(ProvisionError::OutOfOrder { action, after });
            }
        }
        Ok(())
    }

    fn advance(&mut self, action: ProvisionAction, applied: bool) {
        self.last = Some(action);
        if !applied {
            return;
        }
        self.state = match action {
            ProvisionAction::WriteProtect => NamespaceState::WriteProtected,
            ProvisionAction::Sanitize => NamespaceState::Sanitized,
            ProvisionAction::Format | ProvisionAction::FormatFallback => NamespaceState::Formatted,
            ProvisionAction::FilesystemCreate => NamespaceState::FilesystemReady,
            ProvisionAction::Mount => NamespaceState::Mounted,
            ProvisionAction::Unmount => NamespaceState::TornDown,
        };
    }

    pub fn apply(&mut self, record: ActionRecord) -> Result<(), ProvisionError> {
        self.check(record.action)?;
        self.advance(record.action, record.succeeded());
        self.log.push(record);
        Ok(())
    }

    /// Account for the controller-wide sanitize without copying its record
    /// into this namespace's log.
    pub fn observe_sanitize(&mut self, record: &ActionRecord) -> Result<(), ProvisionError> {
        self.check(ProvisionAction::Sanitize)?;
        self.advance(ProvisionAction::Sanitize, record.succeeded());
        Ok(())
    }

    pub fn last_succeeded(&self, action: ProvisionAction) -> bool {
        self.log
            .iter()
            .rev()
            .find(|r| r.action == action)
            .is_some_and(ActionRecord::succeeded)
    }
}

/// Per-controller coordination: sanitize takes the write side and runs once,
/// namespace actions take the read side. A caller must not hold a read guard
/// while asking for the sanitize.
#[derive(Debug, Default)]
pub struct ControllerGate {
    lock: RwLock<()>,
    sanitize: OnceCell<ActionRecord>,
}

impl ControllerGate {
    pub fn new() -> Self {
        ControllerGate::default()
    }

    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    pub fn sanitize_once(&self, run: impl FnOnce() -> ActionRecord) -> &ActionRecord {
        self.sanitize.get_or_init(|| {
            let _exclusive = self.lock.write();
            run()
        })
    }

    pub fn sanitize_record(&self) -> Option<&ActionRecord> {
        self.sanitize.get()
    }
}

pub struct Provisioner<'a> {
    tools: &'a Toolbox,
    cfg: &'a Config,
    stop: &'a StopSignal,
}

impl<'a> Provisioner<'a> {
    pub fn new(tools: &'a Toolbox, cfg: &'a Config, stop: &'a StopSignal) -> Self {
        Provisioner { tools, cfg, stop }
    }

    /// Apply every enabled action to `ns`.
    pub fn provision(&self, ns: &Namespace, gate: &ControllerGate) -> Provisioning {
        let mut p = Provisioning::new(ns.clone());
        let ctrl = ns.id.controller.as_str();
        let nsid = ns.id.nsid;

        if self.cfg.write_protect.enabled && !self.stop.is_stopped() {
            let _shared = gate.shared();
            let value = self.cfg.write_protect.value;
            self.record(
                &mut p,
                ActionRecord::run(ProvisionAction::WriteProtect, &ns.path, || {
                    nvme::set_write_protect(self.tools, ctrl, nsid, value)
                }),
            );
        }

        if self.cfg.sanitize.enabled && !self.stop.is_stopped() {
            let record = gate.sanitize_once(|| self.sanitize_controller(ctrl));
            if let Err(e) = p.observe_sanitize(record) {
                log::error!("{}: {e}", ns.path);
            }
        }

        if self.cfg.format.enabled && !self.stop.is_stopped() {
            let fmt = &self.cfg.format;
            {
                let _shared = gate.shared();
                let first = ActionRecord::run(ProvisionAction::Format, &ns.path, || {
                    nvme::format_namespace(self.tools, &ns.path, fmt.lbaf, fmt.ses)
                });
                let rejected = !first.succeeded();
                self.record(&mut p, first);
                if rejected {
                    let target = format!("{ctrl} -n {nsid}");
                    self.record(
                        &mut p,
                        ActionRecord::run(ProvisionAction::FormatFallback, &target, || {
                            nvme::format_by_nsid(self.tools, ctrl, nsid, fmt.lbaf, fmt.ses)
                        }),
                    );
                }
            }
            if fmt.wait_after > 0.0 {
                self.stop.wait(secs(fmt.wait_after));
            }
        }

        let fs_cfg = &self.cfg.filesystem;
        if fs_cfg.create && !self.stop.is_stopped() {
            let _shared = gate.shared();
            self.record(
                &mut p,
                ActionRecord::run(ProvisionAction::FilesystemCreate, &ns.path, || {
                    fs::mkfs(self.tools, &fs_cfg.fs_type, &fs_cfg.mkfs_options, &ns.path)
                }),
            );
        }

        if fs_cfg.mount && !self.stop.is_stopped() {
            let _shared = gate.shared();
            let record = if p.last_succeeded(ProvisionAction::FilesystemCreate) {
                self.mount(ns)
            } else {
                ActionRecord::note(
                    ProvisionAction::Mount,
                    &ns.path,
                    ActionOutcome::Skipped,
                    "no filesystem was created",
                )
            };
            let mountpoint = record.succeeded().then(|| mountpoint_for(&fs_cfg.mount_base, &ns.path));
            self.record(&mut p, record);
            p.mountpoint = mountpoint;
        }
        p
    }

    fn mount(&self, ns: &Namespace) -> ActionRecord {
        let fs_cfg = &self.cfg.filesystem;
        let mountpoint = mountpoint_for(&fs_cfg.mount_base, &ns.path);
        ActionRecord::run(ProvisionAction::Mount, &ns.path, || {
            self.tools
                .runner()
                .create_dir_all(&mountpoint)
                .map_err(|e| ToolError::Path(format!("{}: {e}", mountpoint.display())))?;
            fs::mount(self.tools, &ns.path, &mountpoint, &fs_cfg.mount_options)
        })
    }

    fn record(&self, p: &mut Provisioning, record: ActionRecord) {
        if let Err(e) = p.apply(record) {
            log::error!("{}: {e}", p.namespace.path);
        }
    }

    /// Issue the sanitize and wait for the device to report an end state.
    pub fn sanitize_controller(&self, ctrl: &str) -> ActionRecord {
        let cfg = &self.cfg.sanitize;
        let Some(sanact) = cfg.action.sanact() else {
            return ActionRecord::note(
                ProvisionAction::Sanitize,
                ctrl,
                ActionOutcome::Skipped,
                "sanitize action is none",
            );
        };
        let started_at = Utc::now();
        let owpass = (cfg.action == crate::config::SanitizeAction::Overwrite).then_some(cfg.owpass);
        log::info!("{ctrl}: sanitize sanact={sanact} started");
        let issued = match nvme::sanitize(self.tools, ctrl, sanact, cfg.ause, owpass) {
            Ok(out) => out,
            Err(e) => return ActionRecord::from_result(ProvisionAction::Sanitize, ctrl, started_at, Err(e)),
        };

        let interval = secs(cfg.interval);
        let deadline = std::time::Instant::now() + secs(cfg.timeout);
        let mut seen_running = false;
        let mut last = None;
        let (outcome, note) = loop {
            // The device may not have posted InProgress yet right after the command returns.
            if self.stop.wait(interval) {
                break (ActionOutcome::Interrupted, "stopped while polling".to_string());
            }
            match nvme::sanitize_log(self.tools, ctrl) {
                Ok(progress)
                    if progress.status.is_terminal()
                        || (seen_running && progress.status == SanitizeStatus::Idle) =>
                {
                    let outcome = if progress.status == SanitizeStatus::Failed {
                        ActionOutcome::Failed
                    } else {
                        ActionOutcome::Applied
                    };
                    break (outcome, format!("status {:?}", progress.status));
                }
                Ok(progress) => {
                    if progress.status == SanitizeStatus::InProgress {
                        seen_running = true;
                        if let Some(f) = progress.fraction {
                            log::debug!("{ctrl}: sanitize {:.0}%", f * 100.0);
                        }
                    }
                    last = Some(progress.status);
                }
                Err(e) => {
                    log::warn!("{ctrl}: sanitize status unavailable: {e}");
                    break (
                        ActionOutcome::Applied,
                        format!("completion not verifiable: {e}"),
                    );
                }
            }
            if std::time::Instant::now() >= deadline {
                if seen_running {
                    break (ActionOutcome::TimedOut, format!("no completion after {}s", cfg.timeout));
                }
                break (
                    ActionOutcome::Applied,
                    format!(
                        "completion not verifiable: status {:?} after {}s",
                        last.unwrap_or(SanitizeStatus::Unknown),
                        cfg.timeout
                    ),
                );
            }
        };

        let fault = match outcome {
            ActionOutcome::Failed => Some(Diagnostic::new(ctrl, FaultKind::ToolFailed, note.clone())),
            ActionOutcome::TimedOut => Some(Diagnostic::new(ctrl, FaultKind::Timeout, note.clone())),
            _ => None,
        };
        log::info!("{ctrl}: sanitize finished: {outcome:?} ({note})");
        ActionRecord {
            action: ProvisionAction::Sanitize,
            target: ctrl.to_string(),
            started_at,
            finished_at: Utc::now(),
            outcome,
            output: format!("{}\n{note}", issued.trim()).trim().to_string(),
            fault,
        }
    }

    /// Unmount when, and only when, the mount succeeded.
    pub fn teardown(&self, p: &mut Provisioning) {
        if p.check(ProvisionAction::Unmount).is_err() {
            return;
        }
        let Some(mountpoint) = p.mountpoint.clone() else {
            return;
        };
        let record = ActionRecord::run(ProvisionAction::Unmount, &p.namespace.path, || {
            fs::umount(self.tools, &mountpoint)
        });
        self.record(p, record);
    }
}
