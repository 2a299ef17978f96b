//! Resolves the controllers and namespaces under test.
//!
//! Explicit lists win. Otherwise one enumeration snapshot is taken and both
//! levels are derived from it: controllers from the namespace paths it
//! reports, namespaces by parent controller. The same config and the same
//! snapshot always give the same ordered result.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigError, SelectionFilters};
use crate::error::{Diagnostic, FaultKind, ToolError};
use crate::path_utils::{basename, controller_of, natural_key, namespace_path, split_namespace};
use crate::tools::{nvme, Toolbox};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceId {
    pub controller: String,
    pub nsid: u32,
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}n{}", self.controller, self.nsid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Discovered,
    Explicit,
    /// Assumed `<controller>n1` because discovery found nothing.
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: NamespaceId,
    pub path: String,
    pub confidence: Confidence,
}

impl Namespace {
    fn from_path(path: &str, confidence: Confidence) -> Option<Namespace> {
        let (controller, nsid) = split_namespace(path)?;
        Some(Namespace {
            id: NamespaceId {
                controller: controller.to_string(),
                nsid,
            },
            path: path.to_string(),
            confidence,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkAttributes {
    pub pci_address: Option<String>,
    pub link_speed: Option<String>,
    pub link_width: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    pub path: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub link: LinkAttributes,
}

impl Controller {
    fn unknown(path: &str) -> Controller {
        Controller {
            path: path.to_string(),
            model: "unknown".into(),
            serial: "unknown".into(),
            firmware: "unknown".into(),
            link: LinkAttributes::default(),
        }
    }
}

/// One controller and the namespaces selected under it.
#[derive(Debug, Clone)]
pub struct ControllerPlan {
    pub controller: Controller,
    pub namespaces: Vec<Namespace>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub controllers: Vec<ControllerPlan>,
    /// Failures not owned by a single controller.
    pub diagnostics: Vec<Diagnostic>,
}

impl Topology {
    pub fn namespace_count(&self) -> usize {
        self.controllers.iter().map(|c| c.namespaces.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.namespace_count() == 0
    }
}

pub struct Resolver<'a> {
    tools: &'a Toolbox,
    cfg: &'a Config,
    filters: SelectionFilters,
    snapshot: Option<Result<nvme::ListSnapshot, ToolError>>,
}

impl<'a> Resolver<'a> {
    pub fn new(tools: &'a Toolbox, cfg: &'a Config) -> Result<Self, ConfigError> {
        Ok(Resolver {
            tools,
            cfg,
            filters: cfg.filters()?,
            snapshot: None,
        })
    }

    /// The enumeration snapshot, fetched on first use only.
    fn snapshot(&mut self) -> &Result<nvme::ListSnapshot, ToolError> {
        let tools = self.tools;
        self.snapshot.get_or_insert_with(|| {
            log::debug!("querying namespace enumeration");
            nvme::list(tools)
        })
    }

    pub fn resolve(mut self) -> Topology {
        let mut topo = Topology::default();

        let controllers = self.controllers(&mut topo.diagnostics);
        let explicit = self.explicit_namespaces(&controllers, &mut topo.diagnostics);

        for ctrl in controllers {
            let mut diagnostics = Vec::new();
            let namespaces = match &explicit {
                Some(list) => list
                    .iter()
                    .filter(|ns| ns.id.controller == ctrl)
                    .cloned()
                    .collect(),
                None => self.discover_namespaces(&ctrl, &mut diagnostics),
            };
            let controller = describe_controller(self.tools, &ctrl, &mut diagnostics);
            log::info!(
                "{}: {} namespace(s) selected ({} {})",
                ctrl,
                namespaces.len(),
                controller.model,
                controller.firmware
            );
            topo.controllers.push(ControllerPlan {
                controller,
                namespaces,
                diagnostics,
            });
        }
        topo
    }

    fn controllers(&mut self, diags: &mut Vec<Diagnostic>) -> Vec<String> {
        if !self.cfg.controllers.list.is_empty() {
            let mut seen = HashSet::new();
            return self
                .cfg
                .controllers
                .list
                .iter()
                .filter(|c| seen.insert(c.as_str()))
                .cloned()
                .collect();
        }
        let found = match self.snapshot() {
            Ok(snap) => snap
                .namespaces
                .iter()
                .filter_map(|ns| controller_of(ns))
                .map(str::to_string)
                .collect::<Vec<_>>(),
            Err(e) => {
                log::error!("controller discovery failed: {e}");
                diags.push(Diagnostic::from_tool("discovery", e));
                return Vec::new();
            }
        };
        let mut unique: Vec<String> = found
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        unique.sort_by_key(|c| natural_key(c));
        self.filters.controllers.apply(unique)
    }

    /// The explicit namespace list, parsed, when one is configured.
    fn explicit_namespaces(
        &self,
        controllers: &[String],
        diags: &mut Vec<Diagnostic>,
    ) -> Option<Vec<Namespace>> {
        let list = &self.cfg.namespaces.selection.list;
        if list.is_empty() {
            return None;
        }
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for path in list {
            if !seen.insert(path.as_str()) {
                continue;
            }
            match Namespace::from_path(path, Confidence::Explicit) {
                Some(ns) if controllers.contains(&ns.id.controller) => out.push(ns),
                Some(ns) => log::warn!(
                    "{}: parent controller {} is not under test, skipped",
                    path,
                    ns.id.controller
                ),
                None => diags.push(Diagnostic::new(
                    path.as_str(),
                    FaultKind::PathError,
                    "not a namespace device path",
                )),
            }
        }
        Some(out)
    }

    fn discover_namespaces(&mut self, ctrl: &str, diags: &mut Vec<Diagnostic>) -> Vec<Namespace> {
        let strict = self.cfg.namespaces.strict;
        let discovered: Vec<String> = match self.snapshot() {
            Ok(snap) => snap
                .namespaces
                .iter()
                .filter(|ns| controller_of(ns) == Some(ctrl))
                .cloned()
                .collect(),
            Err(e) => {
                let d = Diagnostic::from_tool(ctrl, e);
                log::error!("{d}");
                diags.push(d);
                return Vec::new();
            }
        };

        let (mut paths, confidence) = if discovered.is_empty() {
            if strict {
                diags.push(Diagnostic::new(
                    ctrl,
                    FaultKind::Unverified,
                    "no namespaces discovered",
                ));
                return Vec::new();
            }
            let synthetic = namespace_path(ctrl, 1);
            log::warn!("{ctrl}: no namespaces discovered, assuming {synthetic}");
            diags.push(Diagnostic::new(
                ctrl,
                FaultKind::Unverified,
                format!("no namespaces discovered, assuming {synthetic}"),
            ));
            (vec![synthetic], Confidence::Synthetic)
        } else {
            (discovered, Confidence::Discovered)
        };
        paths.sort_by_key(|p| natural_key(p));
        self.filters
            .namespaces
            .apply(paths)
            .iter()
            .filter_map(|p| Namespace::from_path(p, confidence))
            .collect()
    }
}

/// Static identity from `id-ctrl` plus PCIe link attributes from sysfs.
pub fn describe_controller(tools: &Toolbox, ctrl: &str, diags: &mut Vec<Diagnostic>) -> Controller {
    let mut controller = Controller::unknown(ctrl);
    match nvme::id_ctrl(tools, ctrl) {
        Ok(id) => {
            controller.model = id.model;
            controller.serial = id.serial;
            controller.firmware = id.firmware;
        }
        Err(e) => {
            log::warn!("{ctrl}: identify failed: {e}");
            diags.push(Diagnostic::from_tool(ctrl, &e));
        }
    }
    controller.link = link_attributes(tools, ctrl);
    controller
}

fn link_attributes(tools: &Toolbox, ctrl: &str) -> LinkAttributes {
    let device = PathBuf::from("/sys/class/nvme").join(basename(ctrl)).join("device");
    let runner = tools.runner();
    let attr = |name: &str| {
        runner
            .read_attr(&device.join(name))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let pci_address = runner
        .canonicalize(&device)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
    if pci_address.is_none() {
        log::debug!("{ctrl}: no PCI device link in sysfs");
    }
    LinkAttributes {
        pci_address,
        link_speed: attr("current_link_speed"),
        link_width: attr("current_link_width"),
    }
}

pub fn resolve(tools: &Toolbox, cfg: &Config) -> Result<Topology, ConfigError> {
    Ok(Resolver::new(tools, cfg)?.resolve())
}
