use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

static NAMESPACE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<ctrl>.*?\d+)(?:c\d+)?n(?P<nsid>\d+)$").expect("namespace path regex"));

/// Split a namespace node (`/dev/nvme0n1`) into its controller node
/// (`/dev/nvme0`) and namespace id (`1`). A multipath path node
/// (`/dev/nvme0c1n1`) maps to its subsystem controller `/dev/nvme0`.
pub fn split_namespace(path: &str) -> Option<(&str, u32)> {
    let caps = NAMESPACE_PATH.captures(path)?;
    let ctrl = caps.name("ctrl")?.as_str();
    let nsid = caps.name("nsid")?.as_str().parse().ok()?;
    Some((ctrl, nsid))
}

pub fn controller_of(ns: &str) -> Option<&str> {
    split_namespace(ns).map(|(c, _)| c)
}

pub fn nsid_of(ns: &str) -> Option<u32> {
    split_namespace(ns).map(|(_, n)| n)
}

pub fn namespace_path(ctrl: &str, nsid: u32) -> String {
    format!("{ctrl}n{nsid}")
}

/// `/dev/nvme0n1` stays as is, `nvme0n1` becomes `/dev/nvme0n1`.
pub fn device_node(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/dev/{name}")
    }
}

pub fn basename(dev: &str) -> &str {
    dev.rsplit('/').next().unwrap_or(dev)
}

/// Ordering key that sorts `/dev/nvme2` before `/dev/nvme10`.
pub fn natural_key(s: &str) -> Vec<(String, u64)> {
    let mut out = Vec::new();
    let mut text = String::new();
    let mut digits = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else {
            if !digits.is_empty() {
                out.push((std::mem::take(&mut text), digits.parse().unwrap_or(u64::MAX)));
                digits.clear();
            }
            text.push(ch);
        }
    }
    out.push((text, digits.parse().unwrap_or(0)));
    out
}

/// Mountpoint for a namespace: `<base>/<basename(ns)>`.
pub fn mountpoint_for(base: &Path, ns: &str) -> PathBuf {
    base.join(basename(ns))
}

/// True when `target` lies strictly below `mountpoint` without `..` hops.
pub fn is_inside(mountpoint: &Path, target: &Path) -> bool {
    target != mountpoint
        && target.starts_with(mountpoint)
        && !target
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
}

/// Workload file for `pattern` inside `mountpoint`.
pub fn workload_file(mountpoint: &Path, prefix: &str, pattern: &str) -> Option<PathBuf> {
    let safe: String = pattern
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let path = mountpoint.join(format!("{prefix}_{safe}.dat"));
    is_inside(mountpoint, &path).then_some(path)
}
