//! Filesystem creation and mounting.

use std::path::Path;

use super::Toolbox;
use crate::error::ToolError;

pub fn mkfs(tools: &Toolbox, fs_type: &str, options: &str, dev: &str) -> Result<String, ToolError> {
    if fs_type.is_empty() || !fs_type.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ToolError::Path(format!("unusable filesystem type {fs_type:?}")));
    }
    let spec = tools
        .command(&format!("mkfs.{fs_type}"))
        .args(options.split_whitespace())
        .arg(dev)
        .privileged();
    tools.run(&spec)
}

pub fn mount(tools: &Toolbox, dev: &str, mountpoint: &Path, options: &str) -> Result<String, ToolError> {
    let mut spec = tools.command("mount");
    if !options.trim().is_empty() {
        spec = spec.args(["-o", options.trim()]);
    }
    let spec = spec
        .arg(dev)
        .arg(mountpoint.display().to_string())
        .privileged();
    tools.run(&spec)
}

pub fn umount(tools: &Toolbox, mountpoint: &Path) -> Result<String, ToolError> {
    let spec = tools
        .command("umount")
        .arg(mountpoint.display().to_string())
        .privileged();
    tools.run(&spec)
}
