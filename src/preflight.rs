#![forbid(unsafe_code)]

//! Start-up checks run before the server binds its socket.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;
use tokio::process::Command;
use tracing::info;

/// Refuses to start as root; the service writes wherever its output
/// directory points and spawns external tools on request.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or pass --allow-root"
        );
    }
    Ok(())
}

/// Runs `<program> <version_flag>` and fails loudly when the tool is missing
/// or broken.
pub async fn ensure_program_available(program: &Path, version_flag: &str) -> Result<()> {
    let output = Command::new(program)
        .arg(version_flag)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("{} is required but could not be run", program.display()))?;
    if !output.status.success() {
        bail!(
            "{} {version_flag} exited with {}",
            program.display(),
            output.status
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = stdout.lines().next().unwrap_or_default().trim();
    info!(program = %program.display(), version, "external tool available");
    Ok(())
}
