use anyhow::{Context, Result};
use log::debug;
use std::path::Path;

/// Kernel view of the network interfaces on this node.
pub const SYSFS_NET: &str = "/sys/class/net";

/// The interface that is never a provisioning candidate.
pub const LOOPBACK: &str = "lo";

/// Enumerate the network interfaces the kernel currently exposes, split into
/// wired and wireless.  The loopback interface is excluded.  An interface is
/// wireless if the kernel publishes a `wireless/` subdirectory for it.
///
/// If no interfaces besides loopback exist, both lists contain only the
/// loopback as a degenerate fallback rather than an error.
pub fn enumerate() -> Result<(Vec<String>, Vec<String>)> {
    enumerate_at(Path::new(SYSFS_NET))
}

/// Same as [`enumerate`] but reading an arbitrary sysfs-style directory.
pub fn enumerate_at(sysfs: &Path) -> Result<(Vec<String>, Vec<String>)> {
    debug!("Reading contents of {}", sysfs.display());

    let mut names = Vec::new();
    let entries = sysfs
        .read_dir()
        .with_context(|| format!("Failed to read interface list at {}", sysfs.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != LOOPBACK {
            names.push(name);
        }
    }
    names.sort();

    if names.is_empty() {
        debug!("No interfaces found, defaulting to loopback");
        return Ok((vec![LOOPBACK.to_string()], vec![LOOPBACK.to_string()]));
    }

    let mut wired = Vec::new();
    let mut wireless = Vec::new();
    for name in names {
        if sysfs.join(&name).join("wireless").is_dir() {
            debug!("Found wireless interface {}", name);
            wireless.push(name);
        } else {
            debug!("Found wired interface {}", name);
            wired.push(name);
        }
    }

    Ok((wired, wireless))
}
