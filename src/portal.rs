//! Captive portal daemon launcher.
//!
//! The portal process owns the client-facing firewall; this module only
//! starts it scoped to the provisioned interface and address, decodes its
//! exit status, and recovers its PID from the daemon's PID file.  Nothing
//! here is fatal to a provisioning session: the interface stays configured
//! and every portal problem surfaces as a warning.

use log::{debug, warn};
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

/// Exit codes reported by the captive portal daemon.
const EXIT_INSUFFICIENT_ARGS: i32 = 1;
const EXIT_BAD_ARGS: i32 = 2;
const EXIT_FIREWALL_INIT: i32 = 3;
const EXIT_BAD_RULE_PARAMS: i32 = 4;
const EXIT_ALREADY_RUNNING: i32 = 5;

/// Result of a portal launch attempt.
#[derive(Debug, Clone, Default)]
pub struct PortalLaunch {
    /// PID read from the daemon's PID file, when one was found.
    pub pid: Option<String>,
    pub warnings: Vec<String>,
}

/// Start the captive portal daemon bound to `interface` / `client_ip`.
///
/// The daemon is spawned with `-i <interface> -a <address> -d` and
/// daemonizes itself, so the immediate exit status is its startup verdict.
/// Startup failure codes map to fixed warnings; on the running path the PID
/// file `captive_portal.<interface>` is looked up under each runtime
/// directory in order.  A missing or unreadable PID file is itself only a
/// warning, since the daemon may still be running correctly.
pub fn launch(
    portal_command: &str,
    runtime_dirs: &[PathBuf],
    interface: &str,
    client_ip: Ipv4Addr,
    settle: Duration,
) -> PortalLaunch {
    let mut launch = PortalLaunch::default();

    debug!(
        "Starting captive portal: {} -i {} -a {} -d",
        portal_command, interface, client_ip
    );
    let status = Command::new(portal_command)
        .args(["-i", interface, "-a", &client_ip.to_string(), "-d"])
        .output();

    let code = match status {
        Ok(output) => output.status.code(),
        Err(e) => {
            warn!("Captive portal failed to start: {}", e);
            launch
                .warnings
                .push(format!("Failed to start captive portal daemon: {}", e));
            return launch;
        }
    };

    let startup_failure = |code: i32| -> Option<&'static str> {
        match code {
            EXIT_INSUFFICIENT_ARGS => Some("insufficient command line arguments passed to daemon"),
            EXIT_BAD_ARGS => Some("bad arguments passed to daemon"),
            EXIT_FIREWALL_INIT => Some("firewall initialization failed"),
            EXIT_BAD_RULE_PARAMS => Some("bad parameters passed to network rules"),
            EXIT_ALREADY_RUNNING => Some("daemon already running on interface"),
            _ => None,
        }
    };

    if let Some(code) = code {
        if let Some(reason) = startup_failure(code) {
            launch.warnings.push(format!(
                "Captive portal daemon exited with code {}: {}",
                code, reason
            ));
            // "Already running" still means a daemon holds the interface,
            // so its PID file is worth reading.  The other startup
            // failures leave nothing to look up.
            if code != EXIT_ALREADY_RUNNING {
                return launch;
            }
        }
    }

    // The daemon writes its PID file after forking; give it a moment.
    thread::sleep(settle);
    find_pid(runtime_dirs, interface, &mut launch);
    launch
}

fn find_pid(runtime_dirs: &[PathBuf], interface: &str, launch: &mut PortalLaunch) {
    let pidfile_name = format!("captive_portal.{}", interface);

    for dir in runtime_dirs {
        let path = dir.join(&pidfile_name);
        if !path.exists() {
            continue;
        }
        debug!("Reading portal PID from {}", path.display());
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let pid = contents.trim();
                if pid.is_empty() {
                    launch
                        .warnings
                        .push(format!("Captive portal PID file {} is empty", path.display()));
                } else {
                    launch.pid = Some(pid.to_string());
                }
            }
            Err(e) => {
                launch.warnings.push(format!(
                    "Unable to read captive portal PID file {}: {}",
                    path.display(),
                    e
                ));
            }
        }
        return;
    }

    launch.warnings.push(format!(
        "Unable to locate captive portal PID file {}",
        pidfile_name
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn portal_script(dir: &Path, exit_code: i32) -> String {
        let path = dir.join("captive_portal");
        fs::write(&path, format!("#!/bin/sh\nexit {}\n", exit_code)).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn client_ip() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 1)
    }

    #[test]
    fn running_daemon_pid_is_read_from_the_runtime_dir() {
        let dir = tempfile::tempdir().unwrap();
        let command = portal_script(dir.path(), 0);
        fs::write(dir.path().join("captive_portal.wlan0"), "4321\n").unwrap();

        let launch = launch(
            &command,
            &[dir.path().to_path_buf()],
            "wlan0",
            client_ip(),
            Duration::ZERO,
        );

        assert_eq!(launch.pid.as_deref(), Some("4321"));
        assert!(launch.warnings.is_empty());
    }

    #[test]
    fn second_runtime_dir_is_searched() {
        let empty = tempfile::tempdir().unwrap();
        let fallback = tempfile::tempdir().unwrap();
        let command = portal_script(fallback.path(), 0);
        fs::write(fallback.path().join("captive_portal.wlan0"), "77\n").unwrap();

        let launch = launch(
            &command,
            &[empty.path().to_path_buf(), fallback.path().to_path_buf()],
            "wlan0",
            client_ip(),
            Duration::ZERO,
        );

        assert_eq!(launch.pid.as_deref(), Some("77"));
    }

    #[test]
    fn already_running_warns_but_still_looks_up_the_pid() {
        let dir = tempfile::tempdir().unwrap();
        let command = portal_script(dir.path(), 5);
        fs::write(dir.path().join("captive_portal.wlan0"), "998\n").unwrap();

        let launch = launch(
            &command,
            &[dir.path().to_path_buf()],
            "wlan0",
            client_ip(),
            Duration::ZERO,
        );

        assert_eq!(launch.warnings.len(), 1);
        assert!(launch.warnings[0].contains("daemon already running on interface"));
        assert_eq!(launch.pid.as_deref(), Some("998"));
    }

    #[test]
    fn firewall_failure_skips_the_pid_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let command = portal_script(dir.path(), 3);

        let launch = launch(
            &command,
            &[dir.path().to_path_buf()],
            "wlan0",
            client_ip(),
            Duration::ZERO,
        );

        assert_eq!(launch.warnings.len(), 1);
        assert!(launch.warnings[0].contains("firewall initialization failed"));
        assert_eq!(launch.pid, None);
    }

    #[test]
    fn missing_pid_file_is_a_warning_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let command = portal_script(dir.path(), 0);

        let launch = launch(
            &command,
            &[dir.path().to_path_buf()],
            "wlan0",
            client_ip(),
            Duration::ZERO,
        );

        assert_eq!(launch.pid, None);
        assert_eq!(launch.warnings.len(), 1);
        assert!(launch.warnings[0].contains("captive_portal.wlan0"));
    }

    #[test]
    fn unlaunchable_daemon_is_a_warning() {
        let launch = launch(
            "/nonexistent/captive_portal",
            &[],
            "wlan0",
            client_ip(),
            Duration::ZERO,
        );

        assert_eq!(launch.pid, None);
        assert_eq!(launch.warnings.len(), 1);
        assert!(launch.warnings[0].contains("Failed to start"));
    }
}
