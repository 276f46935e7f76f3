//! Client network provisioning: the hostname map and DHCP range handed to
//! the DHCP/DNS service.
//!
//! Each node owns a /24 for its clients, derived from the allocated client
//! base address.  Both generated files follow the same discipline: rotate
//! any existing file to a `.bak` suffix, stage the new contents, and restore
//! the backup if the write fails.  Failures here are recoverable; the
//! session carries on and reports them as warnings.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use log::{debug, warn};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::device::DeviceControl;

lazy_static! {
    // Single writer for the hosts/DHCP files, process-wide: two sessions
    // provisioning different interfaces must not interleave writes here.
    static ref CLIENT_FILES_LOCK: Mutex<()> = Mutex::new(());
}

/// Name the node answers to inside the mesh.
pub const NODE_HOSTNAME: &str = "byzantium.byzantium.mesh";

/// DNS suffix for generated client names.
pub const CLIENT_DOMAIN: &str = "byzantium.mesh";

/// DHCP lease length for client addresses.
pub const LEASE_TIME: &str = "5m";

/// What the provisioner managed to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionReport {
    pub hosts_generated: bool,
    pub dhcp_configured: bool,
}

/// The `a.b.c` prefix of the client /24.
fn prefix_of(client_ip: Ipv4Addr) -> String {
    let [a, b, c, _] = client_ip.octets();
    format!("{}.{}.{}", a, b, c)
}

/// Render the hostname map for the client /24: the node itself at `.1`, a
/// deterministic placeholder name for every client address `.2` - `.254`.
pub fn render_hosts(client_ip: Ipv4Addr) -> String {
    let prefix = prefix_of(client_ip);
    let mut hosts = format!("{}.1\t{}\n", prefix, NODE_HOSTNAME);
    for host in 2..=254 {
        hosts.push_str(&format!(
            "{prefix}.{host}\tclient-{prefix}.{host}.{CLIENT_DOMAIN}\n"
        ));
    }
    hosts
}

/// Render the DHCP range directive spanning `.2` - `.254` of the client /24.
pub fn render_dhcp_range(client_ip: Ipv4Addr) -> String {
    let prefix = prefix_of(client_ip);
    format!("dhcp-range={prefix}.2,{prefix}.254,{LEASE_TIME}\n")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Replace `path` with `contents`, keeping the previous version at
/// `<path>.bak` (clobbering any prior backup).  The new contents are staged
/// to `<path>.tmp` and renamed into place; if that fails the backup is moved
/// back so a bad write never leaves the service without a file.
pub fn write_client_file(path: &Path, contents: &str) -> Result<()> {
    let backup = with_suffix(path, ".bak");
    let staging = with_suffix(path, ".tmp");

    if backup.exists() {
        fs::remove_file(&backup)
            .with_context(|| format!("Failed to remove old backup: {}", backup.display()))?;
    }

    let had_backup = path.exists();
    if had_backup {
        fs::rename(path, &backup)
            .with_context(|| format!("Failed to back up {}", path.display()))?;
    }

    let staged = fs::write(&staging, contents)
        .and_then(|_| fs::rename(&staging, path))
        .with_context(|| format!("Failed to write {}", path.display()));

    if let Err(e) = staged {
        let _ = fs::remove_file(&staging);
        if had_backup {
            if let Err(restore) = fs::rename(&backup, path) {
                warn!("Failed to restore {}: {}", path.display(), restore);
            }
        }
        return Err(e);
    }

    Ok(())
}

/// Generate the hosts map and DHCP include for the client /24 rooted at
/// `client_ip`, then signal the DHCP/DNS service to pick them up.
///
/// Neither failure aborts the session: each is recorded in `warnings` and
/// the other file is still attempted.
pub fn provision(
    device: &dyn DeviceControl,
    hosts_file: &Path,
    dnsmasq_include_file: &Path,
    client_ip: Ipv4Addr,
    warnings: &mut Vec<String>,
) -> ProvisionReport {
    let _guard = CLIENT_FILES_LOCK.lock().unwrap();

    debug!("Generating {} for {}", hosts_file.display(), client_ip);
    let hosts_generated = match write_client_file(hosts_file, &render_hosts(client_ip)) {
        Ok(()) => true,
        Err(e) => {
            warnings.push(format!(
                "Hosts map {} not generated: {}",
                hosts_file.display(),
                e
            ));
            false
        }
    };

    debug!("Generating {}", dnsmasq_include_file.display());
    let dhcp_configured =
        match write_client_file(dnsmasq_include_file, &render_dhcp_range(client_ip)) {
            Ok(()) => {
                if let Err(e) = device.reload_dnsmasq() {
                    warnings.push(format!("DHCP/DNS service reload failed: {}", e));
                }
                true
            }
            Err(e) => {
                warnings.push(format!(
                    "DHCP include {} not generated: {}",
                    dnsmasq_include_file.display(),
                    e
                ));
                false
            }
        };

    ProvisionReport {
        hosts_generated,
        dhcp_configured,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{LinkState, RadioSetting, RadioState};
    use std::sync::Mutex;

    struct FakeService {
        reloads: Mutex<u32>,
    }

    impl FakeService {
        fn new() -> Self {
            Self {
                reloads: Mutex::new(0),
            }
        }

        fn reloads(&self) -> u32 {
            *self.reloads.lock().unwrap()
        }
    }

    impl DeviceControl for FakeService {
        fn set_link(&self, _: &str, _: LinkState) -> Result<()> {
            unreachable!()
        }
        fn link_is_up(&self, _: &str) -> Result<bool> {
            unreachable!()
        }
        fn apply_radio(&self, _: &str, _: &RadioSetting) -> Result<()> {
            unreachable!()
        }
        fn read_radio(&self, _: &str) -> Result<RadioState> {
            unreachable!()
        }
        fn assign_address(&self, _: &str, _: Ipv4Addr, _: Option<Ipv4Addr>) -> Result<()> {
            unreachable!()
        }
        fn probe_address(&self, _: &str, _: Ipv4Addr) -> Result<bool> {
            unreachable!()
        }
        fn reload_dnsmasq(&self) -> Result<()> {
            *self.reloads.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn base_ip() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 1)
    }

    #[test]
    fn hosts_map_covers_the_whole_client_block() {
        let hosts = render_hosts(base_ip());
        let lines: Vec<&str> = hosts.lines().collect();

        assert_eq!(lines.len(), 254);
        assert_eq!(lines[0], "10.0.0.1\tbyzantium.byzantium.mesh");
        assert_eq!(lines[253], "10.0.0.254\tclient-10.0.0.254.byzantium.mesh");
    }

    #[test]
    fn hosts_map_uses_the_session_prefix() {
        let hosts = render_hosts(Ipv4Addr::new(10, 93, 7, 1));
        assert!(hosts.starts_with("10.93.7.1\tbyzantium.byzantium.mesh\n"));
        assert!(hosts.contains("10.93.7.42\tclient-10.93.7.42.byzantium.mesh\n"));
    }

    #[test]
    fn dhcp_range_line_is_exact() {
        assert_eq!(
            render_dhcp_range(base_ip()),
            "dhcp-range=10.0.0.2,10.0.0.254,5m\n"
        );
    }

    #[test]
    fn existing_file_is_rotated_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.mesh");
        fs::write(&path, "old contents\n").unwrap();
        fs::write(with_suffix(&path, ".bak"), "stale backup\n").unwrap();

        write_client_file(&path, "new contents\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new contents\n");
        assert_eq!(
            fs::read_to_string(with_suffix(&path, ".bak")).unwrap(),
            "old contents\n"
        );
    }

    #[test]
    fn failed_write_restores_the_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.mesh");
        fs::write(&path, "old contents\n").unwrap();
        // A directory squatting on the staging path makes the write fail
        // after the rotation has already happened.
        fs::create_dir(with_suffix(&path, ".tmp")).unwrap();

        let result = write_client_file(&path, "new contents\n");

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "old contents\n");
    }

    #[test]
    fn provision_writes_both_files_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts.mesh");
        let include = dir.path().join("dnsmasq.conf.include");
        let device = FakeService::new();
        let mut warnings = Vec::new();

        let report = provision(&device, &hosts, &include, base_ip(), &mut warnings);

        assert!(report.hosts_generated);
        assert!(report.dhcp_configured);
        assert!(warnings.is_empty());
        assert_eq!(device.reloads(), 1);
        assert_eq!(
            fs::read_to_string(&include).unwrap(),
            "dhcp-range=10.0.0.2,10.0.0.254,5m\n"
        );
    }

    #[test]
    fn hosts_failure_still_configures_dhcp() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts.mesh");
        let include = dir.path().join("dnsmasq.conf.include");
        fs::write(&hosts, "old contents\n").unwrap();
        fs::create_dir(with_suffix(&hosts, ".tmp")).unwrap();
        let device = FakeService::new();
        let mut warnings = Vec::new();

        let report = provision(&device, &hosts, &include, base_ip(), &mut warnings);

        assert!(!report.hosts_generated);
        assert!(report.dhcp_configured);
        // The rotated backup came back and the DHCP side went ahead.
        assert_eq!(fs::read_to_string(&hosts).unwrap(), "old contents\n");
        assert!(include.exists());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Hosts map"));
        assert_eq!(device.reloads(), 1);
    }
}
