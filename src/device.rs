//! Device operations consumed by the provisioning engine.
//!
//! All interaction with the operating system's network stack goes through the
//! [`DeviceControl`] trait: link state toggles, radio parameter reads and
//! writes, IP address assignment, ARP reachability probes, and the DHCP/DNS
//! service reload signal.  [`SystemDevices`] is the production implementation
//! and shells out to the classic wireless tools; tests substitute fakes so the
//! state machine and allocator can be exercised without a radio.
//!
//! # Requirements
//!
//! - `ifconfig`, `iwconfig`, and `arping` must be installed at the configured
//!   paths
//! - Link and radio changes require root privileges

use anyhow::{Context, Result};
use log::debug;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Command;

use crate::config::Config;
use crate::error::MeshconfError;

/// Administrative link state of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

impl LinkState {
    fn flag(self) -> &'static str {
        match self {
            LinkState::Up => "up",
            LinkState::Down => "down",
        }
    }
}

/// One radio parameter write.  Settings are applied independently and
/// best-effort; verification against the live device state is the sole
/// correctness gate.
#[derive(Debug, Clone)]
pub enum RadioSetting {
    AdHocMode,
    Essid(String),
    Bssid(String),
    Channel(u8),
}

impl RadioSetting {
    pub fn label(&self) -> &'static str {
        match self {
            RadioSetting::AdHocMode => "mode",
            RadioSetting::Essid(_) => "ESSID",
            RadioSetting::Bssid(_) => "BSSID",
            RadioSetting::Channel(_) => "channel",
        }
    }

    fn args(&self) -> Vec<String> {
        match self {
            RadioSetting::AdHocMode => vec!["mode".to_string(), "ad-hoc".to_string()],
            RadioSetting::Essid(essid) => vec!["essid".to_string(), essid.clone()],
            RadioSetting::Bssid(bssid) => vec!["ap".to_string(), bssid.clone()],
            RadioSetting::Channel(channel) => {
                vec!["channel".to_string(), channel.to_string()]
            }
        }
    }
}

/// Snapshot of the live wireless configuration of an interface.
///
/// Fields the device did not report are `None`; a missing field never
/// verifies as matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RadioState {
    /// Operating mode, e.g. "Ad-Hoc" or "Managed".
    pub mode: Option<String>,
    /// Network name.  `None` when unset or the device reports `off/any`.
    pub essid: Option<String>,
    /// Cell identifier the interface has joined.
    pub bssid: Option<String>,
    /// Operating frequency in MHz.
    pub frequency_mhz: Option<u32>,
}

/// Operations the provisioning engine needs from the OS.
pub trait DeviceControl {
    /// Force the administrative link state of an interface.
    fn set_link(&self, interface: &str, state: LinkState) -> Result<()>;

    /// Whether the interface is administratively up.
    fn link_is_up(&self, interface: &str) -> Result<bool>;

    /// Apply a single radio parameter.
    fn apply_radio(&self, interface: &str, setting: &RadioSetting) -> Result<()>;

    /// Read back the current radio configuration.
    fn read_radio(&self, interface: &str) -> Result<RadioState>;

    /// Assign an IPv4 address (and optional netmask) and bring the
    /// interface up.
    fn assign_address(
        &self,
        interface: &str,
        address: Ipv4Addr,
        netmask: Option<Ipv4Addr>,
    ) -> Result<()>;

    /// Probe whether `address` is already claimed by a host reachable on
    /// `interface`.  Returns `Ok(true)` if claimed, `Ok(false)` if free.
    /// Inability to run the probe at all is an error, distinct from either
    /// answer.
    fn probe_address(&self, interface: &str, address: Ipv4Addr) -> Result<bool>;

    /// Signal the DHCP/DNS service to reload its configuration.
    fn reload_dnsmasq(&self) -> Result<()>;
}

/// Production [`DeviceControl`] backed by the system's network tools.
#[derive(Debug, Clone)]
pub struct SystemDevices {
    arping: String,
    ifconfig: String,
    iwconfig: String,
    dnsmasq_reload: Vec<String>,
    sysfs_net: PathBuf,
}

impl SystemDevices {
    pub fn new(config: &Config) -> Self {
        Self {
            arping: config.commands.arping.clone(),
            ifconfig: config.commands.ifconfig.clone(),
            iwconfig: config.commands.iwconfig.clone(),
            dnsmasq_reload: config.commands.dnsmasq_reload.clone(),
            sysfs_net: PathBuf::from(crate::interface::SYSFS_NET),
        }
    }

    #[cfg(test)]
    fn with_sysfs(mut self, sysfs: impl Into<PathBuf>) -> Self {
        self.sysfs_net = sysfs.into();
        self
    }
}

impl DeviceControl for SystemDevices {
    /// # Command Executed
    /// ```bash
    /// ifconfig <interface> <up|down>
    /// ```
    fn set_link(&self, interface: &str, state: LinkState) -> Result<()> {
        debug!("Setting interface {} {}", interface, state.flag());
        let output = Command::new(&self.ifconfig)
            .args([interface, state.flag()])
            .output()
            .map_err(|e| MeshconfError::LinkState {
                interface: interface.to_string(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MeshconfError::LinkState {
                interface: interface.to_string(),
                detail: stderr.trim().to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Reads the IFF_UP bit from the interface's sysfs `flags` file.
    fn link_is_up(&self, interface: &str) -> Result<bool> {
        let path = self.sysfs_net.join(interface).join("flags");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read link flags: {}", path.display()))?;
        let raw = content.trim().trim_start_matches("0x");
        let flags = u32::from_str_radix(raw, 16)
            .with_context(|| format!("Unparseable link flags '{}'", content.trim()))?;
        Ok(flags & 0x1 != 0)
    }

    /// # Command Executed
    /// ```bash
    /// iwconfig <interface> mode ad-hoc
    /// iwconfig <interface> essid <essid>
    /// iwconfig <interface> ap <bssid>
    /// iwconfig <interface> channel <channel>
    /// ```
    fn apply_radio(&self, interface: &str, setting: &RadioSetting) -> Result<()> {
        debug!("Configuring {}: {} = {:?}", interface, setting.label(), setting);
        let output = Command::new(&self.iwconfig)
            .arg(interface)
            .args(setting.args())
            .output()
            .map_err(|e| {
                MeshconfError::CommandExecution(format!("{}: {}", self.iwconfig, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MeshconfError::CommandExecution(format!(
                "{} {} set failed: {}",
                self.iwconfig,
                setting.label(),
                stderr.trim()
            ))
            .into());
        }

        Ok(())
    }

    /// # Command Executed
    /// ```bash
    /// iwconfig <interface>
    /// ```
    ///
    /// The output is parsed for the `Mode`, `ESSID`, `Cell`, and `Frequency`
    /// fields; everything else is ignored.
    fn read_radio(&self, interface: &str) -> Result<RadioState> {
        let output = Command::new(&self.iwconfig)
            .arg(interface)
            .output()
            .map_err(|e| {
                MeshconfError::CommandExecution(format!("{}: {}", self.iwconfig, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MeshconfError::CommandExecution(format!(
                "{} read failed: {}",
                self.iwconfig,
                stderr.trim()
            ))
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_radio_state(&stdout))
    }

    /// # Command Executed
    /// ```bash
    /// ifconfig <interface> <address> [netmask <netmask>] up
    /// ```
    fn assign_address(
        &self,
        interface: &str,
        address: Ipv4Addr,
        netmask: Option<Ipv4Addr>,
    ) -> Result<()> {
        debug!("Assigning {} to {} (netmask {:?})", address, interface, netmask);
        let mut args = vec![interface.to_string(), address.to_string()];
        if let Some(mask) = netmask {
            args.push("netmask".to_string());
            args.push(mask.to_string());
        }
        args.push("up".to_string());

        let output = Command::new(&self.ifconfig)
            .args(&args)
            .output()
            .map_err(|e| MeshconfError::LinkState {
                interface: interface.to_string(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MeshconfError::LinkState {
                interface: interface.to_string(),
                detail: stderr.trim().to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// # Command Executed
    /// ```bash
    /// arping -c 5 -D -f -q -I <interface> <address>
    /// ```
    ///
    /// - `-c 5`: send 5 probes
    /// - `-D`: duplicate address detection mode
    /// - `-f`: stop after the first positive response
    /// - `-q`: no output, the exit code carries the answer
    ///
    /// Exit 0 means no host answered (address free), exit 1 means a host
    /// claimed the address.  Any other exit is a probe execution failure.
    fn probe_address(&self, interface: &str, address: Ipv4Addr) -> Result<bool> {
        debug!("Probing {} for {}", interface, address);
        let output = Command::new(&self.arping)
            .args(["-c", "5", "-D", "-f", "-q", "-I", interface])
            .arg(address.to_string())
            .output()
            .map_err(|e| {
                MeshconfError::ProbeExecution(format!("{}: {}", self.arping, e))
            })?;

        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(MeshconfError::ProbeExecution(format!(
                    "{} exited with {:?}: {}",
                    self.arping,
                    code,
                    stderr.trim()
                ))
                .into())
            }
        }
    }

    fn reload_dnsmasq(&self) -> Result<()> {
        let (program, args) = self
            .dnsmasq_reload
            .split_first()
            .ok_or_else(|| MeshconfError::CommandExecution("empty dnsmasq reload command".into()))?;
        debug!("Restarting DHCP/DNS service: {:?}", self.dnsmasq_reload);

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| MeshconfError::CommandExecution(format!("{}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MeshconfError::CommandExecution(format!(
                "{} failed: {}",
                program,
                stderr.trim()
            ))
            .into());
        }

        Ok(())
    }
}

/// Parse `iwconfig` output into a [`RadioState`].
///
/// Tolerant by design: fields that are absent or unparseable are left `None`
/// and fail verification instead of aborting the read.
pub fn parse_radio_state(output: &str) -> RadioState {
    let mut state = RadioState::default();

    for line in output.lines() {
        if let Some(essid) = field_after(line, "ESSID:") {
            let essid = essid.trim_matches('"');
            if !essid.is_empty() && essid != "off/any" {
                state.essid = Some(essid.to_string());
            }
        }
        if let Some(mode) = field_after(line, "Mode:") {
            state.mode = Some(mode.to_string());
        }
        if let Some(frequency) = field_after(line, "Frequency:") {
            if let Ok(ghz) = frequency.parse::<f64>() {
                state.frequency_mhz = Some((ghz * 1000.0).round() as u32);
            }
        }
        if let Some(rest) = line.split("Cell:").nth(1) {
            let cell = rest.trim().split_whitespace().next().unwrap_or("");
            if cell.contains(':') {
                state.bssid = Some(cell.to_string());
            }
        }
    }

    state
}

/// Extract the whitespace-delimited token following `marker` on a line.
fn field_after<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let rest = line.split(marker).nth(1)?;
    let token = rest.split_whitespace().next()?;
    Some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIGURED: &str = "\
wlan0     IEEE 802.11  ESSID:\"Byzantium\"
          Mode:Ad-Hoc  Frequency:2.422 GHz  Cell: 02:CA:FF:EE:BA:BE
          Tx-Power=20 dBm
          Retry short limit:7   RTS thr:off   Fragment thr:off
";

    const UNCONFIGURED: &str = "\
wlan0     IEEE 802.11  ESSID:off/any
          Mode:Managed  Access Point: Not-Associated
          Tx-Power=20 dBm
";

    #[test]
    fn parses_configured_radio_state() {
        let state = parse_radio_state(CONFIGURED);
        assert_eq!(state.mode.as_deref(), Some("Ad-Hoc"));
        assert_eq!(state.essid.as_deref(), Some("Byzantium"));
        assert_eq!(state.bssid.as_deref(), Some("02:CA:FF:EE:BA:BE"));
        assert_eq!(state.frequency_mhz, Some(2422));
    }

    #[test]
    fn unset_essid_reads_as_none() {
        let state = parse_radio_state(UNCONFIGURED);
        assert_eq!(state.essid, None);
        assert_eq!(state.mode.as_deref(), Some("Managed"));
        assert_eq!(state.bssid, None);
        assert_eq!(state.frequency_mhz, None);
    }

    #[test]
    fn parses_channel_fourteen_frequency() {
        let state = parse_radio_state("          Mode:Ad-Hoc  Frequency:2.484 GHz\n");
        assert_eq!(state.frequency_mhz, Some(2484));
    }

    #[test]
    fn link_flags_detect_up_and_down() {
        let sysfs = tempfile::tempdir().unwrap();
        std::fs::create_dir(sysfs.path().join("wlan0")).unwrap();
        std::fs::write(sysfs.path().join("wlan0").join("flags"), "0x1003\n").unwrap();
        std::fs::create_dir(sysfs.path().join("wlan1")).unwrap();
        std::fs::write(sysfs.path().join("wlan1").join("flags"), "0x1002\n").unwrap();

        let devices =
            SystemDevices::new(&crate::config::Config::default()).with_sysfs(sysfs.path());
        assert!(devices.link_is_up("wlan0").unwrap());
        assert!(!devices.link_is_up("wlan1").unwrap());
        assert!(devices.link_is_up("wlan2").is_err());
    }
}
