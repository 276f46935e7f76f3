//! Wireless configuration state machine.
//!
//! Drives an interface into a verified ad-hoc configuration:
//!
//! ```text
//! Down -> Configuring -> Verifying -> Verified
//!              ^                          |
//!              +--------- Retrying <------+  (any parameter mismatch)
//! ```
//!
//! Entering `Configuring` applies four independent parameter writes (mode,
//! ESSID, BSSID, channel) best-effort; `Verifying` reads the live device
//! state once and compares all four against the request.  Stubborn adapters
//! silently drop writes, so verification against the device read-back is the
//! sole correctness gate and a mismatch loops back with the same target.
//! Retries are bounded with exponential backoff; exhaustion is an explicit
//! error.

use anyhow::Result;
use log::{debug, warn};
use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use crate::config::Timing;
use crate::device::{DeviceControl, LinkState, RadioSetting, RadioState};
use crate::error::MeshconfError;

/// Fixed cell identifier every node uses to form the ad-hoc cell.
pub const BSSID: &str = "02:CA:FF:EE:BA:BE";

/// 2.4 GHz channel center frequencies, channel 1 through 14.
pub const CHANNEL_FREQUENCIES_MHZ: [u32; 14] = [
    2412, 2417, 2422, 2427, 2432, 2437, 2442, 2447, 2452, 2457, 2462, 2467, 2472, 2484,
];

pub const MESH_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 0, 0);
pub const CLIENT_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Center frequency in MHz for a 2.4 GHz channel.
pub fn channel_frequency_mhz(channel: u8) -> Result<u32> {
    if channel == 0 || channel as usize > CHANNEL_FREQUENCIES_MHZ.len() {
        return Err(MeshconfError::InvalidChannel(channel).into());
    }
    Ok(CHANNEL_FREQUENCIES_MHZ[channel as usize - 1])
}

/// The radio parameters one provisioning session asks for.
#[derive(Debug, Clone)]
pub struct RadioTarget {
    pub essid: String,
    pub channel: u8,
    pub frequency_mhz: u32,
    pub bssid: String,
}

impl RadioTarget {
    pub fn new(essid: impl Into<String>, channel: u8) -> Result<Self> {
        Ok(Self {
            essid: essid.into(),
            channel,
            frequency_mhz: channel_frequency_mhz(channel)?,
            bssid: BSSID.to_string(),
        })
    }

    fn settings(&self) -> [RadioSetting; 4] {
        [
            RadioSetting::AdHocMode,
            RadioSetting::Essid(self.essid.clone()),
            RadioSetting::Bssid(self.bssid.clone()),
            RadioSetting::Channel(self.channel),
        ]
    }
}

/// Bounds on the configure/verify loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    /// One iteration, no waiting: report failure instead of retrying.
    pub fn single_shot() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
        }
    }
}

/// Outcome of comparing a device read-back against the requested target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified,
    /// The machine loops back to `Configuring`; the payload says why.
    Retrying(Vec<String>),
}

/// Compare a live [`RadioState`] against the target.  All four parameters
/// must match for the machine to reach `Verified`.
pub fn verify(state: &RadioState, target: &RadioTarget) -> Verification {
    let mut mismatches = Vec::new();

    match state.mode.as_deref() {
        Some(mode) if mode.eq_ignore_ascii_case("ad-hoc") => {}
        other => mismatches.push(format!("mode is {:?}, wanted ad-hoc", other)),
    }
    match state.essid.as_deref() {
        Some(essid) if essid == target.essid => {}
        other => mismatches.push(format!("ESSID is {:?}, wanted {:?}", other, target.essid)),
    }
    match state.bssid.as_deref() {
        Some(bssid) if bssid.eq_ignore_ascii_case(&target.bssid) => {}
        other => mismatches.push(format!("BSSID is {:?}, wanted {}", other, target.bssid)),
    }
    match state.frequency_mhz {
        Some(freq) if freq == target.frequency_mhz => {}
        other => mismatches.push(format!(
            "frequency is {:?} MHz, wanted {} MHz (channel {})",
            other, target.frequency_mhz, target.channel
        )),
    }

    if mismatches.is_empty() {
        Verification::Verified
    } else {
        Verification::Retrying(mismatches)
    }
}

/// Run the state machine until the interface verifies or the retry policy is
/// exhausted.
///
/// The interface is forced down on entry (fatal if that fails).  Individual
/// parameter writes are best-effort; failures are recorded in `warnings` and
/// the iteration continues, relying on verification to catch any setting
/// that did not stick.
pub fn configure_radio(
    device: &dyn DeviceControl,
    interface: &str,
    target: &RadioTarget,
    policy: &RetryPolicy,
    timing: &Timing,
    warnings: &mut Vec<String>,
) -> Result<()> {
    // Down: the adapter's mode cannot change while the link is up.
    device.set_link(interface, LinkState::Down)?;
    thread::sleep(timing.link_settle());

    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0;
    loop {
        attempt += 1;
        debug!("Configuring {} (attempt {}/{})", interface, attempt, max_attempts);

        // Configuring: four independent writes, best-effort.
        for setting in target.settings() {
            if let Err(e) = device.apply_radio(interface, &setting) {
                warn!("Applying {} on {} failed: {}", setting.label(), interface, e);
                warnings.push(format!(
                    "Failed to apply {} on {}: {}",
                    setting.label(),
                    interface,
                    e
                ));
            }
            thread::sleep(timing.radio_settle());
        }

        // Verifying: one read of the live device state.
        let outcome = match device.read_radio(interface) {
            Ok(state) => verify(&state, target),
            Err(e) => Verification::Retrying(vec![format!("could not read radio state: {}", e)]),
        };

        match outcome {
            Verification::Verified => {
                debug!("Wireless interface {} verified", interface);
                return Ok(());
            }
            Verification::Retrying(mismatches) => {
                for mismatch in &mismatches {
                    debug!("Verification mismatch on {}: {}", interface, mismatch);
                }
                if attempt >= max_attempts {
                    return Err(MeshconfError::WirelessVerification {
                        interface: interface.to_string(),
                        attempts: max_attempts,
                    }
                    .into());
                }
                thread::sleep(backoff);
                backoff = backoff.saturating_mul(2);
            }
        }
    }
}

/// Apply the session's IP configuration once the radio has verified: mesh
/// address and /16 netmask on the primary interface, client address on the
/// virtual sub-interface.  Both ends come up; neither is re-verified here.
pub fn apply_addresses(
    device: &dyn DeviceControl,
    mesh_interface: &str,
    mesh_ip: Ipv4Addr,
    client_interface: &str,
    client_ip: Ipv4Addr,
    timing: &Timing,
) -> Result<()> {
    debug!("Setting {} on {}", mesh_ip, mesh_interface);
    device.assign_address(mesh_interface, mesh_ip, Some(MESH_NETMASK))?;
    thread::sleep(timing.link_settle());

    debug!("Setting {} on {}", client_ip, client_interface);
    device.assign_address(client_interface, client_ip, None)?;
    Ok(())
}
