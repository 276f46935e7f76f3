//! Provisioning session orchestration.
//!
//! One session configures one interface end to end: allocate mesh and client
//! addresses, drive the radio into a verified ad-hoc state, assign the
//! addresses, hand the client /24 to the DHCP/DNS service, start the captive
//! portal, and record the result in the registry.  The session value is
//! ephemeral; only the registry outlives the run.
//!
//! Sessions for different interfaces may run concurrently.  Two sessions on
//! the same interface would interleave link flips and probes, so a
//! process-wide per-interface lock rejects the second one outright.

use anyhow::Result;
use lazy_static::lazy_static;
use log::{debug, info};
use serde::Serialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::allocate;
use crate::clientnet;
use crate::config::Config;
use crate::device::DeviceControl;
use crate::error::MeshconfError;
use crate::portal;
use crate::registry::Registry;
use crate::wireless::{self, RadioTarget, RetryPolicy, CLIENT_NETMASK, MESH_NETMASK};

lazy_static! {
    static ref ACTIVE_SESSIONS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Holds the per-interface slot for the duration of a session.
struct SessionGuard {
    interface: String,
}

impl SessionGuard {
    fn acquire(interface: &str) -> Result<Self> {
        let mut active = ACTIVE_SESSIONS.lock().unwrap();
        if !active.insert(interface.to_string()) {
            return Err(MeshconfError::SessionInProgress(interface.to_string()).into());
        }
        Ok(Self {
            interface: interface.to_string(),
        })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        ACTIVE_SESSIONS.lock().unwrap().remove(&self.interface);
    }
}

/// Everything one configuration attempt needs, derived up front and passed
/// through the workflow.  Discarded when the run completes.
#[derive(Debug, Clone)]
pub struct ProvisioningSession {
    pub mesh_interface: String,
    pub client_interface: String,
    pub target: RadioTarget,
}

impl ProvisioningSession {
    pub fn new(interface: &str, essid: &str, channel: u8) -> Result<Self> {
        Ok(Self {
            mesh_interface: interface.to_string(),
            client_interface: format!("{}:1", interface),
            target: RadioTarget::new(essid, channel)?,
        })
    }
}

/// What a completed session produced.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    pub interface: String,
    pub client_interface: String,
    pub essid: String,
    pub channel: u8,
    pub mesh_ip: Ipv4Addr,
    pub mesh_netmask: Ipv4Addr,
    pub client_ip: Ipv4Addr,
    pub client_netmask: Ipv4Addr,
    pub hosts_generated: bool,
    pub dhcp_configured: bool,
    pub portal_pid: Option<String>,
    /// Recoverable problems, in the order they occurred.  The session still
    /// completed; these need operator attention.
    pub warnings: Vec<String>,
}

/// Run a full provisioning session for `session`'s interface.
///
/// Fatal conditions (probe execution failure, link state failure, allocation
/// timeout, verification exhaustion) abort with an error.  Everything else
/// is best-effort: the session completes and reports warnings.
pub fn run(
    device: &dyn DeviceControl,
    registry: &Registry,
    config: &Config,
    session: &ProvisioningSession,
    policy: &RetryPolicy,
) -> Result<ProvisionOutcome> {
    let _guard = SessionGuard::acquire(&session.mesh_interface)?;
    let timing = &config.timing;
    let mut warnings = Vec::new();

    info!(
        "Provisioning {} (essid {}, channel {})",
        session.mesh_interface, session.target.essid, session.target.channel
    );

    // The registry record exists from the first enumeration pass; make sure
    // of it in case this interface was named directly.
    registry.insert_wireless(&session.mesh_interface)?;

    let mesh_ip = allocate::allocate_mesh(
        device,
        &session.mesh_interface,
        timing.link_settle(),
        config.retry.allocation_timeout(),
    )?;
    let client_ip = allocate::allocate_client(
        device,
        &session.client_interface,
        timing.link_settle(),
        config.retry.allocation_timeout(),
    )?;
    debug!("Allocated mesh {} and client {}", mesh_ip, client_ip);

    wireless::configure_radio(
        device,
        &session.mesh_interface,
        &session.target,
        policy,
        timing,
        &mut warnings,
    )?;
    wireless::apply_addresses(
        device,
        &session.mesh_interface,
        mesh_ip,
        &session.client_interface,
        client_ip,
        timing,
    )?;

    let report = clientnet::provision(
        device,
        &config.hosts_file,
        &config.dnsmasq_include_file,
        client_ip,
        &mut warnings,
    );

    let portal = portal::launch(
        &config.commands.portal,
        &config.runtime_dirs,
        &session.mesh_interface,
        client_ip,
        timing.portal_settle(),
    );
    warnings.extend(portal.warnings);

    registry.mark_configured(
        &session.mesh_interface,
        session.target.channel,
        &session.target.essid,
        &session.client_interface,
    )?;

    info!(
        "Interface {} provisioned: mesh {}, client {}",
        session.mesh_interface, mesh_ip, client_ip
    );

    Ok(ProvisionOutcome {
        interface: session.mesh_interface.clone(),
        client_interface: session.client_interface.clone(),
        essid: session.target.essid.clone(),
        channel: session.target.channel,
        mesh_ip,
        mesh_netmask: MESH_NETMASK,
        client_ip,
        client_netmask: CLIENT_NETMASK,
        hosts_generated: report.hosts_generated,
        dhcp_configured: report.dhcp_configured,
        portal_pid: portal.pid,
        warnings,
    })
}
