use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshconfError {
    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("Interface '{0}' is not a wireless device")]
    NotWireless(String),

    #[error("Invalid wireless channel {0} (must be 1-14)")]
    InvalidChannel(u8),

    #[error("Failed to execute reachability probe: {0}")]
    ProbeExecution(String),

    #[error("Failed to change link state of '{interface}': {detail}")]
    LinkState { interface: String, detail: String },

    #[error("No free {pool} address found within {secs}s")]
    AllocationTimeout { pool: String, secs: u64 },

    #[error("Wireless settings on '{interface}' did not verify after {attempts} attempts")]
    WirelessVerification { interface: String, attempts: u32 },

    #[error("Failed to execute {0}")]
    CommandExecution(String),

    #[error("A provisioning session is already running on '{0}'")]
    SessionInProgress(String),
}
