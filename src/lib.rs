//! Mesh node network provisioning library.
//!
//! This library configures a single node's network interfaces for a wireless
//! mesh deployment: it picks non-conflicting IP addresses by probing the
//! network, drives a wireless adapter into a verified ad-hoc configuration,
//! and provisions DHCP/DNS service and a captive portal for client devices.
//!
//! # Modules
//!
//! - [`allocate`] - Collision-avoiding IP address allocation
//! - [`clientnet`] - Hosts map and DHCP range generation for the client /24
//! - [`config`] - Operator configuration (paths, commands, timings)
//! - [`device`] - OS-facing device operations and the command seam
//! - [`error`] - Custom error types for the library
//! - [`interface`] - Network interface enumeration and classification
//! - [`portal`] - Captive portal daemon launcher
//! - [`registry`] - Durable per-interface configuration registry
//! - [`session`] - End-to-end provisioning session orchestration
//! - [`wireless`] - Wireless configuration state machine
//!
//! # Example Usage
//!
//! ```no_run
//! use meshconf::{Config, ProvisioningSession, Registry, RetryPolicy, SystemDevices};
//!
//! let config = Config::load().expect("config");
//! let devices = SystemDevices::new(&config);
//! let registry = Registry::open(&config.registry_path);
//! let session = ProvisioningSession::new("wlan0", "Byzantium", 3).expect("session");
//! let policy = RetryPolicy::new(5, std::time::Duration::from_secs(1));
//!
//! let outcome = meshconf::session::run(&devices, &registry, &config, &session, &policy)
//!     .expect("provisioning failed");
//! println!("mesh address: {}", outcome.mesh_ip);
//! ```

/// Collision-avoiding IP allocation from the mesh and client pools.
pub mod allocate;

/// Hosts map and DHCP range generation for the client subnet.
pub mod clientnet;

/// Operator configuration: file locations, external commands, timings.
pub mod config;

/// The device operation seam and its system implementation.
pub mod device;

/// Error module defining custom error types for the library.
pub mod error;

/// Interface enumeration, classified wired vs. wireless.
pub mod interface;

/// Captive portal launch and exit status interpretation.
pub mod portal;

/// Durable registry of per-interface configuration.
pub mod registry;

/// The provisioning session workflow.
pub mod session;

/// Wireless configuration state machine and channel/frequency data.
pub mod wireless;

pub use config::Config;
pub use device::{DeviceControl, RadioState, SystemDevices};
pub use error::MeshconfError;
pub use interface::enumerate;
pub use registry::Registry;
pub use session::{ProvisionOutcome, ProvisioningSession};
pub use wireless::{RetryPolicy, BSSID, CHANNEL_FREQUENCIES_MHZ};
