use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Durable registry of per-interface configuration.
    pub registry_path: PathBuf,
    /// Hostname map consumed by the DHCP/DNS service.
    pub hosts_file: PathBuf,
    /// DHCP range include file consumed by the DHCP/DNS service.
    pub dnsmasq_include_file: PathBuf,
    /// Directories searched for daemon PID files, in order.
    pub runtime_dirs: Vec<PathBuf>,
    pub commands: CommandPaths,
    pub timing: Timing,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("/var/db/meshconf/registry.toml"),
            hosts_file: PathBuf::from("/etc/hosts.mesh"),
            dnsmasq_include_file: PathBuf::from("/etc/dnsmasq.conf.include"),
            runtime_dirs: vec![PathBuf::from("/var/run"), PathBuf::from("/tmp")],
            commands: CommandPaths::default(),
            timing: Timing::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// External commands the provisioning engine shells out to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPaths {
    pub arping: String,
    pub ifconfig: String,
    pub iwconfig: String,
    /// Command line that restarts the DHCP/DNS service.
    pub dnsmasq_reload: Vec<String>,
    /// Captive portal daemon binary.
    pub portal: String,
}

impl Default for CommandPaths {
    fn default() -> Self {
        Self {
            arping: "/sbin/arping".to_string(),
            ifconfig: "/sbin/ifconfig".to_string(),
            iwconfig: "/sbin/iwconfig".to_string(),
            dnsmasq_reload: vec!["/etc/rc.d/rc.dnsmasq".to_string(), "restart".to_string()],
            portal: "/usr/local/sbin/captive_portal".to_string(),
        }
    }
}

/// Settle delays between side-effecting device operations.  Wireless hardware
/// needs time to catch up after link flips and parameter writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub link_settle_secs: u64,
    pub radio_settle_secs: u64,
    pub portal_settle_secs: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            link_settle_secs: 5,
            radio_settle_secs: 1,
            portal_settle_secs: 5,
        }
    }
}

impl Timing {
    /// Zero delays, for exercising workflows without waiting on hardware.
    pub fn immediate() -> Self {
        Self {
            link_settle_secs: 0,
            radio_settle_secs: 0,
            portal_settle_secs: 0,
        }
    }

    pub fn link_settle(&self) -> Duration {
        Duration::from_secs(self.link_settle_secs)
    }

    pub fn radio_settle(&self) -> Duration {
        Duration::from_secs(self.radio_settle_secs)
    }

    pub fn portal_settle(&self) -> Duration {
        Duration::from_secs(self.portal_settle_secs)
    }
}

/// Bounds on the retry loops of the provisioning engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum wireless configure/verify iterations before giving up.
    pub max_wireless_attempts: u32,
    /// Initial backoff between wireless iterations; doubles each retry.
    pub wireless_backoff_secs: u64,
    /// Wall-clock budget for finding a free address in a pool.
    pub allocation_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_wireless_attempts: 5,
            wireless_backoff_secs: 1,
            allocation_timeout_secs: 120,
        }
    }
}

impl RetryConfig {
    pub fn allocation_timeout(&self) -> Duration {
        Duration::from_secs(self.allocation_timeout_secs)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config_dir.join("meshconf").join("config.toml"))
}
