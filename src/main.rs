use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::time::Duration;

use meshconf::{
    config::{self, Config},
    interface, session, Registry, RetryPolicy, SystemDevices,
};

#[derive(Parser)]
#[command(name = "meshconf")]
#[command(about = "Configure a node's network interfaces for a mesh deployment")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List network interfaces and their provisioning state
    ListInterfaces {
        /// Emit machine-readable JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Provision an interface: addresses, ad-hoc radio, DHCP, captive portal
    Provision {
        /// Wireless interface to configure
        interface: String,

        /// Network name for the mesh cell
        #[arg(short, long, default_value = "Byzantium")]
        essid: String,

        /// Wireless channel (1-14)
        #[arg(short, long, default_value = "3")]
        channel: u8,

        /// Maximum wireless configure/verify attempts (overrides config)
        #[arg(long)]
        max_retries: Option<u32>,

        /// Address allocation budget in seconds (overrides config)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show the interface registry
    ShowRegistry {
        /// Emit machine-readable JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the operator configuration
    ShowConfig,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::ListInterfaces { json } => cmd_list_interfaces(json),
        Commands::Provision {
            interface,
            essid,
            channel,
            max_retries,
            timeout,
        } => cmd_provision(&interface, &essid, channel, max_retries, timeout),
        Commands::ShowRegistry { json } => cmd_show_registry(json),
        Commands::ShowConfig => cmd_show_config(),
    }
}

#[derive(Serialize)]
struct InterfaceRow {
    name: String,
    kind: &'static str,
    configured: bool,
}

fn interface_rows(config: &Config) -> Result<Vec<InterfaceRow>> {
    let registry = Registry::open(&config.registry_path);
    let (wired, wireless) = interface::enumerate()?;

    // First sighting of an interface creates its registry record.
    registry.register_missing(&wired, &wireless)?;

    let mut rows = Vec::new();
    for name in wireless {
        let configured = registry
            .lookup_wireless(&name)?
            .map(|r| r.enabled)
            .unwrap_or(false);
        rows.push(InterfaceRow {
            name,
            kind: "wireless",
            configured,
        });
    }
    for name in wired {
        let configured = registry
            .lookup_wired(&name)?
            .map(|r| r.enabled)
            .unwrap_or(false);
        rows.push(InterfaceRow {
            name,
            kind: "wired",
            configured,
        });
    }
    Ok(rows)
}

fn cmd_list_interfaces(json: bool) -> Result<()> {
    let config = Config::load()?;
    let rows = interface_rows(&config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No network interfaces found.");
        return Ok(());
    }

    println!("{:<16} {:<10} {}", "INTERFACE", "KIND", "CONFIGURED");
    println!("{}", "-".repeat(40));
    for row in rows {
        let configured = if row.configured { "yes" } else { "no" };
        println!("{:<16} {:<10} {}", row.name, row.kind, configured);
    }

    Ok(())
}

fn cmd_provision(
    interface_name: &str,
    essid: &str,
    channel: u8,
    max_retries: Option<u32>,
    timeout: Option<u64>,
) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(secs) = timeout {
        config.retry.allocation_timeout_secs = secs;
    }

    let (_, wireless) = interface::enumerate()?;
    if !wireless.iter().any(|name| name == interface_name) {
        bail!(
            "'{}' is not a wireless interface on this node (candidates: {})",
            interface_name,
            wireless.join(", ")
        );
    }

    let policy = RetryPolicy::new(
        max_retries.unwrap_or(config.retry.max_wireless_attempts),
        Duration::from_secs(config.retry.wireless_backoff_secs),
    );

    let devices = SystemDevices::new(&config);
    let registry = Registry::open(&config.registry_path);
    let request = session::ProvisioningSession::new(interface_name, essid, channel)?;

    println!(
        "Provisioning {} (essid '{}', channel {})...",
        interface_name, essid, channel
    );
    let outcome = session::run(&devices, &registry, &config, &request, &policy)?;

    println!();
    println!("Interface:  {}", outcome.interface);
    println!("Mesh IP:    {} / {}", outcome.mesh_ip, outcome.mesh_netmask);
    println!(
        "Client IP:  {} / {} (on {})",
        outcome.client_ip, outcome.client_netmask, outcome.client_interface
    );
    match outcome.portal_pid.as_deref() {
        Some(pid) => println!("Portal PID: {}", pid),
        None => println!("Portal PID: (unknown)"),
    }

    if outcome.warnings.is_empty() {
        println!("\nProvisioning completed without warnings.");
    } else {
        println!("\nProvisioning completed with warnings:");
        for warning in &outcome.warnings {
            println!("  WARNING: {}", warning);
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct RegistryDump {
    wireless: Vec<meshconf::registry::WirelessRecord>,
    wired: Vec<meshconf::registry::WiredRecord>,
}

fn cmd_show_registry(json: bool) -> Result<()> {
    let config = Config::load()?;
    let registry = Registry::open(&config.registry_path);
    let dump = RegistryDump {
        wireless: registry.all_wireless()?,
        wired: registry.all_wired()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&dump)?);
        return Ok(());
    }

    println!("Registry: {}", registry.path().display());
    println!();

    if dump.wireless.is_empty() && dump.wired.is_empty() {
        println!("No interfaces registered.");
        return Ok(());
    }

    if !dump.wireless.is_empty() {
        println!(
            "{:<12} {:<12} {:<8} {:<8} {}",
            "WIRELESS", "CLIENT", "ENABLED", "CHANNEL", "ESSID"
        );
        println!("{}", "-".repeat(56));
        for record in &dump.wireless {
            println!(
                "{:<12} {:<12} {:<8} {:<8} {}",
                record.mesh_interface,
                record.client_interface,
                if record.enabled { "yes" } else { "no" },
                record.channel,
                record.essid
            );
        }
        println!();
    }

    if !dump.wired.is_empty() {
        println!("{:<12} {:<8} {}", "WIRED", "ENABLED", "GATEWAY");
        println!("{}", "-".repeat(32));
        for record in &dump.wired {
            println!(
                "{:<12} {:<8} {}",
                record.interface,
                if record.enabled { "yes" } else { "no" },
                if record.gateway { "yes" } else { "no" }
            );
        }
    }

    Ok(())
}

fn cmd_show_config() -> Result<()> {
    let path = config::config_path()?;
    println!("Config file: {}", path.display());
    println!();

    let config = Config::load()?;
    print!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}
