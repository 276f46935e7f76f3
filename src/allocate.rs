//! Collision-avoiding IP address allocation.
//!
//! Candidate addresses are drawn uniformly at random from the designated
//! pools and submitted to the reachability probe until one comes back
//! unclaimed.  Collisions are rare and the pools are large, so retries are
//! expected to terminate quickly; a wall-clock budget bounds the loop in case
//! the probe mechanism itself is broken.

use anyhow::Result;
use log::debug;
use rand::Rng;
use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};

use crate::device::{DeviceControl, LinkState};
use crate::error::MeshconfError;

/// Strip a virtual sub-interface suffix: probes run on the physical device,
/// so `wlan0:1` probes via `wlan0`.
pub fn raw_interface(interface: &str) -> &str {
    interface.rsplit_once(':').map_or(interface, |(raw, _)| raw)
}

/// Pick an unclaimed mesh address in 192.168.0.0/16 (host octet 1-254).
///
/// The interface must be up to probe; if it is down it is brought up for the
/// duration of the allocation and restored afterwards, whether or not the
/// probe succeeds.
pub fn allocate_mesh(
    device: &dyn DeviceControl,
    interface: &str,
    settle: Duration,
    budget: Duration,
) -> Result<Ipv4Addr> {
    debug!("Probing for a mesh address on {}", interface);
    with_interface_up(device, raw_interface(interface), settle, || {
        find_free(device, raw_interface(interface), "mesh", budget, || {
            let mut rng = rand::thread_rng();
            Ipv4Addr::new(192, 168, rng.gen_range(0..=254), rng.gen_range(1..=254))
        })
    })
}

/// Pick an unclaimed client network base address `10.x.y.1`.
pub fn allocate_client(
    device: &dyn DeviceControl,
    interface: &str,
    settle: Duration,
    budget: Duration,
) -> Result<Ipv4Addr> {
    debug!("Probing for a client address on {}", interface);
    with_interface_up(device, raw_interface(interface), settle, || {
        find_free(device, raw_interface(interface), "client", budget, || {
            let mut rng = rand::thread_rng();
            Ipv4Addr::new(10, rng.gen_range(0..=254), rng.gen_range(0..=254), 1)
        })
    })
}

fn find_free(
    device: &dyn DeviceControl,
    interface: &str,
    pool: &str,
    budget: Duration,
    mut candidate: impl FnMut() -> Ipv4Addr,
) -> Result<Ipv4Addr> {
    let deadline = Instant::now() + budget;
    loop {
        let addr = candidate();
        if !device.probe_address(interface, addr)? {
            debug!("Address {} is free in the {} pool", addr, pool);
            return Ok(addr);
        }
        debug!("Address {} is claimed, picking another", addr);
        if Instant::now() >= deadline {
            return Err(MeshconfError::AllocationTimeout {
                pool: pool.to_string(),
                secs: budget.as_secs(),
            }
            .into());
        }
    }
}

/// Run `body` with the interface administratively up, restoring the prior
/// down state afterwards.  The restore happens even when `body` fails; a
/// restore failure only surfaces when `body` itself succeeded.
fn with_interface_up<T>(
    device: &dyn DeviceControl,
    interface: &str,
    settle: Duration,
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let was_up = device.link_is_up(interface)?;
    if !was_up {
        device.set_link(interface, LinkState::Up)?;
        // Give the hardware a chance to catch up before probing.
        thread::sleep(settle);
    }

    let result = body();

    if !was_up {
        match device.set_link(interface, LinkState::Down) {
            Ok(()) => {}
            Err(restore_err) => {
                if result.is_ok() {
                    return Err(restore_err);
                }
                log::warn!(
                    "Failed to restore {} to down after probe failure: {}",
                    interface,
                    restore_err
                );
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{RadioSetting, RadioState};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Probe-only device fake: a fixed set of claimed addresses, a call log
    /// for the link transitions, and an optional hard probe failure.
    struct FakeProbe {
        claimed: HashSet<Ipv4Addr>,
        up: bool,
        probe_fails: bool,
        log: Mutex<Vec<String>>,
    }

    impl FakeProbe {
        fn new(claimed: &[Ipv4Addr], up: bool) -> Self {
            Self {
                claimed: claimed.iter().copied().collect(),
                up,
                probe_fails: false,
                log: Mutex::new(Vec::new()),
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl DeviceControl for FakeProbe {
        fn set_link(&self, interface: &str, state: LinkState) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("link {} {:?}", interface, state));
            Ok(())
        }

        fn link_is_up(&self, _interface: &str) -> Result<bool> {
            Ok(self.up)
        }

        fn apply_radio(&self, _interface: &str, _setting: &RadioSetting) -> Result<()> {
            unreachable!("allocation never touches radio parameters")
        }

        fn read_radio(&self, _interface: &str) -> Result<RadioState> {
            unreachable!("allocation never touches radio parameters")
        }

        fn assign_address(
            &self,
            _interface: &str,
            _address: Ipv4Addr,
            _netmask: Option<Ipv4Addr>,
        ) -> Result<()> {
            unreachable!("allocation never assigns addresses")
        }

        fn probe_address(&self, interface: &str, address: Ipv4Addr) -> Result<bool> {
            if self.probe_fails {
                return Err(MeshconfError::ProbeExecution("interface gone".into()).into());
            }
            self.log
                .lock()
                .unwrap()
                .push(format!("probe {} {}", interface, address));
            Ok(self.claimed.contains(&address))
        }

        fn reload_dnsmasq(&self) -> Result<()> {
            unreachable!("allocation never reloads dnsmasq")
        }
    }

    fn budget() -> Duration {
        Duration::from_secs(5)
    }

    #[test]
    fn never_returns_a_claimed_address() {
        let claimed: Vec<Ipv4Addr> = (1..=254).map(|h| Ipv4Addr::new(192, 168, 0, h)).collect();
        let device = FakeProbe::new(&claimed, true);

        for _ in 0..50 {
            let addr =
                allocate_mesh(&device, "wlan0", Duration::ZERO, budget()).unwrap();
            assert!(!claimed.contains(&addr), "allocator returned claimed {}", addr);
            let octets = addr.octets();
            assert_eq!((octets[0], octets[1]), (192, 168));
            assert!((1..=254).contains(&octets[3]));
        }
    }

    #[test]
    fn client_addresses_end_in_dot_one() {
        let device = FakeProbe::new(&[], true);
        for _ in 0..20 {
            let addr = allocate_client(&device, "wlan0:1", Duration::ZERO, budget()).unwrap();
            let octets = addr.octets();
            assert_eq!(octets[0], 10);
            assert_eq!(octets[3], 1);
        }
    }

    #[test]
    fn client_probe_runs_on_the_raw_interface() {
        let device = FakeProbe::new(&[], true);
        allocate_client(&device, "wlan0:1", Duration::ZERO, budget()).unwrap();
        for entry in device.log() {
            assert!(entry.starts_with("probe wlan0 "), "probed wrong device: {}", entry);
        }
    }

    #[test]
    fn down_interface_is_raised_and_restored() {
        let device = FakeProbe::new(&[], false);
        allocate_mesh(&device, "wlan0", Duration::ZERO, budget()).unwrap();

        let log = device.log();
        assert_eq!(log.first().map(String::as_str), Some("link wlan0 Up"));
        assert_eq!(log.last().map(String::as_str), Some("link wlan0 Down"));
    }

    #[test]
    fn down_state_is_restored_even_when_the_probe_fails() {
        let mut device = FakeProbe::new(&[], false);
        device.probe_fails = true;

        let err = allocate_mesh(&device, "wlan0", Duration::ZERO, budget()).unwrap_err();
        assert!(err.downcast_ref::<MeshconfError>().is_some());

        let log = device.log();
        assert_eq!(log, vec!["link wlan0 Up", "link wlan0 Down"]);
    }

    #[test]
    fn up_interface_is_left_alone() {
        let device = FakeProbe::new(&[], true);
        allocate_mesh(&device, "wlan0", Duration::ZERO, budget()).unwrap();
        assert!(device.log().iter().all(|e| !e.starts_with("link")));
    }

    #[test]
    fn exhausted_budget_is_a_distinct_error() {
        // Everything is claimed; the zero budget forces immediate exhaustion.
        struct AllClaimed;
        impl DeviceControl for AllClaimed {
            fn set_link(&self, _: &str, _: LinkState) -> Result<()> {
                Ok(())
            }
            fn link_is_up(&self, _: &str) -> Result<bool> {
                Ok(true)
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
                Ok(true)
            }
            fn reload_dnsmasq(&self) -> Result<()> {
                unreachable!()
            }
        }

        let err = allocate_mesh(&AllClaimed, "wlan0", Duration::ZERO, Duration::ZERO).unwrap_err();
        match err.downcast_ref::<MeshconfError>() {
            Some(MeshconfError::AllocationTimeout { pool, .. }) => assert_eq!(pool, "mesh"),
            other => panic!("expected AllocationTimeout, got {:?}", other),
        }
    }

    #[test]
    fn raw_interface_strips_alias_suffix() {
        assert_eq!(raw_interface("wlan0:1"), "wlan0");
        assert_eq!(raw_interface("wlan0"), "wlan0");
    }
}
