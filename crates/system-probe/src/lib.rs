//! Best-effort resource probing a worker performs before its first `RESOURCE_REPORT`.
//!
//! Every call here is synchronous and allowed to be wrong: a worker never blocks waiting for an
//! "accurate" reading, and the only validated value is that `hardware_threads() >= 1`.

use std::net::{Ipv4Addr, UdpSocket};

use sysinfo::System;
use tracing::warn;

pub trait SystemProbe: Send + Sync {
    fn free_ram_mb(&self) -> u64;
    fn total_ram_mb(&self) -> u64;
    fn hardware_threads(&self) -> u32;
    fn local_ip_v4(&self) -> Ipv4Addr;
}

/// Reads live OS counters through `sysinfo` and `std::thread::available_parallelism`.
pub struct OsSystemProbe {
    system: std::sync::Mutex<System>,
}

impl OsSystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            system: std::sync::Mutex::new(system),
        }
    }
}

impl Default for OsSystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for OsSystemProbe {
    fn free_ram_mb(&self) -> u64 {
        let mut system = self.system.lock().unwrap();
        system.refresh_memory();
        system.available_memory() / (1024 * 1024)
    }

    fn total_ram_mb(&self) -> u64 {
        let mut system = self.system.lock().unwrap();
        system.refresh_memory();
        system.total_memory() / (1024 * 1024)
    }

    fn hardware_threads(&self) -> u32 {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
            .max(1)
    }

    fn local_ip_v4(&self) -> Ipv4Addr {
        // Connecting a UDP socket performs no handshake; it just asks the OS to pick the
        // outbound interface, which tells us the routable local address.
        let probe = || -> std::io::Result<Ipv4Addr> {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.connect("8.8.8.8:80")?;
            match socket.local_addr()?.ip() {
                std::net::IpAddr::V4(addr) => Ok(addr),
                std::net::IpAddr::V6(_) => Ok(Ipv4Addr::UNSPECIFIED),
            }
        };
        probe().unwrap_or_else(|err| {
            warn!(%err, "could not determine a routable local IPv4 address");
            Ipv4Addr::UNSPECIFIED
        })
    }
}

/// Deterministic stand-in for tests: every reading is fixed at construction time.
#[derive(Debug, Clone, Copy)]
pub struct FakeSystemProbe {
    pub free_ram_mb: u64,
    pub total_ram_mb: u64,
    pub hardware_threads: u32,
    pub local_ip_v4: Ipv4Addr,
}

impl FakeSystemProbe {
    pub fn new(free_ram_mb: u64, total_ram_mb: u64, hardware_threads: u32) -> Self {
        Self {
            free_ram_mb,
            total_ram_mb,
            hardware_threads: hardware_threads.max(1),
            local_ip_v4: Ipv4Addr::new(127, 0, 0, 1),
        }
    }
}

impl SystemProbe for FakeSystemProbe {
    fn free_ram_mb(&self) -> u64 {
        self.free_ram_mb
    }

    fn total_ram_mb(&self) -> u64 {
        self.total_ram_mb
    }

    fn hardware_threads(&self) -> u32 {
        self.hardware_threads
    }

    fn local_ip_v4(&self) -> Ipv4Addr {
        self.local_ip_v4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn fake_probe_reports_fixed_values() {
        let probe = FakeSystemProbe::new(1024, 4096, 4);
        assert_eq!(probe.free_ram_mb(), 1024);
        assert_eq!(probe.total_ram_mb(), 4096);
        assert_eq!(probe.hardware_threads(), 4);
    }

    #[test]
    fn fake_probe_clamps_thread_count_to_at_least_one() {
        let probe = FakeSystemProbe::new(0, 0, 0);
        assert_eq!(probe.hardware_threads(), 1);
    }

    #[test]
    fn os_probe_reports_at_least_one_hardware_thread() {
        let probe = OsSystemProbe::new();
        assert!(probe.hardware_threads() >= 1);
    }
}
