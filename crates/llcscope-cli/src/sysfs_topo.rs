//! Sysfs-backed stand-in for the vCPU topology prober.
//!
//! The real prober measures coherence latencies between vCPU pairs because
//! a hypervisor may advertise any topology it likes. Until that collaborator
//! is wired in, sysfs package/core ids are the best available approximation
//! and carry the same shape of answer.

use anyhow::Context;
use llcscope_core::{CpuTopology, TopologyProbe};

fn read_id(cpu: u32, leaf: &str) -> Option<i32> {
    let path = format!("/sys/devices/system/cpu/cpu{cpu}/topology/{leaf}");
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn probe_sysfs() -> Option<CpuTopology> {
    let n_cpus = llcscope_core::timing::online_cpus();
    let mut socket_of = Vec::with_capacity(n_cpus as usize);
    let mut core_of = Vec::with_capacity(n_cpus as usize);
    for cpu in 0..n_cpus {
        socket_of.push(read_id(cpu, "physical_package_id")?);
        // Core ids repeat across sockets; widen them so (socket, core)
        // pairs stay unique in the flat core table.
        core_of.push(read_id(cpu, "core_id")? + socket_of[cpu as usize] * 4096);
    }
    Some(CpuTopology::from_ids(socket_of, core_of))
}

pub struct SysfsTopologyProbe;

impl TopologyProbe for SysfsTopologyProbe {
    fn probe(&self) -> Option<CpuTopology> {
        probe_sysfs()
    }
}

/// Probe with retries, failing loudly for modes that cannot run without a
/// topology (LCAS).
pub fn probe_or_fail() -> anyhow::Result<CpuTopology> {
    for _ in 0..3 {
        if let Some(t) = probe_sysfs() {
            return Ok(t);
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    probe_sysfs().context("could not read the vCPU topology from sysfs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysfs_probe_on_linux_is_consistent() {
        let Some(t) = SysfsTopologyProbe.probe() else {
            return; // containers without the topology leaves
        };
        assert_eq!(t.n_cpus as u32, llcscope_core::timing::online_cpus());
        assert!(t.n_sockets() >= 1);
    }
}
