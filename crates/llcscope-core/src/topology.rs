//! The vCPU topology view: consumed by the scheduler, produced elsewhere.
//!
//! In a guest, sysfs topology is whatever the hypervisor felt like
//! advertising; the real prober measures coherence latencies between vCPU
//! pairs and lives outside this crate. The core only defines the shape of
//! its answer ([`CpuTopology`]) and the pair-selection logic on top of it.

use serde::{Deserialize, Serialize};

/// Relation between two vCPUs, from closest to farthest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuRelation {
    /// Same physical core, SMT siblings.
    Smt,
    /// Same core complex.
    Core,
    /// Same socket, different cores.
    Socket,
    /// Different sockets.
    Remote,
}

/// Symmetric relation view over all vCPUs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuTopology {
    pub n_cpus: usize,
    /// Socket id per vCPU.
    pub socket_of: Vec<i32>,
    /// Core id per vCPU.
    pub core_of: Vec<i32>,
    /// `relation[i][j]`, with `relation[i][i] == Smt` by convention.
    pub relation: Vec<Vec<CpuRelation>>,
}

/// A main/helper vCPU assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VcpuPair {
    pub main: i32,
    pub helper: i32,
}

/// vCPUs grouped by socket.
#[derive(Debug, Clone, Serialize)]
pub struct SocketInfo {
    pub socket_id: i32,
    pub vcpus: Vec<i32>,
}

/// Source of topology views. The real implementation (the external vTop
/// prober) measures; tests and degraded modes synthesize.
pub trait TopologyProbe: Send + Sync {
    fn probe(&self) -> Option<CpuTopology>;
}

impl CpuTopology {
    /// Construct from per-vCPU (socket, core) ids, deriving the relation
    /// matrix.
    pub fn from_ids(socket_of: Vec<i32>, core_of: Vec<i32>) -> Self {
        assert_eq!(socket_of.len(), core_of.len());
        let n = socket_of.len();
        let mut relation = vec![vec![CpuRelation::Remote; n]; n];
        for i in 0..n {
            for j in 0..n {
                relation[i][j] = if socket_of[i] != socket_of[j] {
                    CpuRelation::Remote
                } else if core_of[i] == core_of[j] {
                    CpuRelation::Smt
                } else {
                    CpuRelation::Socket
                };
            }
        }
        Self {
            n_cpus: n,
            socket_of,
            core_of,
            relation,
        }
    }

    /// vCPUs grouped by socket id, in first-seen order.
    pub fn sockets(&self) -> Vec<SocketInfo> {
        let mut out: Vec<SocketInfo> = Vec::new();
        for cpu in 0..self.n_cpus {
            let sid = self.socket_of[cpu];
            match out.iter_mut().find(|s| s.socket_id == sid) {
                Some(s) => s.vcpus.push(cpu as i32),
                None => out.push(SocketInfo {
                    socket_id: sid,
                    vcpus: vec![cpu as i32],
                }),
            }
        }
        out
    }

    pub fn n_sockets(&self) -> usize {
        self.sockets().len()
    }

    /// One same-socket non-SMT pair anywhere in the machine.
    pub fn find_pair(&self) -> Option<VcpuPair> {
        for i in 0..self.n_cpus {
            for j in 0..self.n_cpus {
                if i == j {
                    continue;
                }
                if self.relation[i][j] == CpuRelation::Socket {
                    return Some(VcpuPair {
                        main: i as i32,
                        helper: j as i32,
                    });
                }
            }
        }
        None
    }

    /// One same-socket non-SMT pair within the given socket.
    pub fn find_pair_on_socket(&self, socket: &SocketInfo) -> Option<VcpuPair> {
        for (a, &v1) in socket.vcpus.iter().enumerate() {
            for &v2 in socket.vcpus.iter().skip(a + 1) {
                if self.relation[v1 as usize][v2 as usize] != CpuRelation::Smt {
                    return Some(VcpuPair { main: v1, helper: v2 });
                }
            }
        }
        None
    }

    /// Up to `n` disjoint same-socket non-SMT pairs, filling socket by
    /// socket. SMT-sibling collisions try to swap in a later vCPU from the
    /// same socket before giving up on the slot.
    pub fn find_pairs(&self, n: usize) -> Vec<VcpuPair> {
        let mut pairs = Vec::new();
        let mut used = vec![false; self.n_cpus];

        for socket in self.sockets() {
            if pairs.len() >= n {
                break;
            }
            let mut vcpus: Vec<i32> = socket
                .vcpus
                .iter()
                .copied()
                .filter(|&v| !used[v as usize])
                .collect();

            let mut i = 0;
            while i + 1 < vcpus.len() && pairs.len() < n {
                let v1 = vcpus[i];
                let mut v2 = vcpus[i + 1];

                if self.relation[v1 as usize][v2 as usize] == CpuRelation::Smt {
                    let mut swapped = false;
                    for j in i + 2..vcpus.len() {
                        let v3 = vcpus[j];
                        if self.relation[v1 as usize][v3 as usize] != CpuRelation::Smt {
                            vcpus.swap(i + 1, j);
                            v2 = v3;
                            swapped = true;
                            break;
                        }
                    }
                    if !swapped {
                        i += 2;
                        continue;
                    }
                }

                pairs.push(VcpuPair { main: v1, helper: v2 });
                used[v1 as usize] = true;
                used[v2 as usize] = true;
                i += 2;
            }
        }
        pairs
    }

    /// Whether an existing pair still satisfies same-socket-non-SMT under
    /// this (new) topology.
    pub fn pair_still_valid(&self, pair: VcpuPair) -> bool {
        let (m, h) = (pair.main as usize, pair.helper as usize);
        if m >= self.n_cpus || h >= self.n_cpus || m == h {
            return false;
        }
        self.relation[m][h] == CpuRelation::Socket
    }
}

/// A probe that always answers with a fixed topology. Used in tests and as
/// the degraded-mode stand-in when the external prober is absent.
pub struct FixedTopology(pub CpuTopology);

impl TopologyProbe for FixedTopology {
    fn probe(&self) -> Option<CpuTopology> {
        Some(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2 sockets × 2 cores × 2 SMT threads: vCPU i has socket i/4 and core
    /// (i/2)%2 + 2*(i/4).
    fn two_socket_smt() -> CpuTopology {
        let socket_of = vec![0, 0, 0, 0, 1, 1, 1, 1];
        let core_of = vec![0, 0, 1, 1, 2, 2, 3, 3];
        CpuTopology::from_ids(socket_of, core_of)
    }

    #[test]
    fn relations_derive_correctly() {
        let t = two_socket_smt();
        assert_eq!(t.relation[0][1], CpuRelation::Smt);
        assert_eq!(t.relation[0][2], CpuRelation::Socket);
        assert_eq!(t.relation[0][4], CpuRelation::Remote);
        assert_eq!(t.relation[2][0], CpuRelation::Socket); // symmetric
    }

    #[test]
    fn sockets_group_in_order() {
        let t = two_socket_smt();
        let sockets = t.sockets();
        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[0].vcpus, vec![0, 1, 2, 3]);
        assert_eq!(sockets[1].socket_id, 1);
        assert_eq!(t.n_sockets(), 2);
    }

    #[test]
    fn find_pair_avoids_smt() {
        let t = two_socket_smt();
        let p = t.find_pair().unwrap();
        assert_eq!(
            t.relation[p.main as usize][p.helper as usize],
            CpuRelation::Socket
        );
    }

    #[test]
    fn find_pairs_are_disjoint_and_valid() {
        let t = two_socket_smt();
        let pairs = t.find_pairs(4);
        // 0/1 are siblings, as are 2/3: the swap logic pairs 0 with 2 and
        // leaves 1 with 3, per socket. Expect 2 pairs per socket.
        assert_eq!(pairs.len(), 4);
        let mut seen = std::collections::HashSet::new();
        for p in &pairs {
            assert!(t.pair_still_valid(*p), "{p:?} invalid");
            assert!(seen.insert(p.main));
            assert!(seen.insert(p.helper));
        }
    }

    #[test]
    fn find_pairs_respects_budget() {
        let t = two_socket_smt();
        assert_eq!(t.find_pairs(1).len(), 1);
        assert_eq!(t.find_pairs(0).len(), 0);
    }

    #[test]
    fn all_smt_socket_yields_no_pair() {
        // One socket where every vCPU shares one core.
        let t = CpuTopology::from_ids(vec![0, 0, 0], vec![0, 0, 0]);
        assert!(t.find_pair().is_none());
        assert!(t.find_pairs(2).is_empty());
    }

    #[test]
    fn pair_validity_tracks_topology_change() {
        let t = two_socket_smt();
        let p = VcpuPair { main: 0, helper: 2 };
        assert!(t.pair_still_valid(p));

        // After a "migration" vCPU 2 lands on vCPU 0's core.
        let t2 = CpuTopology::from_ids(
            vec![0, 0, 0, 0, 1, 1, 1, 1],
            vec![0, 0, 0, 1, 2, 2, 3, 3],
        );
        assert!(!t2.pair_still_valid(p));
        // Out-of-range vCPUs are invalid, not a panic.
        assert!(!t.pair_still_valid(VcpuPair { main: 0, helper: 99 }));
    }

    #[test]
    fn fixed_probe_round_trips() {
        let probe = FixedTopology(two_socket_smt());
        let t = probe.probe().unwrap();
        assert_eq!(t.n_cpus, 8);
    }

    #[test]
    fn topology_serializes() {
        let t = two_socket_smt();
        let json = serde_json::to_string(&t).unwrap();
        let back: CpuTopology = serde_json::from_str(&json).unwrap();
        assert_eq!(back.n_cpus, t.n_cpus);
        assert_eq!(back.relation[0][4], CpuRelation::Remote);
    }
}
