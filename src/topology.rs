//! Topology allocator: host core registry plus exclusive, NUMA-aware CPU
//! core allocation for `vm.start`. A single `Mutex`-guarded struct holds
//! all mutable state rather than a lock per field.

use crate::error::{EngineError, EngineResult};
use crate::types::HostCore;
use std::collections::HashMap;
use std::sync::Mutex;

struct State {
    cores: Vec<HostCore>,
    /// vm identity -> core ids currently held exclusively by it.
    allocations: HashMap<String, Vec<u32>>,
}

pub struct TopologyAllocator {
    state: Mutex<State>,
}

impl TopologyAllocator {
    pub fn new() -> Self {
        TopologyAllocator {
            state: Mutex::new(State {
                cores: Vec::new(),
                allocations: HashMap::new(),
            }),
        }
    }

    /// Registers a host core. Idempotent on `id` so that topology discovery
    /// can be re-run without accumulating duplicates.
    pub fn add_core(&self, id: u32, numa_node: u32, isolated: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.cores.iter_mut().find(|c| c.id == id) {
            existing.numa_node = numa_node;
            existing.isolated = isolated;
            return;
        }
        state.cores.push(HostCore {
            id,
            numa_node,
            isolated,
        });
    }

    fn occupied(state: &State) -> std::collections::HashSet<u32> {
        state
            .allocations
            .values()
            .flatten()
            .copied()
            .collect::<std::collections::HashSet<u32>>()
    }

    /// Allocates `count` distinct, currently-free **isolated** cores on
    /// `numa_node` if given, ties broken by ascending core id for
    /// determinism. Only cores marked `isolated=true` are eligible for
    /// exclusive pinning; non-isolated cores are never candidates,
    /// regardless of how many are free. A node request never spills onto
    /// another node: if that node doesn't have enough free isolated cores
    /// this fails, even when other nodes do.
    pub fn allocate_exclusive(
        &self,
        vm_id: &str,
        numa_node: Option<u32>,
        count: u32,
    ) -> EngineResult<Vec<u32>> {
        let mut state = self.state.lock().unwrap();
        if state.allocations.contains_key(vm_id) {
            return Err(EngineError::Internal(format!(
                "vm {} already holds a core allocation",
                vm_id
            )));
        }

        let occupied = Self::occupied(&state);
        let mut candidates: Vec<HostCore> = state
            .cores
            .iter()
            .filter(|c| {
                c.isolated
                    && !occupied.contains(&c.id)
                    && numa_node.map_or(true, |n| c.numa_node == n)
            })
            .copied()
            .collect();

        candidates.sort_by_key(|c| c.id);

        if (candidates.len() as u32) < count {
            return Err(EngineError::ResourceExhausted(
                "Not enough isolated CPU cores available.".to_string(),
            ));
        }

        let chosen: Vec<u32> = candidates
            .into_iter()
            .take(count as usize)
            .map(|c| c.id)
            .collect();
        state
            .allocations
            .insert(vm_id.to_string(), chosen.clone());
        Ok(chosen)
    }

    /// Releases whatever cores `vm_id` holds, if any. Idempotent: freeing
    /// a VM with no allocation is a no-op, not an error (self-heal may race
    /// a normal stop handler that already freed it).
    pub fn free_vm(&self, vm_id: &str) -> Vec<u32> {
        let mut state = self.state.lock().unwrap();
        state.allocations.remove(vm_id).unwrap_or_default()
    }

    pub fn allocation_for(&self, vm_id: &str) -> Option<Vec<u32>> {
        let state = self.state.lock().unwrap();
        state.allocations.get(vm_id).cloned()
    }

    /// VM identities currently holding a core allocation. Used by the
    /// self-heal daemon to find allocations that may need releasing after
    /// an out-of-band stop.
    pub fn allocated_vm_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.allocations.keys().cloned().collect()
    }
}

impl Default for TopologyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Scans `/sys/devices/system/node/nodeN/cpuM` for the real host topology,
/// marking a core isolated iff it appears in
/// `/sys/devices/system/cpu/isolated` (the kernel's `isolcpus=` cmdline
/// range list).
pub fn scan_host_topology() -> Vec<HostCore> {
    let isolated = read_isolated_set();
    let mut cores = Vec::new();

    let node_root = std::fs::read_dir("/sys/devices/system/node");
    if let Ok(entries) = node_root {
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            let numa_node = match name.strip_prefix("node").and_then(|s| s.parse::<u32>().ok()) {
                Some(n) => n,
                None => continue,
            };
            if let Ok(cpu_entries) = std::fs::read_dir(entry.path()) {
                for cpu_entry in cpu_entries.flatten() {
                    let cpu_file_name = cpu_entry.file_name();
                    let cpu_name = cpu_file_name.to_string_lossy();
                    if let Some(id) = cpu_name.strip_prefix("cpu").and_then(|s| s.parse::<u32>().ok()) {
                        cores.push(HostCore {
                            id,
                            numa_node,
                            isolated: isolated.contains(&id),
                        });
                    }
                }
            }
        }
    }

    cores.sort_by_key(|c| c.id);
    cores
}

fn read_isolated_set() -> std::collections::HashSet<u32> {
    let mut set = std::collections::HashSet::new();
    if let Ok(content) = std::fs::read_to_string("/sys/devices/system/cpu/isolated") {
        for range in content.trim().split(',') {
            if range.is_empty() {
                continue;
            }
            match range.split_once('-') {
                Some((start, end)) => {
                    if let (Ok(s), Ok(e)) = (start.parse::<u32>(), end.parse::<u32>()) {
                        for i in s..=e {
                            set.insert(i);
                        }
                    }
                }
                None => {
                    if let Ok(v) = range.parse::<u32>() {
                        set.insert(v);
                    }
                }
            }
        }
    }
    set
}

/// Deterministic stand-in topology for development/CI hosts with no real
/// NUMA hardware, populated via the `--fake-topology` override. Every core
/// is marked isolated so the allocator is exercisable without an
/// `isolcpus=` kernel cmdline.
pub fn fake_topology(num_cores: u32, numa_nodes: u32) -> Vec<HostCore> {
    let numa_nodes = numa_nodes.max(1);
    (0..num_cores)
        .map(|id| HostCore {
            id,
            numa_node: id % numa_nodes,
            isolated: true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    /// Two isolated, two housekeeping cores split across two NUMA nodes.
    fn four_core_topology() -> TopologyAllocator {
        let t = TopologyAllocator::new();
        t.add_core(0, 0, false);
        t.add_core(1, 0, true);
        t.add_core(2, 1, false);
        t.add_core(3, 1, true);
        t
    }

    /// Four isolated cores split across two NUMA nodes, no housekeeping
    /// cores. Used by tests that need more than 2 isolated cores to
    /// allocate from.
    fn all_isolated_topology(num_cores: u32) -> TopologyAllocator {
        let t = TopologyAllocator::new();
        for id in 0..num_cores {
            t.add_core(id, id % 2, true);
        }
        t
    }

    #[test]
    fn allocates_within_preferred_numa_node() {
        let t = four_core_topology();
        let cores = t.allocate_exclusive("vm-a", Some(0), 1).unwrap();
        assert_eq!(cores, vec![1]);
    }

    #[test]
    fn requested_numa_node_never_spills_onto_another_node() {
        let t = TopologyAllocator::new();
        t.add_core(0, 0, true);
        t.add_core(1, 1, true);
        let err = t.allocate_exclusive("vm", Some(0), 2).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted(_)));
    }

    #[test]
    fn non_isolated_cores_are_never_eligible() {
        let t = four_core_topology();
        // Only cores 1 and 3 are isolated; a request for 3 cores must fail
        // even though 4 cores exist and none are allocated yet.
        let err = t.allocate_exclusive("vm-a", None, 3).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted(_)));
    }

    #[test]
    fn exhaustion_when_insufficient_free_isolated_cores() {
        let t = four_core_topology();
        t.allocate_exclusive("vm-a", None, 2).unwrap();
        let err = t.allocate_exclusive("vm-b", None, 1).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted(_)));
    }

    #[test]
    fn free_then_reallocate_reuses_cores() {
        let t = all_isolated_topology(4);
        t.allocate_exclusive("vm-a", None, 4).unwrap();
        assert!(t.allocate_exclusive("vm-b", None, 1).is_err());
        t.free_vm("vm-a");
        let cores = t.allocate_exclusive("vm-b", None, 4).unwrap();
        assert_eq!(cores.len(), 4);
    }

    #[test]
    fn free_vm_with_no_allocation_is_noop() {
        let t = four_core_topology();
        assert_eq!(t.free_vm("never-allocated"), Vec::<u32>::new());
    }

    #[test]
    fn concurrent_allocations_never_overlap() {
        let t = Arc::new(all_isolated_topology(4));
        let mut handles = Vec::new();
        for i in 0..4 {
            let t = Arc::clone(&t);
            handles.push(thread::spawn(move || {
                t.allocate_exclusive(&format!("vm-{}", i), None, 1)
            }));
        }
        let mut all_cores = Vec::new();
        for h in handles {
            if let Ok(cores) = h.join().unwrap() {
                all_cores.extend(cores);
            }
        }
        all_cores.sort_unstable();
        all_cores.dedup();
        assert_eq!(all_cores.len(), 4);
    }

    #[test]
    fn fake_topology_is_fully_isolated_and_spread_across_nodes() {
        let cores = fake_topology(4, 2);
        assert_eq!(cores.len(), 4);
        assert!(cores.iter().all(|c| c.isolated));
        assert_eq!(cores.iter().filter(|c| c.numa_node == 0).count(), 2);
        assert_eq!(cores.iter().filter(|c| c.numa_node == 1).count(), 2);
    }
}
