//! Process-level memory accounting with sharing-scaled sizes (§4.2).

use std::collections::{HashMap, HashSet};

use crate::capture::{Capture, Koid, KERNEL_KOID};

/// Three views of the same memory: `private` counts only bytes with a single
/// owner, `scaled` divides shared bytes across their owners, `total` counts
/// every committed byte regardless of sharing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sizes {
    pub private_bytes: u64,
    pub scaled_bytes: u64,
    pub total_bytes: u64,
}

impl Sizes {
    fn add_share(&mut self, committed_bytes: u64, share_count: u64) {
        self.total_bytes += committed_bytes;
        if share_count <= 1 {
            self.private_bytes += committed_bytes;
            self.scaled_bytes += committed_bytes;
        } else {
            self.scaled_bytes += committed_bytes / share_count;
        }
    }
}

/// One process's (or the synthetic kernel's) share of memory, broken down
/// both in aggregate and per distinctly-named VMO.
pub struct ProcessSummary {
    pub koid: Koid,
    pub name: String,
    pub sizes: Sizes,
    pub name_to_sizes: HashMap<String, Sizes>,
}

/// A point-in-time accounting of every process's memory, derived from a
/// [`Capture`]. Built in two passes: first a VMO koid → owning-process-koid
/// multimap is assembled by walking each process's vmo list (a VMO can be
/// directly held by more than one process, hence "multi"), then each
/// process's sizes are computed from the multimap's per-VMO share counts.
pub struct Summary {
    pub time_ns: u64,
    pub processes: Vec<ProcessSummary>,
    pub kmem_vmo_bytes: u64,
    pub free_bytes: u64,
}

impl Summary {
    #[must_use]
    pub fn from_capture(capture: &Capture) -> Self {
        // Pass one: for each process, walk each directly-held VMO's parent
        // chain, collecting every traversed koid into that process's VMO
        // set and into the vmo -> owning-processes multimap. Stops at the
        // "none" sentinel or a parent absent from the capture (§4.4).
        let mut process_vmo_sets: HashMap<Koid, HashSet<Koid>> =
            HashMap::with_capacity(capture.processes.len());
        let mut vmo_to_processes: HashMap<Koid, Vec<Koid>> = HashMap::new();

        for process in capture.processes.values() {
            let mut vmo_set = HashSet::new();
            for &direct_koid in &process.vmos {
                let mut current = Some(direct_koid);
                while let Some(koid) = current {
                    if !vmo_set.insert(koid) {
                        break;
                    }
                    vmo_to_processes.entry(koid).or_default().push(process.koid);
                    current = capture.vmos.get(&koid).and_then(|vmo| vmo.parent_koid);
                }
            }
            process_vmo_sets.insert(process.koid, vmo_set);
        }

        // Pass two: the multimap now holds each VMO's full sharing set, so
        // per-process sizes can be computed independently of pass one.
        let mut processes = Vec::with_capacity(capture.processes.len() + 1);
        for process in capture.processes.values() {
            let mut summary = ProcessSummary {
                koid: process.koid,
                name: process.name.clone(),
                sizes: Sizes::default(),
                name_to_sizes: HashMap::new(),
            };
            for &vmo_koid in &process_vmo_sets[&process.koid] {
                let Some(vmo) = capture.vmos.get(&vmo_koid) else { continue };
                let share_count = vmo_to_processes.get(&vmo_koid).map_or(1, Vec::len) as u64;
                summary.sizes.add_share(vmo.committed_bytes, share_count);
                summary
                    .name_to_sizes
                    .entry(vmo.name.clone())
                    .or_default()
                    .add_share(vmo.committed_bytes, share_count);
            }
            processes.push(summary);
        }

        let captured_vmo_bytes: u64 = capture.vmos.values().map(|vmo| vmo.committed_bytes).sum();
        let kmem_vmo_bytes = capture.kmem.vmo.saturating_sub(captured_vmo_bytes);
        processes.push(kernel_summary(capture, kmem_vmo_bytes));

        Self { time_ns: capture.time_ns, processes, kmem_vmo_bytes, free_bytes: capture.kmem.free }
    }
}

fn kernel_summary(capture: &Capture, kmem_vmo_bytes: u64) -> ProcessSummary {
    let kmem = &capture.kmem;
    let mut name_to_sizes = HashMap::new();
    for (name, bytes) in [
        ("heap", kmem.total_heap),
        ("wired", kmem.wired),
        ("mmu", kmem.mmu_overhead),
        ("ipc", kmem.ipc),
        ("other", kmem.other),
        ("vmo", kmem_vmo_bytes),
    ] {
        name_to_sizes.insert(
            name.to_string(),
            Sizes { private_bytes: bytes, scaled_bytes: bytes, total_bytes: bytes },
        );
    }
    let total: u64 = name_to_sizes.values().map(|s| s.total_bytes).sum();
    ProcessSummary {
        koid: KERNEL_KOID,
        name: "kernel".to_string(),
        sizes: Sizes { private_bytes: total, scaled_bytes: total, total_bytes: total },
        name_to_sizes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{KernelStats, Process, Vmo};
    use std::collections::HashMap as Map;

    fn vmo(koid: Koid, name: &str, committed: u64) -> Vmo {
        Vmo {
            koid,
            parent_koid: None,
            name: name.to_string(),
            committed_bytes: committed,
            allocated_bytes: committed,
            num_children: 0,
            children: Vec::new(),
        }
    }

    #[test]
    fn parent_chain_is_attributed_to_the_holding_process() {
        // p1 holds only the child (koid 2); its parent (koid 1) must still
        // be walked into p1's VMO set and sized, per §4.4 steps 1-2.
        let mut vmos = Map::new();
        vmos.insert(1, Vmo { parent_koid: None, ..vmo(1, "parent", 40) });
        vmos.insert(2, Vmo { parent_koid: Some(1), ..vmo(2, "child", 10) });
        let mut processes = Map::new();
        processes.insert(10, Process { koid: 10, name: "p1".to_string(), vmos: vec![2] });

        let capture = Capture {
            time_ns: 0,
            kmem: KernelStats::default(),
            kmem_ext: None,
            processes,
            vmos,
            roots: vec![1],
        };
        let summary = Summary::from_capture(&capture);
        let p = summary.processes.iter().find(|p| p.koid == 10).unwrap();
        assert_eq!(p.sizes.total_bytes, 50);
        assert_eq!(p.name_to_sizes["parent"].total_bytes, 40);
        assert_eq!(p.name_to_sizes["child"].total_bytes, 10);
    }

    #[test]
    fn shared_ancestor_is_scaled_across_both_holders() {
        // p1 and p2 each hold distinct children of a common parent; the
        // parent should be shared between them even though neither process
        // directly references it.
        let mut vmos = Map::new();
        vmos.insert(1, Vmo { parent_koid: None, ..vmo(1, "parent", 100) });
        vmos.insert(2, Vmo { parent_koid: Some(1), ..vmo(2, "child-a", 0) });
        vmos.insert(3, Vmo { parent_koid: Some(1), ..vmo(3, "child-b", 0) });
        let mut processes = Map::new();
        processes.insert(10, Process { koid: 10, name: "p1".to_string(), vmos: vec![2] });
        processes.insert(20, Process { koid: 20, name: "p2".to_string(), vmos: vec![3] });

        let capture = Capture {
            time_ns: 0,
            kmem: KernelStats::default(),
            kmem_ext: None,
            processes,
            vmos,
            roots: vec![1],
        };
        let summary = Summary::from_capture(&capture);
        for koid in [10, 20] {
            let p = summary.processes.iter().find(|p| p.koid == koid).unwrap();
            assert_eq!(p.sizes.private_bytes, 0);
            assert_eq!(p.sizes.scaled_bytes, 50);
            assert_eq!(p.sizes.total_bytes, 100);
        }
    }

    #[test]
    fn exclusive_vmo_is_fully_private() {
        let mut vmos = Map::new();
        vmos.insert(1, vmo(1, "heap", 100));
        let mut processes = Map::new();
        processes.insert(10, Process { koid: 10, name: "p".to_string(), vmos: vec![1] });

        let capture = Capture {
            time_ns: 0,
            kmem: KernelStats::default(),
            kmem_ext: None,
            processes,
            vmos,
            roots: Vec::new(),
        };
        let summary = Summary::from_capture(&capture);
        let p = summary.processes.iter().find(|p| p.koid == 10).unwrap();
        assert_eq!(p.sizes, Sizes { private_bytes: 100, scaled_bytes: 100, total_bytes: 100 });
    }

    #[test]
    fn shared_vmo_scales_by_share_count() {
        let mut vmos = Map::new();
        vmos.insert(1, vmo(1, "shared", 90));
        let mut processes = Map::new();
        processes.insert(10, Process { koid: 10, name: "a".to_string(), vmos: vec![1] });
        processes.insert(20, Process { koid: 20, name: "b".to_string(), vmos: vec![1] });
        processes.insert(30, Process { koid: 30, name: "c".to_string(), vmos: vec![1] });

        let capture = Capture {
            time_ns: 0,
            kmem: KernelStats::default(),
            kmem_ext: None,
            processes,
            vmos,
            roots: Vec::new(),
        };
        let summary = Summary::from_capture(&capture);
        for koid in [10, 20, 30] {
            let p = summary.processes.iter().find(|p| p.koid == koid).unwrap();
            assert_eq!(p.sizes.private_bytes, 0);
            assert_eq!(p.sizes.scaled_bytes, 30);
            assert_eq!(p.sizes.total_bytes, 90);
        }
    }

    #[test]
    fn kernel_synthetic_process_accounts_for_uncaptured_vmo_bytes() {
        let capture = Capture {
            time_ns: 0,
            kmem: KernelStats {
                total: 1000,
                free: 100,
                wired: 50,
                total_heap: 20,
                free_heap: 0,
                vmo: 500,
                mmu_overhead: 10,
                ipc: 5,
                other: 1,
            },
            kmem_ext: None,
            processes: Map::new(),
            vmos: Map::new(),
            roots: Vec::new(),
        };
        let summary = Summary::from_capture(&capture);
        let kernel = summary.processes.iter().find(|p| p.koid == KERNEL_KOID).unwrap();
        assert_eq!(kernel.name, "kernel");
        assert_eq!(kernel.name_to_sizes["vmo"].total_bytes, 500);
        assert_eq!(kernel.sizes.total_bytes, 50 + 20 + 10 + 5 + 1 + 500);
    }
}
