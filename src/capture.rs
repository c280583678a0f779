//! Kernel memory stats, process/VMO snapshotting, and the rooted-VMO
//! committed-byte reallocation pass (§3, §4.2 of the design).

use std::collections::HashMap;

use thiserror::Error;

use crate::os::{Os, OsError, VmoInfo};

/// Opaque kernel object identifier. Never reused within a boot, so it is safe
/// to use as a hash map key without any aliasing concerns.
pub type Koid = u64;

/// The koid reserved for the synthetic kernel [`crate::summary::ProcessSummary`].
pub const KERNEL_KOID: Koid = 1;

/// Default set of VMO names whose committed bytes get redistributed onto
/// their named descendants for clearer reporting (§4.2).
pub const DEFAULT_ROOTED_VMO_NAMES: &[&str] =
    &["SysmemContiguousPool", "SysmemAmlogicProtectedPool", "Sysmem-core"];

/// The level of detail a [`Capture`] was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureLevel {
    /// Kernel memory stats only; cheap enough to poll at high frequency.
    Kmem,
    /// Kernel stats plus the process list, without per-process VMOs.
    Process,
    /// Kernel stats, processes, and every VMO referenced by them.
    Vmo,
}

/// Non-extended kernel memory accounting, always present on a capture taken
/// above [`CaptureLevel::Kmem`]... and present at `Kmem` level too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub total: u64,
    pub free: u64,
    pub wired: u64,
    pub total_heap: u64,
    pub free_heap: u64,
    pub vmo: u64,
    pub mmu_overhead: u64,
    pub ipc: u64,
    pub other: u64,
}

/// Extended kernel memory accounting, queried only for [`CaptureLevel::Process`]
/// and [`CaptureLevel::Vmo`] captures since it is a more expensive syscall.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedKernelStats {
    pub vmo_pager_total: u64,
    pub vmo_pager_newest: u64,
    pub vmo_pager_oldest: u64,
    pub vmo_discardable_locked: u64,
    pub vmo_discardable_unlocked: u64,
}

/// A process present in a capture.
#[derive(Debug, Clone)]
pub struct Process {
    pub koid: Koid,
    pub name: String,
    pub vmos: Vec<Koid>,
}

/// A VMO present in a capture.
#[derive(Debug, Clone)]
pub struct Vmo {
    pub koid: Koid,
    pub parent_koid: Option<Koid>,
    pub name: String,
    pub committed_bytes: u64,
    pub allocated_bytes: u64,
    pub num_children: u32,
    pub(crate) children: Vec<Koid>,
}

impl Vmo {
    fn from_info(info: VmoInfo) -> Self {
        Self {
            koid: info.koid,
            parent_koid: info.parent_koid,
            name: info.name,
            committed_bytes: info.committed_bytes,
            allocated_bytes: info.allocated_bytes,
            num_children: info.num_children,
            children: Vec::new(),
        }
    }
}

/// A single consistent snapshot of kernel stats, the process tree, and every
/// VMO those processes reference. Immutable after construction, aside from
/// the one-shot reallocation pass run during [`Capture::capture`].
#[derive(Debug, Clone)]
pub struct Capture {
    pub time_ns: u64,
    pub kmem: KernelStats,
    pub kmem_ext: Option<ExtendedKernelStats>,
    pub processes: HashMap<Koid, Process>,
    pub vmos: HashMap<Koid, Vmo>,
    pub roots: Vec<Koid>,
}

/// Failure taxonomy at the Capture/Os boundary (§7). Every variant other than
/// construction bugs comes from a bubbled-up [`OsError`]; `BAD_STATE`-shaped
/// per-object failures are swallowed by the caller and never reach here.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("kernel stats capability unreachable: {0}")]
    KernelStatsUnreachable(#[source] OsError),
    #[error("failed to walk process tree: {0}")]
    ProcessWalk(#[source] OsError),
}

impl Capture {
    /// Builds a capture at the requested detail level, then runs the
    /// rooted-VMO reallocation pass at [`CaptureLevel::Vmo`].
    pub fn capture(
        os: &mut dyn Os,
        level: CaptureLevel,
        rooted_vmo_names: &[String],
    ) -> Result<Self, CaptureError> {
        let time_ns = os.monotonic_now();

        if level == CaptureLevel::Kmem {
            let kmem = os
                .kernel_stats()
                .map_err(CaptureError::KernelStatsUnreachable)?;
            return Ok(Self {
                time_ns,
                kmem,
                kmem_ext: None,
                processes: HashMap::new(),
                vmos: HashMap::new(),
                roots: Vec::new(),
            });
        }

        let (kmem_ext, kmem) = os
            .kernel_stats_extended()
            .map_err(CaptureError::KernelStatsUnreachable)?;

        let mut capture = Self {
            time_ns,
            kmem,
            kmem_ext: Some(kmem_ext),
            processes: HashMap::new(),
            vmos: HashMap::new(),
            roots: Vec::new(),
        };

        // Phase one: walk the process tree into a plain koid list. Kept
        // separate from the per-process property/VMO reads below so the
        // walk callback doesn't need a second mutable borrow of `os`.
        let self_koid = os.process_self();
        let mut koids = Vec::new();
        os.walk_processes(&mut |_depth, koid, _parent_koid| {
            if koid != self_koid {
                koids.push(koid);
            }
        })
        .map_err(CaptureError::ProcessWalk)?;

        // Phase two: per-process property/VMO reads. `BAD_STATE` means the
        // process went away mid-walk and is silently skipped (§4.2); any
        // other error is fatal and aborts the capture.
        for koid in koids {
            let name = match os.process_name(koid).map_err(CaptureError::ProcessWalk)? {
                Some(name) => name,
                None => continue,
            };
            let vmo_infos = match os.process_vmos(koid).map_err(CaptureError::ProcessWalk)? {
                Some(vmos) => vmos,
                None => continue,
            };

            // Dedup by koid: the OS may report the same VMO twice if the
            // process holds multiple handles to it. First occurrence wins.
            let mut unique: Vec<VmoInfo> = Vec::with_capacity(vmo_infos.len());
            for info in vmo_infos {
                if !unique.iter().any(|v| v.koid == info.koid) {
                    unique.push(info);
                }
            }

            let mut process_vmos = Vec::with_capacity(unique.len());
            for info in unique {
                process_vmos.push(info.koid);
                capture.vmos.entry(info.koid).or_insert_with(|| Vmo::from_info(info));
            }
            capture.processes.insert(koid, Process {
                koid,
                name,
                vmos: process_vmos,
            });
        }

        capture.reallocate_descendants(rooted_vmo_names);
        Ok(capture)
    }

    pub fn process_for_koid(&self, koid: Koid) -> Option<&Process> {
        self.processes.get(&koid)
    }

    pub fn vmo_for_koid(&self, koid: Koid) -> Option<&Vmo> {
        self.vmos.get(&koid)
    }

    /// Pushes committed bytes from each rooted pool VMO down onto its named
    /// descendants (§4.2). `child.committed_bytes` is *overwritten*, not
    /// accumulated — this mirrors the reference implementation exactly and is
    /// recorded as an explicit Open Question decision rather than "fixed".
    fn reallocate_descendants(&mut self, rooted_vmo_names: &[String]) {
        // Build the children lists and the root set. A parent koid absent
        // from the map is treated as "no edge" (the child becomes a root).
        let koids: Vec<Koid> = self.vmos.keys().copied().collect();
        for koid in &koids {
            let (parent_koid, is_root) = {
                let vmo = &self.vmos[koid];
                match vmo.parent_koid {
                    None => (None, true),
                    Some(parent) if self.vmos.contains_key(&parent) => (Some(parent), false),
                    Some(_) => (None, true),
                }
            };
            if is_root {
                self.roots.push(*koid);
            } else if let Some(parent) = parent_koid {
                self.vmos.get_mut(&parent).unwrap().children.push(*koid);
            }
        }

        let roots = self.roots.clone();
        for root_koid in roots {
            let name_matches = rooted_vmo_names
                .iter()
                .any(|name| name == &self.vmos[&root_koid].name);
            if name_matches {
                self.reallocate_from(root_koid, &mut Vec::new());
            }
        }
    }

    /// Recursively pushes `parent`'s committed bytes onto its children,
    /// `min(parent.committed_bytes, child.allocated_bytes)` at a time, in
    /// insertion order. `visiting` is the current path from the root and is
    /// used to fail fast on a cycle, which would indicate a structural bug
    /// rather than a condition callers should recover from.
    fn reallocate_from(&mut self, parent_koid: Koid, visiting: &mut Vec<Koid>) {
        assert!(
            !visiting.contains(&parent_koid),
            "cycle detected in VMO parent/child graph at koid {parent_koid}"
        );
        visiting.push(parent_koid);

        let children = self.vmos[&parent_koid].children.clone();
        for child_koid in children {
            if self.vmos[&child_koid].parent_koid != Some(parent_koid) {
                continue;
            }
            let reallocated = {
                let parent = &self.vmos[&parent_koid];
                let child = &self.vmos[&child_koid];
                parent.committed_bytes.min(child.allocated_bytes)
            };
            self.vmos.get_mut(&parent_koid).unwrap().committed_bytes -= reallocated;
            self.vmos.get_mut(&child_koid).unwrap().committed_bytes = reallocated;
            self.reallocate_from(child_koid, visiting);
        }

        visiting.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::test_os::TestOs;

    fn rooted() -> Vec<String> {
        DEFAULT_ROOTED_VMO_NAMES.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn s1_rooted_reallocation() {
        // VMOs {1:"R1",committed=100}, {2:"C1",size=50,parent=1},
        // {3:"C2",size=25,parent=2}; rooted names ["R1"].
        let mut os = TestOs::new(100);
        os.push_kmem(KernelStats::default());
        os.add_vmo(1, None, "R1", 100, 100);
        os.add_vmo(2, Some(1), "C1", 0, 50);
        os.add_vmo(3, Some(2), "C2", 0, 25);
        os.add_process(10, "p1", &[1, 2, 3]);

        let capture =
            Capture::capture(&mut os, CaptureLevel::Vmo, &["R1".to_string()]).unwrap();
        assert_eq!(capture.vmos[&1].committed_bytes, 50);
        assert_eq!(capture.vmos[&2].committed_bytes, 25);
        assert_eq!(capture.vmos[&3].committed_bytes, 25);
    }

    #[test]
    fn reallocation_never_increases_total_committed_bytes() {
        let mut os = TestOs::new(100);
        os.push_kmem(KernelStats::default());
        os.add_vmo(1, None, "SysmemContiguousPool", 200, 200);
        os.add_vmo(2, Some(1), "child-a", 0, 60);
        os.add_vmo(3, Some(1), "child-b", 0, 90);
        os.add_process(10, "p1", &[1, 2, 3]);

        let before: u64 = [200u64, 0, 0].iter().sum();
        let capture = Capture::capture(&mut os, CaptureLevel::Vmo, &rooted()).unwrap();
        let after: u64 = capture.vmos.values().map(|v| v.committed_bytes).sum();
        assert!(after <= before);
        // 60 then 90 claimed in insertion order, leaving 50 on the parent.
        assert_eq!(capture.vmos[&1].committed_bytes, 50);
        assert_eq!(capture.vmos[&2].committed_bytes, 60);
        assert_eq!(capture.vmos[&3].committed_bytes, 90);
    }

    #[test]
    fn parent_absent_from_map_is_treated_as_root() {
        let mut os = TestOs::new(100);
        os.push_kmem(KernelStats::default());
        os.add_vmo(2, Some(999), "orphan", 10, 10);
        os.add_process(10, "p1", &[2]);

        let capture = Capture::capture(&mut os, CaptureLevel::Vmo, &rooted()).unwrap();
        assert_eq!(capture.roots, vec![2]);
    }

    #[test]
    fn kmem_level_skips_process_and_vmo_walk() {
        let mut os = TestOs::new(100);
        os.push_kmem(KernelStats {
            total: 1000,
            free: 500,
            ..Default::default()
        });
        let capture = Capture::capture(&mut os, CaptureLevel::Kmem, &rooted()).unwrap();
        assert!(capture.processes.is_empty());
        assert!(capture.vmos.is_empty());
        assert_eq!(capture.kmem.free, 500);
        assert!(capture.kmem_ext.is_none());
    }
}
