//! First-match-wins bucket classification of a [`Capture`]'s VMOs (§4.3, §4.4).

use std::collections::HashSet;

use crate::bucket_match::BucketMatch;
use crate::capture::{Capture, Koid};

/// One named slice of the digest, with its attributed byte total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub name: String,
    pub size: u64,
}

/// The full classification of a capture's memory into named buckets, sorted
/// descending by size, with the synthetic `Undigested`/`Orphaned`/`Kernel`/
/// `Free` tail appended (§4.4).
pub struct Digest {
    pub time_ns: u64,
    pub buckets: Vec<Bucket>,
}

/// Owns the ordered rule list and the per-rule match caches that persist
/// across successive digests of the same process/VMO population (§9: this
/// is the one piece of mutable state the dispatcher's `digester_mutex`
/// exists to guard).
pub struct Digester {
    bucket_matches: Vec<BucketMatch>,
}

impl Digester {
    #[must_use]
    pub fn new(bucket_matches: Vec<BucketMatch>) -> Self {
        Self { bucket_matches }
    }

    /// Classifies every VMO reachable from a process in `capture`, in rule
    /// order: for each rule, for each process it matches, claim that
    /// process's still-unclaimed VMOs matching the rule's VMO pattern. A
    /// VMO claimed by an earlier rule is never reconsidered by a later one.
    pub fn digest(&mut self, capture: &Capture) -> Digest {
        let mut undigested: HashSet<Koid> = capture.vmos.keys().copied().collect();
        let mut buckets = Vec::with_capacity(self.bucket_matches.len());

        for rule in &mut self.bucket_matches {
            let mut size = 0u64;
            for process in capture.processes.values() {
                if !rule.process_match(process) {
                    continue;
                }
                for &vmo_koid in &process.vmos {
                    if !undigested.contains(&vmo_koid) {
                        continue;
                    }
                    let Some(vmo) = capture.vmos.get(&vmo_koid) else { continue };
                    if rule.vmo_match(&vmo.name) {
                        size += vmo.committed_bytes;
                        undigested.remove(&vmo_koid);
                    }
                }
            }
            buckets.push(Bucket { name: rule.name().to_string(), size });
        }

        buckets.sort_by(|a, b| b.size.cmp(&a.size));

        let undigested_size: u64 =
            undigested.iter().filter_map(|koid| capture.vmos.get(koid)).map(|v| v.committed_bytes).sum();
        if undigested_size > 0 {
            buckets.push(Bucket { name: "Undigested".to_string(), size: undigested_size });
        }

        if capture.kmem.total > 0 {
            let vmo_size: u64 = buckets.iter().map(|b| b.size).sum();
            if vmo_size < capture.kmem.vmo {
                buckets.push(Bucket { name: "Orphaned".to_string(), size: capture.kmem.vmo - vmo_size });
            }
            let kernel_size = capture.kmem.wired
                + capture.kmem.total_heap
                + capture.kmem.mmu_overhead
                + capture.kmem.ipc
                + capture.kmem.other;
            buckets.push(Bucket { name: "Kernel".to_string(), size: kernel_size });
            buckets.push(Bucket { name: "Free".to_string(), size: capture.kmem.free });
        }

        Digest { time_ns: capture.time_ns, buckets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{KernelStats, Process, Vmo};
    use std::collections::HashMap;

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
    fn s2_first_match_wins() {
        let mut vmos = HashMap::new();
        vmos.insert(1, vmo(1, "minfs-data", 100));
        let mut processes = HashMap::new();
        processes.insert(10, Process { koid: 10, name: "minfs".to_string(), vmos: vec![1] });

        let capture = Capture {
            time_ns: 0,
            kmem: KernelStats::default(),
            kmem_ext: None,
            processes,
            vmos,
            roots: Vec::new(),
        };

        let rules = vec![
            BucketMatch::new("Minfs", ".*minfs", ".*", None).unwrap(),
            BucketMatch::new("All", ".*", ".*", None).unwrap(),
        ];
        let mut digester = Digester::new(rules);
        let digest = digester.digest(&capture);
        let minfs = digest.buckets.iter().find(|b| b.name == "Minfs").unwrap();
        assert_eq!(minfs.size, 100);
        let all = digest.buckets.iter().find(|b| b.name == "All").unwrap();
        assert_eq!(all.size, 0);
    }

    #[test]
    fn s3_undigested_residue() {
        let mut vmos = HashMap::new();
        vmos.insert(1, vmo(1, "mystery", 50));
        let mut processes = HashMap::new();
        processes.insert(10, Process { koid: 10, name: "unknown".to_string(), vmos: vec![1] });

        let capture = Capture {
            time_ns: 0,
            kmem: KernelStats::default(),
            kmem_ext: None,
            processes,
            vmos,
            roots: Vec::new(),
        };

        let rules = vec![BucketMatch::new("Minfs", ".*minfs", ".*", None).unwrap()];
        let mut digester = Digester::new(rules);
        let digest = digester.digest(&capture);
        let undigested = digest.buckets.iter().find(|b| b.name == "Undigested").unwrap();
        assert_eq!(undigested.size, 50);
    }

    #[test]
    fn buckets_are_sorted_descending_by_size() {
        let mut vmos = HashMap::new();
        vmos.insert(1, vmo(1, "a", 10));
        vmos.insert(2, vmo(2, "b", 200));
        let mut processes = HashMap::new();
        processes.insert(10, Process { koid: 10, name: "pa".to_string(), vmos: vec![1] });
        processes.insert(20, Process { koid: 20, name: "pb".to_string(), vmos: vec![2] });

        let capture = Capture {
            time_ns: 0,
            kmem: KernelStats::default(),
            kmem_ext: None,
            processes,
            vmos,
            roots: Vec::new(),
        };

        let rules = vec![
            BucketMatch::new("A", "pa", ".*", None).unwrap(),
            BucketMatch::new("B", "pb", ".*", None).unwrap(),
        ];
        let mut digester = Digester::new(rules);
        let digest = digester.digest(&capture);
        assert_eq!(digest.buckets[0].name, "B");
        assert_eq!(digest.buckets[1].name, "A");
    }

    #[test]
    fn zero_kmem_total_suppresses_orphaned_kernel_free() {
        let capture = Capture {
            time_ns: 0,
            kmem: KernelStats::default(),
            kmem_ext: None,
            processes: HashMap::new(),
            vmos: HashMap::new(),
            roots: Vec::new(),
        };
        let mut digester = Digester::new(Vec::new());
        let digest = digester.digest(&capture);
        assert!(digest.buckets.is_empty());
    }

    #[test]
    fn orphaned_kernel_and_free_appended_when_kmem_present() {
        let capture = Capture {
            time_ns: 0,
            kmem: KernelStats {
                total: 1000,
                free: 100,
                wired: 50,
                total_heap: 10,
                free_heap: 0,
                vmo: 300,
                mmu_overhead: 5,
                ipc: 2,
                other: 1,
            },
            kmem_ext: None,
            processes: HashMap::new(),
            vmos: HashMap::new(),
            roots: Vec::new(),
        };
        let mut digester = Digester::new(Vec::new());
        let digest = digester.digest(&capture);
        let orphaned = digest.buckets.iter().find(|b| b.name == "Orphaned").unwrap();
        assert_eq!(orphaned.size, 300);
        let kernel = digest.buckets.iter().find(|b| b.name == "Kernel").unwrap();
        assert_eq!(kernel.size, 50 + 10 + 5 + 2 + 1);
        let free = digest.buckets.iter().find(|b| b.name == "Free").unwrap();
        assert_eq!(free.size, 100);
    }
}
