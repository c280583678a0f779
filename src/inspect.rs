//! Structured diagnostics ("inspect") tree forwarder (§4.9). The core treats
//! the inspect sink the same way it treats the metrics sink — a write-only
//! interface (§1) — so this module only builds the tree's data shape and
//! defines the trait a real Fuchsia Inspect publisher would implement.

use crate::digest::Digest;

/// A single inspect publish: one numeric child per bucket name, a
/// `timestamp` field in whole seconds (not nanoseconds, "to avoid 64-bit
/// JSON clients", §4.9), and the current memory-bandwidth ring buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectTree {
    pub timestamp_seconds: u64,
    pub buckets: Vec<(String, u64)>,
    pub bandwidth_history: Vec<u64>,
}

impl InspectTree {
    #[must_use]
    pub fn from_digest(digest: &Digest, bandwidth_history: &[u64]) -> Self {
        Self {
            timestamp_seconds: digest.time_ns / 1_000_000_000,
            buckets: digest.buckets.iter().map(|b| (b.name.clone(), b.size)).collect(),
            bandwidth_history: bandwidth_history.to_vec(),
        }
    }
}

/// Where a built [`InspectTree`] goes. The production implementation would
/// publish each bucket as a numeric property under a Fuchsia Inspect
/// `Node`; `InMemoryInspect` below exists for tests and for any CLI mode
/// that just wants to inspect what would have been published.
pub trait InspectSink {
    fn publish(&mut self, tree: &InspectTree);
}

#[derive(Default)]
pub struct InMemoryInspect {
    pub published: Vec<InspectTree>,
}

impl InspectSink for InMemoryInspect {
    fn publish(&mut self, tree: &InspectTree) {
        self.published.push(tree.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Bucket;

    #[test]
    fn tree_has_one_child_per_bucket_and_a_second_resolution_timestamp() {
        let digest = Digest {
            time_ns: 2_500_000_000,
            buckets: vec![
                Bucket { name: "Minfs".to_string(), size: 100 },
                Bucket { name: "Free".to_string(), size: 900 },
            ],
        };
        let tree = InspectTree::from_digest(&digest, &[10, 20, 30]);
        assert_eq!(tree.timestamp_seconds, 2);
        assert_eq!(tree.buckets, vec![("Minfs".to_string(), 100), ("Free".to_string(), 900)]);
        assert_eq!(tree.bandwidth_history, vec![10, 20, 30]);
    }

    #[test]
    fn publish_accumulates_in_memory() {
        let mut sink = InMemoryInspect::default();
        let digest = Digest { time_ns: 0, buckets: Vec::new() };
        let tree = InspectTree::from_digest(&digest, &[]);
        sink.publish(&tree);
        sink.publish(&tree);
        assert_eq!(sink.published.len(), 2);
    }
}
