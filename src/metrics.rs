//! Forwards digest buckets and kernel-stats breakdowns to an external
//! metrics sink (§4.9), tagging each bucket with its configured event code,
//! emitting a per-field kernel-stats breakdown on every detailed capture
//! (once under a plain "kmem" id, once under a "leak" id keyed by uptime
//! bucket), and tracking a rolling memory-bandwidth history.

use std::collections::HashMap;

use crate::capture::KernelStats;
use crate::digest::Digest;

const BANDWIDTH_HISTORY_LEN: usize = 60;
/// How many "unknown bucket name" warnings [`Metrics::collect`] will surface
/// to the caller before going silent for the rest of this process's
/// lifetime (§4.9: "rate-limited, at most a few per run").
const UNKNOWN_BUCKET_WARNING_LIMIT: usize = 3;

/// Event codes for the synthetic bucket names the digester always appends
/// (`Undigested`/`Orphaned`/`Kernel`/`Free`) plus `TotalBytes`, reserved
/// negative so they never collide with a configured rule's `event_code`
/// (§4.9: "taxonomy extending the core rule list with synthetic names").
const UNDIGESTED_EVENT_CODE: i64 = -1;
const ORPHANED_EVENT_CODE: i64 = -2;
const KERNEL_EVENT_CODE: i64 = -3;
const FREE_EVENT_CODE: i64 = -4;
const TOTAL_BYTES_EVENT_CODE: i64 = -5;

/// The synthetic half of the bucket→event-code taxonomy (§4.9), merged into
/// every [`Metrics`] instance alongside the caller's rule-derived codes so
/// the digest's always-appended synthetic tail is never dropped from the
/// metric stream.
fn synthetic_bucket_codes() -> HashMap<String, i64> {
    [
        ("Undigested", UNDIGESTED_EVENT_CODE),
        ("Orphaned", ORPHANED_EVENT_CODE),
        ("Kernel", KERNEL_EVENT_CODE),
        ("Free", FREE_EVENT_CODE),
        ("TotalBytes", TOTAL_BYTES_EVENT_CODE),
    ]
    .into_iter()
    .map(|(name, code)| (name.to_string(), code))
    .collect()
}

/// Coarse uptime buckets used to tag "leak" metric samples, since early-boot
/// memory behavior is not comparable to steady-state behavior (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UptimeBucket {
    Up,
    Up1Min,
    Up30Min,
    Up1H,
    Up6H,
    Up12H,
    Up1D,
    Up2D,
    Up3D,
    Up6D,
}

#[must_use]
pub fn uptime_bucket(uptime_seconds: u64) -> UptimeBucket {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    match uptime_seconds {
        s if s < MINUTE => UptimeBucket::Up,
        s if s < 30 * MINUTE => UptimeBucket::Up1Min,
        s if s < HOUR => UptimeBucket::Up30Min,
        s if s < 6 * HOUR => UptimeBucket::Up1H,
        s if s < 12 * HOUR => UptimeBucket::Up6H,
        s if s < DAY => UptimeBucket::Up12H,
        s if s < 2 * DAY => UptimeBucket::Up1D,
        s if s < 3 * DAY => UptimeBucket::Up2D,
        s if s < 6 * DAY => UptimeBucket::Up3D,
        _ => UptimeBucket::Up6D,
    }
}

/// The per-field dimension both the "kmem" and "leak" metric ids break
/// kernel-stats samples down by (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelStatsBreakdown {
    TotalBytes,
    UsedBytes,
    FreeBytes,
    VmoBytes,
    KernelFreeHeapBytes,
    MmuBytes,
    IpcBytes,
    KernelTotalHeapBytes,
    WiredBytes,
    OtherBytes,
}

/// Breaks `kmem` down into the ten dimensions §4.9 specifies for both the
/// plain "kmem" metric id and the uptime-keyed "leak" metric id.
#[must_use]
pub fn kernel_stats_breakdown(kmem: &KernelStats) -> Vec<(KernelStatsBreakdown, u64)> {
    use KernelStatsBreakdown::*;
    vec![
        (TotalBytes, kmem.total),
        (UsedBytes, kmem.total.saturating_sub(kmem.free)),
        (FreeBytes, kmem.free),
        (VmoBytes, kmem.vmo),
        (KernelFreeHeapBytes, kmem.free_heap),
        (MmuBytes, kmem.mmu_overhead),
        (IpcBytes, kmem.ipc),
        (KernelTotalHeapBytes, kmem.total_heap),
        (WiredBytes, kmem.wired),
        (OtherBytes, kmem.other),
    ]
}

/// A single bucket-name -> event-code sample ready to forward to a metrics
/// backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmemEvent {
    pub event_code: i64,
    pub size_bytes: u64,
}

/// Where kmem bucket events, kernel-stats breakdowns, and bandwidth samples
/// go. The production implementation would forward to Fuchsia's
/// Cobalt/Inspect; `InMemorySink` below exists for tests and for any CLI
/// mode that just wants to inspect what would have been sent.
pub trait MetricsSink {
    fn record_kmem_events(&mut self, events: &[KmemEvent]);
    fn record_kmem_breakdown(&mut self, breakdown: &[(KernelStatsBreakdown, u64)]);
    fn record_leak_breakdown(&mut self, bucket: UptimeBucket, breakdown: &[(KernelStatsBreakdown, u64)]);
    fn record_bandwidth_sample(&mut self, bytes_per_second: u64);
}

#[derive(Default)]
pub struct InMemorySink {
    pub events: Vec<KmemEvent>,
    pub kmem_breakdowns: Vec<Vec<(KernelStatsBreakdown, u64)>>,
    pub leak_breakdowns: Vec<(UptimeBucket, Vec<(KernelStatsBreakdown, u64)>)>,
    pub bandwidth_samples: Vec<u64>,
}

impl MetricsSink for InMemorySink {
    fn record_kmem_events(&mut self, events: &[KmemEvent]) {
        self.events.extend_from_slice(events);
    }

    fn record_kmem_breakdown(&mut self, breakdown: &[(KernelStatsBreakdown, u64)]) {
        self.kmem_breakdowns.push(breakdown.to_vec());
    }

    fn record_leak_breakdown(&mut self, bucket: UptimeBucket, breakdown: &[(KernelStatsBreakdown, u64)]) {
        self.leak_breakdowns.push((bucket, breakdown.to_vec()));
    }

    fn record_bandwidth_sample(&mut self, bytes_per_second: u64) {
        self.bandwidth_samples.push(bytes_per_second);
    }
}

/// Maps a digest into `MetricsSink` calls: every non-empty bucket with a
/// known event code is forwarded — the synthetic `Undigested`/`Orphaned`/
/// `Kernel`/`Free` tail is always known via [`synthetic_bucket_codes`], so in
/// practice only a rule-configured name with no `event_code` ever goes
/// unmapped, and is returned as a name the caller should log (rate-limited,
/// see [`UNKNOWN_BUCKET_WARNING_LIMIT`]). A fixed-size ring of the last
/// [`BANDWIDTH_HISTORY_LEN`] samples is kept so callers can compute a moving
/// memory-bandwidth average.
pub struct Metrics {
    bucket_name_to_code: HashMap<String, i64>,
    bandwidth_history: Vec<u64>,
    bandwidth_index: usize,
    unknown_bucket_warnings_remaining: usize,
}

impl Metrics {
    /// Builds the full taxonomy from `bucket_name_to_code` (typically the
    /// configured rules' `event_code`s) merged with the fixed synthetic
    /// codes (§4.9) — a caller-supplied code for one of the synthetic names
    /// wins over the default, but the defaults are always present otherwise.
    #[must_use]
    pub fn new(bucket_name_to_code: HashMap<String, i64>) -> Self {
        let mut codes = synthetic_bucket_codes();
        codes.extend(bucket_name_to_code);
        Self {
            bucket_name_to_code: codes,
            bandwidth_history: Vec::new(),
            bandwidth_index: 0,
            unknown_bucket_warnings_remaining: UNKNOWN_BUCKET_WARNING_LIMIT,
        }
    }

    /// Forwards every non-empty mapped bucket in `digest` to `sink`, per
    /// §4.9 ("for each non-empty bucket"); zero-size buckets are skipped
    /// outright, matching `metrics.cc`'s `if (bucket.size() == 0) continue;`
    /// before the code lookup, so they neither emit a zero-valued event nor
    /// spend an unknown-bucket warning. Returns the names of unmapped
    /// non-empty buckets the caller should log this call, already clamped
    /// to the per-process rate limit — once the limit is spent this always
    /// returns empty, even though unmapped buckets keep getting silently
    /// dropped from the metric stream itself.
    pub fn collect(&mut self, digest: &Digest, sink: &mut dyn MetricsSink) -> Vec<String> {
        let mut events = Vec::with_capacity(digest.buckets.len());
        let mut unknown = Vec::new();
        for bucket in &digest.buckets {
            if bucket.size == 0 {
                continue;
            }
            match self.bucket_name_to_code.get(&bucket.name) {
                Some(&event_code) => events.push(KmemEvent { event_code, size_bytes: bucket.size }),
                None if self.unknown_bucket_warnings_remaining > 0 => {
                    self.unknown_bucket_warnings_remaining -= 1;
                    unknown.push(bucket.name.clone());
                },
                None => {},
            }
        }
        sink.record_kmem_events(&events);
        unknown
    }

    /// Emits the kernel-stats breakdown under the plain "kmem" metric id and,
    /// a second time, under the uptime-keyed "leak" metric id (§4.9 treats
    /// these as genuinely separate emissions, not one shared call).
    pub fn collect_kernel_stats(&self, kmem: &KernelStats, uptime_seconds: u64, sink: &mut dyn MetricsSink) {
        let breakdown = kernel_stats_breakdown(kmem);
        sink.record_kmem_breakdown(&breakdown);
        sink.record_leak_breakdown(uptime_bucket(uptime_seconds), &breakdown);
    }

    /// Records one bandwidth sample into the rolling history (wrapping after
    /// [`BANDWIDTH_HISTORY_LEN`] entries, overwriting the oldest) and forwards
    /// it to `sink`.
    pub fn record_bandwidth(&mut self, bytes_per_second: u64, sink: &mut dyn MetricsSink) {
        if self.bandwidth_history.len() < BANDWIDTH_HISTORY_LEN {
            self.bandwidth_history.push(bytes_per_second);
        } else {
            self.bandwidth_history[self.bandwidth_index] = bytes_per_second;
        }
        self.bandwidth_index = (self.bandwidth_index + 1) % BANDWIDTH_HISTORY_LEN;
        sink.record_bandwidth_sample(bytes_per_second);
    }

    #[must_use]
    pub fn bandwidth_history(&self) -> &[u64] {
        &self.bandwidth_history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Bucket;

    fn digest() -> Digest {
        Digest {
            time_ns: 0,
            buckets: vec![
                Bucket { name: "Minfs".to_string(), size: 100 },
                Bucket { name: "Mystery".to_string(), size: 5 },
            ],
        }
    }

    #[test]
    fn only_mapped_buckets_are_forwarded() {
        let mut codes = HashMap::new();
        codes.insert("Minfs".to_string(), 7);
        let mut metrics = Metrics::new(codes);
        let mut sink = InMemorySink::default();
        let unknown = metrics.collect(&digest(), &mut sink);
        assert_eq!(sink.events, vec![KmemEvent { event_code: 7, size_bytes: 100 }]);
        assert_eq!(unknown, vec!["Mystery".to_string()]);
    }

    #[test]
    fn unknown_bucket_warnings_are_rate_limited() {
        let mut metrics = Metrics::new(HashMap::new());
        let mut sink = InMemorySink::default();
        let mut total_warnings = 0;
        for _ in 0..10 {
            total_warnings += metrics.collect(&digest(), &mut sink).len();
        }
        assert_eq!(total_warnings, UNKNOWN_BUCKET_WARNING_LIMIT);
    }

    #[test]
    fn synthetic_bucket_names_are_mapped_by_default() {
        // The digester always appends these names (§4.4); Metrics::new must
        // fold them into the taxonomy even when the caller passes no rule
        // codes, so the daemon's every-digest forwarding never treats them
        // as unknown.
        let mut metrics = Metrics::new(HashMap::new());
        let mut sink = InMemorySink::default();
        let digest = Digest {
            time_ns: 0,
            buckets: vec![
                Bucket { name: "Undigested".to_string(), size: 10 },
                Bucket { name: "Orphaned".to_string(), size: 20 },
                Bucket { name: "Kernel".to_string(), size: 30 },
                Bucket { name: "Free".to_string(), size: 40 },
            ],
        };
        let unknown = metrics.collect(&digest, &mut sink);
        assert!(unknown.is_empty());
        assert_eq!(sink.events.len(), 4);
    }

    #[test]
    fn zero_size_buckets_are_skipped_entirely() {
        // §4.9: "for each non-empty bucket"; a zero-size synthetic bucket
        // (e.g. S5's Kernel:0/Free:0) must neither emit a zero-valued event
        // nor spend an unknown-bucket warning.
        let mut metrics = Metrics::new(HashMap::new());
        let mut sink = InMemorySink::default();
        let digest = Digest {
            time_ns: 0,
            buckets: vec![
                Bucket { name: "Kernel".to_string(), size: 0 },
                Bucket { name: "NeverSeen".to_string(), size: 0 },
            ],
        };
        let unknown = metrics.collect(&digest, &mut sink);
        assert!(sink.events.is_empty());
        assert!(unknown.is_empty());
        assert_eq!(metrics.unknown_bucket_warnings_remaining, UNKNOWN_BUCKET_WARNING_LIMIT);
    }

    #[test]
    fn kernel_stats_breakdown_covers_all_ten_fields() {
        let kmem = KernelStats {
            total: 1000,
            free: 200,
            wired: 50,
            total_heap: 40,
            free_heap: 10,
            vmo: 300,
            mmu_overhead: 20,
            ipc: 5,
            other: 1,
        };
        let breakdown = kernel_stats_breakdown(&kmem);
        assert_eq!(breakdown.len(), 10);
        let used = breakdown.iter().find(|(k, _)| *k == KernelStatsBreakdown::UsedBytes).unwrap();
        assert_eq!(used.1, 800);
    }

    #[test]
    fn collect_kernel_stats_emits_both_kmem_and_leak() {
        let metrics = Metrics::new(HashMap::new());
        let mut sink = InMemorySink::default();
        let kmem = KernelStats { total: 100, free: 10, ..Default::default() };
        metrics.collect_kernel_stats(&kmem, 3600, &mut sink);
        assert_eq!(sink.kmem_breakdowns.len(), 1);
        assert_eq!(sink.leak_breakdowns.len(), 1);
        assert_eq!(sink.leak_breakdowns[0].0, UptimeBucket::Up1H);
    }

    #[test]
    fn bandwidth_history_wraps_after_60_samples() {
        let mut metrics = Metrics::new(HashMap::new());
        let mut sink = InMemorySink::default();
        for i in 0..65u64 {
            metrics.record_bandwidth(i, &mut sink);
        }
        assert_eq!(metrics.bandwidth_history().len(), BANDWIDTH_HISTORY_LEN);
        // Index 0 should have been overwritten once by sample 60.
        assert_eq!(metrics.bandwidth_history()[0], 60);
    }

    #[test]
    fn uptime_bucket_thresholds() {
        assert_eq!(uptime_bucket(0), UptimeBucket::Up);
        assert_eq!(uptime_bucket(59), UptimeBucket::Up);
        assert_eq!(uptime_bucket(60), UptimeBucket::Up1Min);
        assert_eq!(uptime_bucket(30 * 60), UptimeBucket::Up30Min);
        assert_eq!(uptime_bucket(3600), UptimeBucket::Up1H);
        assert_eq!(uptime_bucket(12 * 3600), UptimeBucket::Up12H);
        assert_eq!(uptime_bucket(24 * 3600), UptimeBucket::Up1D);
        assert_eq!(uptime_bucket(2 * 24 * 3600), UptimeBucket::Up2D);
        assert_eq!(uptime_bucket(3 * 24 * 3600), UptimeBucket::Up3D);
        assert_eq!(uptime_bucket(6 * 24 * 3600), UptimeBucket::Up6D);
    }
}
