//! High-water memory tracking: cheap KMEM polling escalating to a full VMO
//! capture on a free-memory drop, with the result persisted to disk (§4.6).

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::capture::{Capture, CaptureError, CaptureLevel};
use crate::os::Os;
use crate::printer;
use crate::summary::Summary;

const LATEST_FILE: &str = "latest.txt";
const PREVIOUS_FILE: &str = "previous.txt";

#[derive(Debug, Error)]
pub enum HighWaterError {
    #[error("failed to capture memory for high-water recording: {0}")]
    Capture(#[from] CaptureError),
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
}

/// Tracks the lowest free-memory value seen since startup (or since the last
/// recheck), escalating to a full capture and persisting a text summary only
/// when free memory drops by at least `threshold_bytes` below the previous
/// low-water mark.
///
/// On construction, any prior `latest.txt` becomes `previous.txt` (the old
/// `previous.txt`, if any, is discarded first) so a crash-and-restart cycle
/// doesn't silently keep serving a stale "previous" report.
pub struct HighWaterTracker {
    dir: PathBuf,
    threshold_bytes: u64,
    rooted_vmo_names: Vec<String>,
    least_free_bytes: u64,
}

impl HighWaterTracker {
    pub fn new(dir: impl Into<PathBuf>, threshold_bytes: u64, rooted_vmo_names: Vec<String>) -> Self {
        let dir = dir.into();
        let _ = fs::remove_file(dir.join(PREVIOUS_FILE));
        let _ = fs::rename(dir.join(LATEST_FILE), dir.join(PREVIOUS_FILE));
        Self { dir, threshold_bytes, rooted_vmo_names, least_free_bytes: u64::MAX }
    }

    /// Runs one polling step: a cheap KMEM-only capture, and if free memory
    /// has dropped by at least `threshold_bytes` below the running low-water
    /// mark, a full VMO capture followed by a recheck against the new free
    /// value (the full capture itself takes time, during which free memory
    /// may have moved further). Returns `Ok(true)` iff a new high-water
    /// report was recorded.
    pub fn poll_once(&mut self, os: &mut dyn Os) -> Result<bool, HighWaterError> {
        let kmem = Capture::capture(os, CaptureLevel::Kmem, &[])?;
        if !self.crosses_threshold(kmem.kmem.free) {
            return Ok(false);
        }

        let full = Capture::capture(os, CaptureLevel::Vmo, &self.rooted_vmo_names)?;
        if !self.crosses_threshold(full.kmem.free) {
            return Ok(false);
        }

        self.least_free_bytes = full.kmem.free;
        self.record(&full)?;
        Ok(true)
    }

    /// Records the current capture unconditionally, ignoring the threshold
    /// check (§4.6: "on an externally signaled imminent OOM event ... record
    /// the current capture immediately regardless of the threshold").
    pub fn force_record(&mut self, os: &mut dyn Os) -> Result<(), HighWaterError> {
        let full = Capture::capture(os, CaptureLevel::Vmo, &self.rooted_vmo_names)?;
        self.least_free_bytes = self.least_free_bytes.min(full.kmem.free);
        self.record(&full)
    }

    fn crosses_threshold(&self, free_bytes: u64) -> bool {
        free_bytes.saturating_add(self.threshold_bytes) <= self.least_free_bytes
    }

    /// Writes via a temp file + rename so a concurrent reader of `latest.txt`
    /// always sees either the previous contents or the new contents in full,
    /// never a partial write (§4.6, §5).
    fn record(&self, capture: &Capture) -> Result<(), HighWaterError> {
        let summary = Summary::from_capture(capture);
        let text = printer::print_summary(&summary);
        let path = self.dir.join(LATEST_FILE);
        let tmp_path = self.dir.join(format!("{LATEST_FILE}.tmp"));
        fs::write(&tmp_path, text).map_err(|source| HighWaterError::Write { path: tmp_path.clone(), source })?;
        fs::rename(&tmp_path, &path).map_err(|source| HighWaterError::Write { path, source })
    }

    /// The most recently recorded high-water report, or an empty string if
    /// none has been recorded yet.
    #[must_use]
    pub fn latest(&self) -> String {
        read_or_empty(&self.dir.join(LATEST_FILE))
    }

    /// The high-water report in effect as of the previous run, or an empty
    /// string if there wasn't one.
    #[must_use]
    pub fn previous(&self) -> String {
        read_or_empty(&self.dir.join(PREVIOUS_FILE))
    }
}

fn read_or_empty(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}
