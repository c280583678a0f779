//! The `Os` capability abstraction (§4.1): everything the core needs from
//! the kernel, expressed as a trait so the sampler can run unmodified
//! against a scripted test double. One production implementor exists,
//! [`fuchsia::FuchsiaOs`], gated behind the `fuchsia` feature.

use thiserror::Error;

use crate::capture::{Koid, ExtendedKernelStats, KernelStats};
use crate::logger::PressureLevel;

#[cfg(all(target_os = "fuchsia", feature = "fuchsia"))]
pub mod fuchsia;

pub mod test_os;

/// Errors an [`Os`] call can raise. `BAD_STATE`-shaped "the object went
/// away" conditions are represented as `Ok(None)` at the call sites that can
/// tolerate them ([`Os::process_name`], [`Os::process_vmos`]), not as this
/// error type, so that callers can't accidentally treat a tolerated
/// disappearance as fatal.
#[derive(Debug, Error)]
pub enum OsError {
    #[error("capability unreachable: {0}")]
    Unreachable(String),
    #[error("syscall failed: {0}")]
    Syscall(String),
}

/// A single VMO as reported directly by the OS, prior to being folded into
/// a [`crate::capture::Capture`]'s global VMO map.
#[derive(Debug, Clone)]
pub struct VmoInfo {
    pub koid: Koid,
    pub parent_koid: Option<Koid>,
    pub name: String,
    pub committed_bytes: u64,
    pub allocated_bytes: u64,
    pub num_children: u32,
}

/// Abstract syscall surface consumed by [`crate::capture::Capture::capture`].
/// Every method must be safe to call from the sampler thread; none may be
/// called concurrently with another call on the same `Os` (callers hold it
/// behind whatever synchronization their scheduling model needs).
pub trait Os {
    /// A handle identifier for the caller's own process, excluded from
    /// [`Os::walk_processes`] results by the caller.
    fn process_self(&self) -> Koid;

    /// Nanoseconds since boot.
    fn monotonic_now(&self) -> u64;

    /// Non-extended kernel memory stats. Must avoid the more expensive
    /// extended query — this is the path the high-water tracker polls at
    /// high frequency.
    fn kernel_stats(&mut self) -> Result<KernelStats, OsError>;

    /// Extended kernel memory stats, paired with the non-extended struct's
    /// overlapping fields so callers never need a second syscall to get
    /// both views.
    fn kernel_stats_extended(&mut self) -> Result<(ExtendedKernelStats, KernelStats), OsError>;

    /// Depth-first walk of the process tree rooted at the root job. Invokes
    /// `callback(depth, koid, parent_koid)` for each process.
    fn walk_processes(
        &mut self,
        callback: &mut dyn FnMut(u32, Koid, Koid),
    ) -> Result<(), OsError>;

    /// The process's name property. `Ok(None)` means the process has
    /// already gone away (`BAD_STATE`) and should be silently skipped.
    fn process_name(&mut self, koid: Koid) -> Result<Option<String>, OsError>;

    /// The VMOs directly held by the process. `Ok(None)` means the process
    /// exited mid-enumeration (`BAD_STATE`) and should be silently skipped.
    fn process_vmos(&mut self, koid: Koid) -> Result<Option<Vec<VmoInfo>>, OsError>;

    /// The current system memory pressure level (§1, §4.7). Not part of the
    /// reference capability list in §4.1, which predates this note, but the
    /// pressure logger has nothing else to poll; modeled as a cheap
    /// synchronous query on the same capability rather than introducing an
    /// event-stream shape, to keep every `Os` call uniformly poll-based.
    fn pressure_level(&mut self) -> Result<PressureLevel, OsError>;
}
