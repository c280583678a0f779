//! Scripted [`Os`] double used by the capture/high-water test suites. Accepts
//! a fixture built up via `add_process`/`add_vmo`/`push_kmem` and replays it;
//! production behavior lives only in `fuchsia::FuchsiaOs`.

use std::collections::{HashMap, VecDeque};

use crate::capture::{ExtendedKernelStats, Koid, KernelStats};
use crate::logger::PressureLevel;
use crate::os::{Os, OsError, VmoInfo};

pub struct TestOs {
    self_koid: Koid,
    now_ns: u64,
    kmem_queue: VecDeque<KernelStats>,
    pressure_queue: VecDeque<PressureLevel>,
    process_order: Vec<(u32, Koid, Koid)>,
    /// `None` marks a process that has vanished (`BAD_STATE` on read).
    names: HashMap<Koid, Option<String>>,
    process_vmos: HashMap<Koid, Vec<Koid>>,
    vmo_table: HashMap<Koid, VmoInfo>,
}

impl TestOs {
    #[must_use]
    pub fn new(self_koid: Koid) -> Self {
        Self {
            self_koid,
            now_ns: 0,
            kmem_queue: VecDeque::new(),
            pressure_queue: VecDeque::new(),
            process_order: Vec::new(),
            names: HashMap::new(),
            process_vmos: HashMap::new(),
            vmo_table: HashMap::new(),
        }
    }

    pub fn set_monotonic_now(&mut self, now_ns: u64) {
        self.now_ns = now_ns;
    }

    /// Queues a pressure-level response, consumed in order by successive
    /// [`Os::pressure_level`] calls; defaults to `Normal` once exhausted.
    pub fn push_pressure_level(&mut self, level: PressureLevel) {
        self.pressure_queue.push_back(level);
    }

    /// Queues a kernel-stats response. Each call to [`Os::kernel_stats`] or
    /// [`Os::kernel_stats_extended`] consumes the next queued value, in
    /// call order, so a fixture can script a sequence of samples.
    pub fn push_kmem(&mut self, stats: KernelStats) {
        self.kmem_queue.push_back(stats);
    }

    /// Registers a VMO's full info. Must precede the `add_process` call(s)
    /// that reference `koid`.
    pub fn add_vmo(
        &mut self,
        koid: Koid,
        parent_koid: Option<Koid>,
        name: &str,
        committed_bytes: u64,
        allocated_bytes: u64,
    ) {
        self.vmo_table.insert(koid, VmoInfo {
            koid,
            parent_koid,
            name: name.to_string(),
            committed_bytes,
            allocated_bytes,
            num_children: 0,
        });
    }

    /// Registers a process in the walked tree along with the koids of the
    /// VMOs it directly holds (each must already exist via `add_vmo`).
    pub fn add_process(&mut self, koid: Koid, name: &str, vmos: &[Koid]) {
        let depth = self.process_order.len() as u32;
        self.process_order.push((depth, koid, 0));
        self.process_vmos.insert(koid, vmos.to_vec());
        self.names.insert(koid, Some(name.to_string()));
    }

    /// Marks a process as having gone away mid-walk (`BAD_STATE` on the
    /// property/VMO read); the capture silently skips it.
    pub fn add_vanished_process(&mut self, koid: Koid) {
        let depth = self.process_order.len() as u32;
        self.process_order.push((depth, koid, 0));
        self.names.insert(koid, None);
    }
}

impl Os for TestOs {
    fn process_self(&self) -> Koid {
        self.self_koid
    }

    fn monotonic_now(&self) -> u64 {
        self.now_ns
    }

    fn kernel_stats(&mut self) -> Result<KernelStats, OsError> {
        self.kmem_queue
            .pop_front()
            .ok_or_else(|| OsError::Syscall("no scripted kernel stats remaining".to_string()))
    }

    fn kernel_stats_extended(&mut self) -> Result<(ExtendedKernelStats, KernelStats), OsError> {
        let kmem = self.kernel_stats()?;
        Ok((ExtendedKernelStats::default(), kmem))
    }

    fn walk_processes(
        &mut self,
        callback: &mut dyn FnMut(u32, Koid, Koid),
    ) -> Result<(), OsError> {
        for (depth, koid, parent_koid) in self.process_order.clone() {
            callback(depth, koid, parent_koid);
        }
        Ok(())
    }

    fn process_name(&mut self, koid: Koid) -> Result<Option<String>, OsError> {
        Ok(self.names.get(&koid).cloned().flatten())
    }

    fn process_vmos(&mut self, koid: Koid) -> Result<Option<Vec<VmoInfo>>, OsError> {
        match self.names.get(&koid) {
            None | Some(None) => Ok(None),
            Some(Some(_)) => Ok(Some(
                self.process_vmos
                    .get(&koid)
                    .into_iter()
                    .flatten()
                    .filter_map(|koid| self.vmo_table.get(koid).cloned())
                    .collect(),
            )),
        }
    }

    fn pressure_level(&mut self) -> Result<PressureLevel, OsError> {
        Ok(self.pressure_queue.pop_front().unwrap_or(PressureLevel::Normal))
    }
}
