//! Single-threaded cooperative dispatcher (§5) tying the high-water tracker,
//! pressure logger, and watcher fan-out together on one `tokio` `LocalSet`.
//! Nothing here is `Send`: the `Os` capability is held behind an `Rc<RefCell<_>>`
//! rather than an `Arc<Mutex<_>>`, since there is never more than one task
//! actually executing at a time. The one piece of state genuinely shared
//! across the dispatcher's tasks — the digester's per-rule match caches — is
//! still guarded by a real mutex (`digester_mutex`), matching the design
//! note that this is the single lock this crate needs.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::LocalSet;
use tokio::time::sleep;

use crate::capture::{Capture, CaptureLevel};
use crate::digest::Digester;
use crate::high_water::HighWaterTracker;
use crate::inspect::{InspectSink, InspectTree};
use crate::logger::{Logger, PressureLevel};
use crate::metrics::{Metrics, MetricsSink};
use crate::os::Os;
use crate::printer;
use crate::shell::Shell;
use crate::watcher::Watchers;

/// Tunables that would otherwise be scattered across the dispatcher's
/// periodic tasks; grouped here so `main.rs` has one struct to build from
/// CLI options.
pub struct SchedulerConfig {
    /// §2 default 10s: cadence of the KMEM-only poll that escalates to a
    /// full capture on a free-memory drop.
    pub high_water_poll_interval: Duration,
    /// §2 default 1s: cadence of the KMEM-only capture forwarded to
    /// watchers and used to sample the pressure level + bandwidth history.
    pub watcher_poll_interval: Duration,
    pub rooted_vmo_names: Vec<String>,
}

/// Owns every piece of state the dispatcher's tasks touch. Constructing one
/// and calling [`Scheduler::run`] is the entire lifetime of the `mem` daemon
/// mode; the CLI's one-shot modes go through [`crate::capture`]/[`crate::digest`]
/// directly instead.
pub struct Scheduler {
    os: Rc<RefCell<Box<dyn Os>>>,
    digester: Arc<Mutex<Digester>>,
    watchers: Rc<RefCell<Watchers>>,
    high_water: Rc<RefCell<HighWaterTracker>>,
    logger: Rc<RefCell<Logger>>,
    metrics: Rc<RefCell<Metrics>>,
    metrics_sink: Rc<RefCell<Box<dyn MetricsSink>>>,
    inspect_sink: Rc<RefCell<Box<dyn InspectSink>>>,
    shell: Arc<Shell>,
    config: SchedulerConfig,
}

impl Scheduler {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        os: Box<dyn Os>,
        digester: Digester,
        high_water: HighWaterTracker,
        metrics: Metrics,
        metrics_sink: Box<dyn MetricsSink>,
        inspect_sink: Box<dyn InspectSink>,
        shell: Arc<Shell>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            os: Rc::new(RefCell::new(os)),
            digester: Arc::new(Mutex::new(digester)),
            watchers: Rc::new(RefCell::new(Watchers::new())),
            high_water: Rc::new(RefCell::new(high_water)),
            logger: Rc::new(RefCell::new(Logger::new(PressureLevel::Normal))),
            metrics: Rc::new(RefCell::new(metrics)),
            metrics_sink: Rc::new(RefCell::new(metrics_sink)),
            inspect_sink: Rc::new(RefCell::new(inspect_sink)),
            shell,
            config,
        }
    }

    /// Registers a new digest subscriber; see [`Watchers::watch`].
    pub fn watch(&self, capacity: usize) -> crate::watcher::WatcherHandle {
        self.watchers.borrow_mut().watch(capacity)
    }

    /// Runs the dispatcher until `shutdown` fires. Every periodic task runs
    /// on the same `LocalSet`, so there is no point at which two of them are
    /// genuinely executing concurrently — only interleaved at `.await` points.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let local = LocalSet::new();

        local.spawn_local(high_water_loop(
            self.os.clone(),
            self.high_water.clone(),
            self.config.high_water_poll_interval,
            self.shell.clone(),
            shutdown.clone(),
        ));

        local.spawn_local(watcher_loop(
            self.os.clone(),
            self.watchers,
            self.logger.clone(),
            self.high_water.clone(),
            self.metrics.clone(),
            self.metrics_sink.clone(),
            self.config.watcher_poll_interval,
            self.shell.clone(),
            shutdown.clone(),
        ));

        local.spawn_local(logger_loop(
            self.os,
            self.digester,
            self.logger,
            self.metrics,
            self.metrics_sink,
            self.inspect_sink,
            self.config.rooted_vmo_names,
            self.shell,
            shutdown.clone(),
        ));

        tokio::select! {
            () = local.run_until(std::future::pending::<()>()) => {},
            _ = shutdown.changed() => {},
        }
    }
}

async fn high_water_loop(
    os: Rc<RefCell<Box<dyn Os>>>,
    high_water: Rc<RefCell<HighWaterTracker>>,
    interval: Duration,
    shell: Arc<Shell>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = sleep(interval) => {},
            _ = shutdown.changed() => return,
        }
        let recorded = {
            let mut os = os.borrow_mut();
            let mut high_water = high_water.borrow_mut();
            high_water.poll_once(&mut **os)
        };
        match recorded {
            Ok(true) => shell.info("recorded a new high-water memory mark"),
            Ok(false) => {},
            Err(err) => shell.error(&format!("high-water poll failed: {err}")),
        }
    }
}

/// The short-period (§2 default 1s) KMEM-only sampler: forwards a flat
/// [`crate::capture::KernelStats`] to every watcher, samples the pressure
/// level to drive the logger's cadence (§4.7), forces an immediate
/// high-water record on an `Imminent-OOM` transition (§4.6), and feeds the
/// metrics bandwidth ring buffer (§4.9) from the per-tick change in VMO
/// bytes.
#[allow(clippy::too_many_arguments)]
async fn watcher_loop(
    os: Rc<RefCell<Box<dyn Os>>>,
    watchers: Rc<RefCell<Watchers>>,
    logger: Rc<RefCell<Logger>>,
    high_water: Rc<RefCell<HighWaterTracker>>,
    metrics: Rc<RefCell<Metrics>>,
    metrics_sink: Rc<RefCell<Box<dyn MetricsSink>>>,
    interval: Duration,
    shell: Arc<Shell>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut last_vmo_bytes: Option<u64> = None;
    loop {
        tokio::select! {
            _ = sleep(interval) => {},
            _ = shutdown.changed() => return,
        }

        let (kmem, pressure) = {
            let mut os = os.borrow_mut();
            let capture = Capture::capture(&mut **os, CaptureLevel::Kmem, &[]);
            let capture = match capture {
                Ok(capture) => capture,
                Err(err) => {
                    shell.error(&format!("watcher capture failed: {err}"));
                    continue;
                },
            };
            let pressure = os.pressure_level();
            (capture.kmem, pressure)
        };

        watchers.borrow_mut().notify_all(kmem);

        if let Some(bytes_per_second) = last_vmo_bytes.map(|last| kmem.vmo.abs_diff(last)) {
            metrics.borrow_mut().record_bandwidth(bytes_per_second, &mut **metrics_sink.borrow_mut());
        }
        last_vmo_bytes = Some(kmem.vmo);

        match pressure {
            Ok(level) => {
                let transitioned = logger.borrow().level() != level;
                if transitioned {
                    logger.borrow_mut().set_pressure_level(level);
                }
                if level == PressureLevel::ImminentOom {
                    let mut os = os.borrow_mut();
                    let mut high_water = high_water.borrow_mut();
                    if let Err(err) = high_water.force_record(&mut **os) {
                        shell.error(&format!("imminent-OOM high-water record failed: {err}"));
                    }
                }
            },
            Err(err) => shell.error(&format!("pressure level read failed: {err}")),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn logger_loop(
    os: Rc<RefCell<Box<dyn Os>>>,
    digester: Arc<Mutex<Digester>>,
    logger: Rc<RefCell<Logger>>,
    metrics: Rc<RefCell<Metrics>>,
    metrics_sink: Rc<RefCell<Box<dyn MetricsSink>>>,
    inspect_sink: Rc<RefCell<Box<dyn InspectSink>>>,
    rooted_vmo_names: Vec<String>,
    shell: Arc<Shell>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        let delay = logger.borrow_mut().next_delay();
        tokio::select! {
            _ = sleep(delay) => {},
            _ = shutdown.changed() => return,
        }

        let capture = {
            let mut os = os.borrow_mut();
            Capture::capture(&mut **os, CaptureLevel::Vmo, &rooted_vmo_names)
        };
        let capture = match capture {
            Ok(capture) => capture,
            Err(err) => {
                shell.error(&format!("log capture failed: {err}"));
                continue;
            },
        };

        let digest = {
            let mut digester = digester.lock().expect("digester_mutex poisoned");
            digester.digest(&capture)
        };

        let mut rendered = printer::print_digest(&digest);
        if rendered.ends_with('\n') {
            rendered.pop();
        }
        shell.info(&rendered.replace('\n', " "));

        let mut metrics = metrics.borrow_mut();
        let mut sink = metrics_sink.borrow_mut();
        let unknown_buckets = metrics.collect(&digest, &mut **sink);
        for name in unknown_buckets {
            shell.error(&format!("digest bucket {name:?} has no configured metric event code"));
        }
        let uptime_seconds = capture.time_ns / 1_000_000_000;
        metrics.collect_kernel_stats(&capture.kmem, uptime_seconds, &mut **sink);

        let tree = InspectTree::from_digest(&digest, metrics.bandwidth_history());
        inspect_sink.borrow_mut().publish(&tree);
    }
}
