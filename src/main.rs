mod bucket_match;
mod capture;
mod cli;
mod config;
mod digest;
mod high_water;
mod inspect;
mod logger;
mod metrics;
mod os;
mod printer;
mod scheduler;
mod shell;
mod summary;
mod util;
mod watcher;

use std::sync::Arc;

use cli::{Opts, OutputFormat, PrintMode};
use digest::Digester;
use os::Os;
use scheduler::{Scheduler, SchedulerConfig};
use shell::Shell;
use summary::Summary;

fn main() {
    human_panic::setup_panic!(human_panic::Metadata {
        name: env!("CARGO_PKG_NAME").into(),
        version: env!("CARGO_PKG_VERSION").into(),
        authors: env!("CARGO_PKG_AUTHORS").into(),
        homepage: "https://github.com/elba-docker/radvisor/issues/new".into(),
    });

    let opts: Opts = cli::load();
    let shell = Arc::new(Shell::new(&opts.shell));

    if !target_has_os_adapter() {
        shell.error(
            "mem only runs against a real kernel on Fuchsia (built with --features fuchsia); \
             the default build only supports running its test suite",
        );
        std::process::exit(1);
    }

    let rules = match config::load_rules(opts.rules.as_deref()) {
        Ok(rules) => rules,
        Err(err) => {
            shell.error(format!("failed to load bucket rules: {err}"));
            std::process::exit(1);
        },
    };

    if opts.daemon {
        run_daemon(opts, rules, shell);
    } else {
        run_once(opts, rules, shell);
    }
}

#[cfg(all(target_os = "fuchsia", feature = "fuchsia"))]
fn target_has_os_adapter() -> bool {
    true
}

#[cfg(not(all(target_os = "fuchsia", feature = "fuchsia")))]
fn target_has_os_adapter() -> bool {
    false
}

#[cfg(all(target_os = "fuchsia", feature = "fuchsia"))]
fn build_os() -> Box<dyn Os> {
    Box::new(os::fuchsia::FuchsiaOs::new(fuchsia_runtime::job_default()))
}

#[cfg(not(all(target_os = "fuchsia", feature = "fuchsia")))]
fn build_os() -> Box<dyn Os> {
    unreachable!("guarded by target_has_os_adapter in main()")
}

/// Performs a single capture, renders it per `--print`/`--output`, and exits.
fn run_once(opts: Opts, rules: Vec<bucket_match::BucketMatch>, shell: Arc<Shell>) {
    let mut os = build_os();
    let rooted_vmo_names: Vec<String> =
        capture::DEFAULT_ROOTED_VMO_NAMES.iter().map(|s| s.to_string()).collect();

    // Every print mode needs the full VMO graph: `summary`/`digest` both
    // attribute memory at VMO granularity, and `capture` is the raw dump.
    let capture = match capture::Capture::capture(&mut *os, capture::CaptureLevel::Vmo, &rooted_vmo_names)
    {
        Ok(capture) => capture,
        Err(err) => {
            shell.error(format!("capture failed: {err}"));
            std::process::exit(1);
        },
    };

    let rendered = match render(&capture, &mut Digester::new(rules), opts.print, opts.output, opts.pid) {
        Ok(rendered) => rendered,
        Err(err) => {
            shell.error(format!("failed to render output: {err}"));
            std::process::exit(1);
        },
    };
    print!("{rendered}");
}

fn render(
    capture: &capture::Capture,
    digester: &mut Digester,
    print: PrintMode,
    output: OutputFormat,
    pid: Option<u64>,
) -> anyhow::Result<String> {
    match print {
        PrintMode::Capture => match output {
            OutputFormat::Json => Ok(printer::capture_to_json(capture)?),
            OutputFormat::Text | OutputFormat::Csv => Ok(printer::print_capture(capture)),
        },
        PrintMode::Summary => {
            let summary = Summary::from_capture(capture);
            match output {
                OutputFormat::Text => Ok(printer::print_summary(&summary)),
                OutputFormat::Csv => Ok(printer::output_summary(&summary, pid)?),
                OutputFormat::Json => Ok(serde_json::to_string_pretty(&SummaryJson::from(&summary))?),
            }
        },
        PrintMode::Digest => {
            let digest = digester.digest(capture);
            match output {
                OutputFormat::Text => Ok(printer::print_digest(&digest)),
                OutputFormat::Csv => Ok(printer::output_digest(&digest)?),
                OutputFormat::Json => Ok(serde_json::to_string_pretty(&digest.buckets)?),
            }
        },
    }
}

#[derive(serde::Serialize)]
struct SummaryJson {
    time_ns: u64,
    free_bytes: u64,
    kmem_vmo_bytes: u64,
}

impl From<&Summary> for SummaryJson {
    fn from(summary: &Summary) -> Self {
        Self {
            time_ns: summary.time_ns,
            free_bytes: summary.free_bytes,
            kmem_vmo_bytes: summary.kmem_vmo_bytes,
        }
    }
}

/// Runs the persistent high-water tracker and pressure logger until a
/// termination signal arrives, mirroring the teacher's two-stage
/// graceful-then-forceful shutdown but via a `tokio::sync::watch` channel
/// dropped into by the dispatcher's tasks instead of a thread broadcast bus.
fn run_daemon(opts: Opts, rules: Vec<bucket_match::BucketMatch>, shell: Arc<Shell>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build the single-threaded tokio runtime");

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        let os = build_os();
        let rooted_vmo_names: Vec<String> =
            capture::DEFAULT_ROOTED_VMO_NAMES.iter().map(|s| s.to_string()).collect();
        let high_water = high_water::HighWaterTracker::new(
            opts.high_water_dir.clone(),
            opts.high_water_threshold_bytes,
            rooted_vmo_names.clone(),
        );
        let metrics_codes = rules
            .iter()
            .filter_map(|rule| rule.event_code().map(|code| (rule.name().to_string(), code)))
            .collect();
        let metrics = metrics::Metrics::new(metrics_codes);
        let digester = Digester::new(rules);
        let metrics_sink: Box<dyn metrics::MetricsSink> = Box::new(metrics::InMemorySink::default());
        let inspect_sink: Box<dyn inspect::InspectSink> = Box::new(inspect::InMemoryInspect::default());

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let shutdown_shell = shell.clone();
        ctrlc::set_handler(move || {
            shutdown_shell.warn("received termination signal, shutting down");
            let _ = shutdown_tx.send(true);
        })
        .expect("failed to install SIGINT handler");

        let scheduler = Scheduler::new(
            os,
            digester,
            high_water,
            metrics,
            metrics_sink,
            inspect_sink,
            shell.clone(),
            SchedulerConfig {
                high_water_poll_interval: *opts.high_water_poll_interval,
                watcher_poll_interval: *opts.watcher_poll_interval,
                rooted_vmo_names,
            },
        );
        scheduler.run(shutdown_rx).await;
    });

    shell.status("Exiting", "mem");
}
