//! Human and machine-readable rendering of captures, summaries, and digests (§6).

use std::io::Write as _;

use serde::Serialize;

use crate::capture::Capture;
use crate::digest::Digest;
use crate::summary::Summary;

const UNITS: &[u8] = b"BKMGTPE";

/// Formats a byte count the way the reference printer does: repeated
/// division by 1024, rounding the last digit to the nearest tenth with
/// round-half-up and carry, e.g. `1536` -> `"1.5K"`, `1024*1024` -> `"1M"`.
#[must_use]
pub fn format_size(mut bytes: u64) -> String {
    let mut unit = 0usize;
    let mut remainder = 0u64;
    while bytes >= 1024 && unit < UNITS.len() - 1 {
        remainder = bytes % 1024;
        bytes /= 1024;
        unit += 1;
    }

    if unit == 0 {
        return format!("{bytes}{}", UNITS[0] as char);
    }

    // Scale the dropped remainder into tenths (remainder is out of 1024;
    // 1024/10 ~= 102.4, so divide by 102 and round up on the .4).
    let round_up = (remainder % 102) >= 51;
    let mut tenths = remainder / 102 + u64::from(round_up);
    if tenths == 10 {
        tenths = 0;
        bytes += 1;
    }

    if tenths == 0 {
        format!("{bytes}{}", UNITS[unit] as char)
    } else {
        format!("{bytes}.{tenths}{}", UNITS[unit] as char)
    }
}

/// Renders a capture as sortable `K`/`P`/`V` lines: kernel stats, then one
/// line per process, then one line per VMO, each VMO/process block sorted by
/// descending committed bytes.
#[must_use]
pub fn print_capture(capture: &Capture) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "K:{},{},{},{},{},{},{},{},{}\n",
        capture.time_ns,
        capture.kmem.total,
        capture.kmem.free,
        capture.kmem.wired,
        capture.kmem.total_heap,
        capture.kmem.free_heap,
        capture.kmem.vmo,
        capture.kmem.mmu_overhead,
        capture.kmem.ipc,
    ));

    let mut processes: Vec<_> = capture.processes.values().collect();
    processes.sort_by(|a, b| b.koid.cmp(&a.koid));
    for process in processes {
        out.push_str(&format!("P:{},{},{}\n", process.koid, process.name, process.vmos.len()));
    }

    let mut vmos: Vec<_> = capture.vmos.values().collect();
    vmos.sort_by(|a, b| b.committed_bytes.cmp(&a.committed_bytes));
    for vmo in vmos {
        out.push_str(&format!(
            "V:{},{},{},{},{:?}\n",
            vmo.koid, vmo.name, vmo.committed_bytes, vmo.allocated_bytes, vmo.parent_koid
        ));
    }

    out
}

/// Renders a summary the way an operator reads it at a terminal: a header
/// line, then each process (descending by private bytes) with its per-VMO
/// breakdown indented beneath it. The `scaled`/`total` suffix is omitted
/// when a size has no sharing (`total == private`).
#[must_use]
pub fn print_summary(summary: &Summary) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Time: {} VMO: {} Free: {}\n",
        summary.time_ns,
        format_size(summary.kmem_vmo_bytes),
        format_size(summary.free_bytes)
    ));

    let mut processes: Vec<_> = summary.processes.iter().collect();
    processes.sort_by(|a, b| b.sizes.private_bytes.cmp(&a.sizes.private_bytes));

    for process in processes {
        if process.sizes.total_bytes == 0 {
            continue;
        }
        write_sizes_line(&mut out, &format!("{}<{}>", process.name, process.koid), &process.sizes, 0);

        let mut names: Vec<_> = process.name_to_sizes.iter().collect();
        names.sort_by(|a, b| b.1.private_bytes.cmp(&a.1.private_bytes));
        for (name, sizes) in names {
            if sizes.total_bytes == 0 {
                continue;
            }
            write_sizes_line(&mut out, name, sizes, 1);
        }
    }

    out
}

fn write_sizes_line(out: &mut String, label: &str, sizes: &crate::summary::Sizes, indent: usize) {
    let padding = "  ".repeat(indent);
    if sizes.total_bytes == sizes.private_bytes {
        out.push_str(&format!("{padding}{label} {}\n", format_size(sizes.private_bytes)));
    } else {
        out.push_str(&format!(
            "{padding}{label} {} {} {}\n",
            format_size(sizes.private_bytes),
            format_size(sizes.scaled_bytes),
            format_size(sizes.total_bytes)
        ));
    }
}

/// Renders a digest as descending `<name>: <size>` lines, one per line, for
/// the pressure-driven logger (§4.7) to fold newlines out of before logging.
#[must_use]
pub fn print_digest(digest: &Digest) -> String {
    let mut out = String::new();
    for bucket in &digest.buckets {
        out.push_str(&format!("{}: {}\n", bucket.name, format_size(bucket.size)));
    }
    out
}

/// Writes a summary as CSV: `time_seconds,koid,name,private,scaled,total`,
/// one row per process (and the synthetic kernel row), optionally narrowed
/// to a single `pid`.
pub fn output_summary(summary: &Summary, pid: Option<u64>) -> Result<String, csv::Error> {
    let mut writer = csv::WriterBuilder::new().has_headers(true).from_writer(Vec::new());
    writer.write_record(["time_seconds", "koid", "name", "private", "scaled", "total"])?;

    let time_seconds = summary.time_ns / 1_000_000_000;
    for process in &summary.processes {
        if let Some(pid) = pid {
            if process.koid != pid {
                continue;
            }
        }
        writer.write_record(&[
            time_seconds.to_string(),
            process.koid.to_string(),
            process.name.clone(),
            process.sizes.private_bytes.to_string(),
            process.sizes.scaled_bytes.to_string(),
            process.sizes.total_bytes.to_string(),
        ])?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Writes a digest as CSV: `time_seconds,bucket,size_bytes`.
pub fn output_digest(digest: &Digest) -> Result<String, csv::Error> {
    let mut writer = csv::WriterBuilder::new().has_headers(true).from_writer(Vec::new());
    writer.write_record(["time_seconds", "bucket", "size_bytes"])?;
    let time_seconds = digest.time_ns / 1_000_000_000;
    for bucket in &digest.buckets {
        writer.write_record(&[time_seconds.to_string(), bucket.name.clone(), bucket.size.to_string()])?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[derive(Serialize)]
struct JsonVmo<'a> {
    koid: u64,
    parent_koid: Option<u64>,
    name: &'a str,
    committed_bytes: u64,
    allocated_bytes: u64,
}

#[derive(Serialize)]
struct JsonProcess<'a> {
    koid: u64,
    name: &'a str,
    vmos: &'a [u64],
}

#[derive(Serialize)]
struct JsonCapture<'a> {
    time_ns: u64,
    kmem: &'a crate::capture::KernelStats,
    processes: Vec<JsonProcess<'a>>,
    vmos: Vec<JsonVmo<'a>>,
}

/// Dumps a full capture as JSON, for offline analysis tooling.
pub fn capture_to_json(capture: &Capture) -> Result<String, serde_json::Error> {
    let processes = capture
        .processes
        .values()
        .map(|p| JsonProcess { koid: p.koid, name: &p.name, vmos: &p.vmos })
        .collect();
    let vmos = capture
        .vmos
        .values()
        .map(|v| JsonVmo {
            koid: v.koid,
            parent_koid: v.parent_koid,
            name: &v.name,
            committed_bytes: v.committed_bytes,
            allocated_bytes: v.allocated_bytes,
        })
        .collect();
    let doc = JsonCapture { time_ns: capture.time_ns, kmem: &capture.kmem, processes, vmos };
    serde_json::to_string_pretty(&doc)
}

/// Writes `text` to `writer`, used by the CLI to direct rendered output to
/// stdout or a file without each caller re-deriving the error context.
pub fn write_to(mut writer: impl std::io::Write, text: &str) -> std::io::Result<()> {
    writer.write_all(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_size_exact_powers() {
        assert_eq!(format_size(0), "0B");
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1024), "1K");
        assert_eq!(format_size(1024 * 1024), "1M");
    }

    #[test]
    fn format_size_rounds_half_up_into_tenths() {
        assert_eq!(format_size(1536), "1.5K");
        assert_eq!(format_size(1024 + 100), "1.1K");
        assert_eq!(format_size(1024 + 1000), "2K");
    }

    #[test]
    fn format_size_carries_on_rounding_to_ten_tenths() {
        // A remainder just below 1024 should carry into the next whole unit
        // rather than print as "2.0K" or "1.10K".
        assert_eq!(format_size(1024 * 2 - 1), "2K");
    }
}
