//! Trace post-processing
//!
//! Converts the raw [`TraceModel`] into the canonical command list: drops
//! processes that produced no build output, removes self-write overlap from
//! read sets, attaches captured response-file content and filters out noise
//! paths. Pure functions over already-validated data.

use std::collections::HashSet;

use crate::model::{Command, ProcessRecord, TraceModel};
use crate::paths::{self, RSP_SUFFIX};

/// Canonicalize one process record, or `None` if it wrote nothing and is
/// therefore irrelevant to a build graph.
fn to_command(trace: &TraceModel, record: &ProcessRecord) -> Option<Command> {
    let writes: HashSet<&str> = record.writes.iter().map(String::as_str).collect();

    // A process that both reads and writes a path is modeled as writing it;
    // read-after-write is not an external input.
    let reads: Vec<&String> = record
        .reads
        .iter()
        .filter(|path| !writes.contains(path.as_str()))
        .collect();

    // Response-file lookup happens before noise filtering: the argument file
    // itself lives in a temp directory and would otherwise be gone already.
    // Absence of a capture is fine; not every tool uses one.
    let rsp_file = reads
        .iter()
        .find(|path| path.ends_with(RSP_SUFFIX))
        .and_then(|path| trace.rsp_file(path.as_str()))
        .cloned();

    let file_reads: Vec<String> = reads
        .into_iter()
        .filter(|path| !paths::is_noise_path(path))
        .cloned()
        .collect();
    let file_writes: Vec<String> = record
        .writes
        .iter()
        .filter(|path| !paths::is_noise_path(path))
        .cloned()
        .collect();

    if file_writes.is_empty() {
        return None;
    }

    Some(Command {
        command_line: record.command_line.clone(),
        file_reads,
        file_writes,
        rsp_file,
    })
}

/// Canonical command list in process discovery order.
pub fn post_process(trace: &TraceModel) -> Vec<Command> {
    trace
        .processes
        .iter()
        .filter_map(|record| to_command(trace, record))
        .collect()
}
