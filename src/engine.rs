//! Event correlation engine
//!
//! Consumes the live event stream and maintains per-process state scoped to
//! the descendants of a designated root process: identity, command line, the
//! ordered set of files read and the ordered set of files written. Response
//! files are captured opportunistically while still resolvable on disk, and
//! memory-mapped accesses are classified as reads or writes using the create
//! disposition recorded for the same (pid, path).
//!
//! All mutation is confined to the event-dispatch context; the resulting
//! [`TraceModel`] is only read after the session has fully stopped.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, trace};

use crate::events::{disposition_is_read, EventSource, StopToken, TraceEvent};
use crate::model::{ProcessRecord, RspFile, TraceModel, ROOT_COMMAND_LINE};
use crate::paths;

/// Ordered set of paths: deduplicated, first observation wins the slot.
#[derive(Debug, Default)]
struct PathSet {
    seen: HashSet<String>,
    order: Vec<String>,
}

impl PathSet {
    fn insert(&mut self, path: &str) {
        if self.seen.insert(path.to_string()) {
            self.order.push(path.to_string());
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.order
    }
}

/// Per-process correlation state. Created when a start event names an
/// already-tracked parent; never evicted, because file events for a pid can
/// arrive after its stop notification due to delivery buffering.
#[derive(Debug, Default)]
struct ProcState {
    command_line: String,
    reads: PathSet,
    writes: PathSet,
}

/// A response file whose handle is held open until finalization. An open
/// handle keeps the content readable even after the owning process deletes
/// the file.
struct RspCapture {
    path: String,
    file: File,
}

/// Correlates the raw event stream into per-process records.
///
/// Confined to the dispatch context of the event source that feeds it; no
/// internal locking is needed because no reader crosses the stop boundary.
pub struct Correlator {
    /// Tracked processes keyed by pid, insertion order preserved separately.
    records: HashMap<i32, ProcState>,
    order: Vec<i32>,
    /// Create disposition per (pid, path), consulted to classify map events.
    dispositions: HashMap<(i32, String), u32>,
    captures: Vec<RspCapture>,
    captured_paths: HashSet<String>,
}

impl Correlator {
    /// Start tracking with the root process pre-registered under a sentinel
    /// command line (its real one predates the session).
    pub fn new(root_pid: i32) -> Self {
        let mut correlator = Self {
            records: HashMap::new(),
            order: Vec::new(),
            dispositions: HashMap::new(),
            captures: Vec::new(),
            captured_paths: HashSet::new(),
        };
        correlator.register(root_pid, ROOT_COMMAND_LINE.to_string());
        correlator
    }

    fn register(&mut self, pid: i32, command_line: String) {
        self.records.insert(
            pid,
            ProcState {
                command_line,
                ..ProcState::default()
            },
        );
        self.order.push(pid);
    }

    fn is_tracked(&self, pid: i32) -> bool {
        self.records.contains_key(&pid)
    }

    /// Apply one event. Events for untracked processes are ignored; the
    /// tracing collaborator also reports unrelated system activity.
    pub fn handle(&mut self, event: TraceEvent) {
        match event {
            TraceEvent::ProcessStart {
                pid,
                parent,
                command_line,
                name,
            } => self.on_process_start(pid, parent, command_line, name),
            TraceEvent::ProcessStop { pid, parent, name } => {
                // Recorded for diagnostics only; the record stays live so
                // buffered file events for this pid still correlate.
                if self.is_tracked(pid) {
                    info!(pid, parent, %name, "process stop");
                }
            }
            TraceEvent::FileCreate {
                pid,
                path,
                disposition,
                share_access,
                create_options,
            } => self.on_file_create(pid, path, disposition, share_access, create_options),
            TraceEvent::FileMap { pid, path } => self.on_file_map(pid, path),
            TraceEvent::FileRead { pid, path } => {
                if let Some(state) = self.records.get_mut(&pid) {
                    state.reads.insert(&path);
                }
            }
            TraceEvent::FileWrite { pid, path } => {
                if let Some(state) = self.records.get_mut(&pid) {
                    state.writes.insert(&path);
                }
            }
        }
    }

    fn on_process_start(&mut self, pid: i32, parent: i32, command_line: String, name: String) {
        if let Some(state) = self.records.get_mut(&pid) {
            // An exec observed in an already-registered process: refresh the
            // command line, keep the accumulated read/write sets.
            debug!(pid, %command_line, "command line refreshed");
            state.command_line = command_line;
        } else if self.is_tracked(parent) {
            info!(pid, parent, %name, %command_line, "process start");
            self.register(pid, command_line);
        }
    }

    fn on_file_create(
        &mut self,
        pid: i32,
        path: String,
        disposition: u32,
        share_access: u32,
        create_options: u32,
    ) {
        if !self.is_tracked(pid) {
            return;
        }
        // Map events carry no disposition of their own; remember this one so
        // a later map of the same path can be classified.
        self.dispositions.insert((pid, path.clone()), disposition);

        if paths::is_response_file(&path) && !self.captured_paths.contains(&path) {
            // Open for shared, delete-tolerant read access while the file
            // still exists. A miss only degrades the emitted command line.
            match File::open(&path) {
                Ok(file) => {
                    debug!(
                        %path, disposition, share_access, create_options,
                        "response file captured"
                    );
                    self.captured_paths.insert(path.clone());
                    self.captures.push(RspCapture { path, file });
                }
                Err(err) => {
                    debug!(%path, %err, "response file vanished before capture");
                }
            }
        }
    }

    fn on_file_map(&mut self, pid: i32, path: String) {
        if !self.is_tracked(pid) {
            return;
        }
        match self.dispositions.get(&(pid, path.clone())) {
            Some(&disposition) if disposition_is_read(disposition) => {
                if let Some(state) = self.records.get_mut(&pid) {
                    state.reads.insert(&path);
                }
            }
            Some(_) => {
                if let Some(state) = self.records.get_mut(&pid) {
                    state.writes.insert(&path);
                }
            }
            None => {
                // No recorded disposition: direction is ambiguous, and a
                // wrong guess would corrupt the graph. Drop it.
                trace!(pid, %path, "map with unknown disposition dropped");
            }
        }
    }

    /// Extract every held response-file capture and assemble the model.
    /// Each handle is released exactly once, here.
    pub fn finish(mut self) -> TraceModel {
        let mut rsp_files = Vec::with_capacity(self.captures.len());
        for capture in &mut self.captures {
            let mut bytes = Vec::new();
            match capture.file.read_to_end(&mut bytes) {
                Ok(_) => rsp_files.push(RspFile {
                    file_name: capture.path.clone(),
                    contents: decode_text(&bytes),
                }),
                Err(err) => debug!(path = %capture.path, %err, "response file unreadable"),
            }
        }
        drop(self.captures);

        let mut records = self.records;
        let processes = self
            .order
            .iter()
            .filter_map(|pid| {
                records.remove(pid).map(|state| ProcessRecord {
                    pid: *pid,
                    command_line: state.command_line,
                    reads: state.reads.into_vec(),
                    writes: state.writes.into_vec(),
                })
            })
            .collect();

        TraceModel {
            processes,
            rsp_files,
        }
    }
}

/// Decode captured bytes to text, honoring a byte order mark.
/// UTF-16 (either endianness) and UTF-8 BOMs are recognized; everything else
/// is treated as UTF-8.
fn decode_text(bytes: &[u8]) -> String {
    match bytes {
        [0xFF, 0xFE, rest @ ..] => utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => utf16(rest, u16::from_be_bytes),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn utf16(bytes: &[u8], decode: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| decode([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Run one capture session: correlate everything the source delivers until
/// either `timeout` elapses or `stop` is requested externally, then finalize.
///
/// Partial data is a valid, non-error result; only a failure of the source
/// itself is an error.
pub fn run<S: EventSource>(
    mut source: S,
    root_pid: i32,
    timeout: Duration,
    stop: StopToken,
) -> Result<TraceModel> {
    let mut correlator = Correlator::new(root_pid);

    // Deadline timer. Racing with an operator interrupt is fine: the token
    // is idempotent.
    let timer_stop = stop.clone();
    thread::spawn(move || {
        thread::sleep(timeout);
        timer_stop.stop();
    });

    source.run(&stop, &mut |event| correlator.handle(event))?;
    Ok(correlator.finish())
}
