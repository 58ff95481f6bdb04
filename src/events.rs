//! Event stream consumed by the correlation engine
//!
//! The kernel tracing collaborator delivers one [`TraceEvent`] per observed
//! process or file-I/O operation. The engine only relies on the fields here;
//! how the events are acquired is the collaborator's business (see
//! [`crate::tracer`] for the ptrace-based one).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

/// Create disposition delivered with a [`TraceEvent::FileCreate`].
///
/// The provider's headers document a different numeric value for its generic
/// "open" constant, but the events it actually delivers carry 1 for an open
/// of an existing file. 1 is the only value that reliably means the handle
/// refers to pre-existing content; treat it as read evidence and every other
/// disposition as write evidence. Keep the comparison behind
/// [`disposition_is_read`] and do not spread the magic number.
pub const DISPOSITION_OPEN_EXISTING: u32 = 1;

/// Disposition for create/overwrite opens.
pub const DISPOSITION_CREATE: u32 = 2;

/// Whether a recorded create disposition is evidence that a later
/// memory-mapped access of the same path was a read.
pub fn disposition_is_read(disposition: u32) -> bool {
    disposition == DISPOSITION_OPEN_EXISTING
}

/// One observed process or file-I/O event, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    ProcessStart {
        pid: i32,
        parent: i32,
        command_line: String,
        name: String,
    },
    ProcessStop {
        pid: i32,
        parent: i32,
        name: String,
    },
    FileCreate {
        pid: i32,
        path: String,
        disposition: u32,
        share_access: u32,
        create_options: u32,
    },
    FileMap {
        pid: i32,
        path: String,
    },
    FileRead {
        pid: i32,
        path: String,
    },
    FileWrite {
        pid: i32,
        path: String,
    },
}

/// Cooperative stop request shared between the capture timer, the operator
/// interrupt and the event source. Stopping twice is a no-op.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A push-based source of [`TraceEvent`]s.
///
/// `run` blocks the caller and delivers events synchronously into `sink`
/// until the stop token is set or the source is exhausted. Delivery is
/// confined to the calling thread, so the sink may hold `&mut` state.
pub trait EventSource {
    fn run(&mut self, stop: &StopToken, sink: &mut dyn FnMut(TraceEvent)) -> Result<()>;
}

/// Replays a prerecorded event stream, then returns.
///
/// Used by tests and by embedders that persist a raw event log and want to
/// re-run correlation offline.
#[derive(Debug, Default)]
pub struct ReplaySource {
    events: Vec<TraceEvent>,
}

impl ReplaySource {
    pub fn new(events: Vec<TraceEvent>) -> Self {
        Self { events }
    }
}

impl EventSource for ReplaySource {
    fn run(&mut self, stop: &StopToken, sink: &mut dyn FnMut(TraceEvent)) -> Result<()> {
        for event in self.events.drain(..) {
            if stop.is_stopped() {
                break;
            }
            sink(event);
        }
        Ok(())
    }
}
