//! Raw trace model produced by the correlation engine
//!
//! Plain data, immutable once the capture session has ended. Serializable so
//! intermediate state can be dumped for debugging.

use serde::{Deserialize, Serialize};

/// Command line recorded for the root process, whose real command line was
/// never observed (it predates the capture session).
pub const ROOT_COMMAND_LINE: &str = "root";

/// One observed process, including the root.
///
/// `reads` and `writes` are deduplicated and keep first-observation order.
/// The pid is only unique for the lifetime of the process; a record is never
/// rebound after creation even if the OS reuses the pid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: i32,
    pub command_line: String,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
}

/// Contents of a response/argument file, captured before the owning process
/// could delete it. `file_name` is the literal path as delivered by the
/// create event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspFile {
    pub file_name: String,
    pub contents: String,
}

/// Everything observed during one capture session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceModel {
    pub processes: Vec<ProcessRecord>,
    pub rsp_files: Vec<RspFile>,
}

impl TraceModel {
    /// Captured response-file content for the given literal path, if any.
    pub fn rsp_file(&self, path: &str) -> Option<&RspFile> {
        self.rsp_files.iter().find(|rsp| rsp.file_name == path)
    }
}

/// One canonical build command, post-processed from a [`ProcessRecord`].
/// Invariant: `file_writes` is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_line: String,
    pub file_reads: Vec<String>,
    pub file_writes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsp_file: Option<RspFile>,
}
