//! Ptrace-based event source
//!
//! The Linux tracing collaborator: attaches to the root process, follows
//! forks, vforks, clones and execs, and translates file-related syscalls into
//! the engine's event stream. Paths for create, read, write and map events
//! all come from the same `/proc/<pid>/fd` resolver so exact-string
//! correlation holds across event types.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::debug;

use crate::events::{
    EventSource, StopToken, TraceEvent, DISPOSITION_CREATE, DISPOSITION_OPEN_EXISTING,
};

/// Fatal setup failure: the tracer could not be attached and configured.
/// Distinct from capture-time degradation, which is never surfaced.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("failed to attach to process {pid}: {source}")]
    Attach { pid: i32, source: Errno },
    #[error("failed to wait for attach stop on process {pid}: {source}")]
    Wait { pid: i32, source: Errno },
    #[error("failed to set trace options on process {pid}: {source}")]
    SetOptions { pid: i32, source: Errno },
}

// x86_64 syscall numbers decoded by this source.
const SYS_READ: u64 = 0;
const SYS_WRITE: u64 = 1;
const SYS_OPEN: u64 = 2;
const SYS_MMAP: u64 = 9;
const SYS_PREAD64: u64 = 17;
const SYS_PWRITE64: u64 = 18;
const SYS_READV: u64 = 19;
const SYS_WRITEV: u64 = 20;
const SYS_CREAT: u64 = 85;
const SYS_OPENAT: u64 = 257;

/// Per-tracee bookkeeping.
#[derive(Debug, Default)]
struct Tracee {
    /// Open flags recorded at open/openat entry, resolved at exit once the
    /// returned descriptor names a canonical path.
    pending_open: Option<u64>,
    comm: String,
}

/// Event source backed by `PTRACE_ATTACH` with fork following.
pub struct PtraceSource {
    root: Pid,
    tracees: HashMap<Pid, Tracee>,
    parents: HashMap<Pid, Pid>,
}

impl PtraceSource {
    /// Attach to the root process and arm fork/exec following. Children
    /// created after this point are traced automatically; siblings and
    /// pre-existing children are not.
    pub fn attach(root_pid: i32) -> Result<Self, AttachError> {
        let root = Pid::from_raw(root_pid);

        ptrace::attach(root).map_err(|source| AttachError::Attach {
            pid: root_pid,
            source,
        })?;
        waitpid(root, None).map_err(|source| AttachError::Wait {
            pid: root_pid,
            source,
        })?;

        // No PTRACE_O_EXITKILL: the traced build must survive a detach.
        let options = Options::PTRACE_O_TRACESYSGOOD
            | Options::PTRACE_O_TRACEFORK
            | Options::PTRACE_O_TRACEVFORK
            | Options::PTRACE_O_TRACECLONE
            | Options::PTRACE_O_TRACEEXEC;
        ptrace::setoptions(root, options).map_err(|source| AttachError::SetOptions {
            pid: root_pid,
            source,
        })?;

        eprintln!("[buildtrace: attached to process {root_pid}]");

        let mut tracees = HashMap::new();
        tracees.insert(
            root,
            Tracee {
                comm: read_comm(root),
                ..Tracee::default()
            },
        );

        Ok(Self {
            root,
            tracees,
            parents: HashMap::new(),
        })
    }

    fn register(&mut self, pid: Pid) {
        self.tracees.entry(pid).or_insert_with(|| Tracee {
            comm: read_comm(pid),
            ..Tracee::default()
        });
    }

    fn parent_of(&self, pid: Pid) -> i32 {
        self.parents.get(&pid).map_or(0, |p| p.as_raw())
    }

    fn on_syscall_stop(&mut self, pid: Pid, sink: &mut dyn FnMut(TraceEvent)) {
        self.register(pid);
        let Ok(regs) = ptrace::getregs(pid) else {
            return;
        };

        // At syscall entry the kernel preloads rax with -ENOSYS; anything
        // else is an exit stop. This stays correct for fork children, whose
        // first observed stop is the exit of the clone that created them.
        if regs.rax as i64 == -(Errno::ENOSYS as i32 as i64) {
            self.on_syscall_entry(pid, &regs, sink);
        } else {
            self.on_syscall_exit(pid, &regs, sink);
        }
    }

    fn on_syscall_entry(
        &mut self,
        pid: Pid,
        regs: &libc::user_regs_struct,
        sink: &mut dyn FnMut(TraceEvent),
    ) {
        let raw = pid.as_raw();
        match regs.orig_rax {
            SYS_OPEN => self.set_pending_open(pid, regs.rsi),
            SYS_OPENAT => self.set_pending_open(pid, regs.rdx),
            SYS_CREAT => self.set_pending_open(pid, (libc::O_CREAT | libc::O_TRUNC) as u64),
            SYS_READ | SYS_PREAD64 | SYS_READV => {
                if let Some(path) = fd_path(pid, regs.rdi as i32) {
                    sink(TraceEvent::FileRead { pid: raw, path });
                }
            }
            SYS_WRITE | SYS_PWRITE64 | SYS_WRITEV => {
                if let Some(path) = fd_path(pid, regs.rdi as i32) {
                    sink(TraceEvent::FileWrite { pid: raw, path });
                }
            }
            SYS_MMAP => {
                let fd = regs.r8 as i32;
                if fd >= 0 {
                    if let Some(path) = fd_path(pid, fd) {
                        sink(TraceEvent::FileMap { pid: raw, path });
                    }
                }
            }
            _ => {}
        }
    }

    fn on_syscall_exit(
        &mut self,
        pid: Pid,
        regs: &libc::user_regs_struct,
        sink: &mut dyn FnMut(TraceEvent),
    ) {
        let Some(flags) = self
            .tracees
            .get_mut(&pid)
            .and_then(|tracee| tracee.pending_open.take())
        else {
            return;
        };
        let ret = regs.rax as i64;
        if ret < 0 {
            return;
        }
        // Resolve through the returned descriptor: the canonical path the
        // later read/write/map events will carry.
        if let Some(path) = fd_path(pid, ret as i32) {
            sink(TraceEvent::FileCreate {
                pid: pid.as_raw(),
                path,
                disposition: disposition_from_flags(flags),
                share_access: 0,
                create_options: flags as u32,
            });
        }
    }

    fn set_pending_open(&mut self, pid: Pid, flags: u64) {
        if let Some(tracee) = self.tracees.get_mut(&pid) {
            tracee.pending_open = Some(flags);
        }
    }

    fn on_ptrace_event(&mut self, pid: Pid, event: i32, sink: &mut dyn FnMut(TraceEvent)) {
        match event {
            libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
                if let Ok(child) = ptrace::getevent(pid) {
                    let child = Pid::from_raw(child as i32);
                    self.parents.insert(child, pid);
                    self.register(child);
                    // Command line is still the parent's image; the exec
                    // event refreshes it.
                    sink(TraceEvent::ProcessStart {
                        pid: child.as_raw(),
                        parent: pid.as_raw(),
                        command_line: read_cmdline(child),
                        name: read_comm(child),
                    });
                }
            }
            libc::PTRACE_EVENT_EXEC => {
                sink(TraceEvent::ProcessStart {
                    pid: pid.as_raw(),
                    parent: self.parent_of(pid),
                    command_line: read_cmdline(pid),
                    name: read_comm(pid),
                });
            }
            _ => debug!(pid = pid.as_raw(), event, "unhandled ptrace event"),
        }
    }

    fn on_exit(&mut self, pid: Pid, sink: &mut dyn FnMut(TraceEvent)) {
        if let Some(tracee) = self.tracees.remove(&pid) {
            sink(TraceEvent::ProcessStop {
                pid: pid.as_raw(),
                parent: self.parent_of(pid),
                name: tracee.comm,
            });
        }
    }

    /// Stop every surviving tracee, detach and let it continue untraced.
    /// Errors are ignored throughout; a tracee may already be gone.
    fn detach_all(&mut self) {
        for &pid in self.tracees.keys() {
            let _ = signal::kill(pid, Signal::SIGSTOP);
            let _ = waitpid(pid, Some(WaitPidFlag::__WALL));
            let _ = ptrace::detach(pid, None);
            let _ = signal::kill(pid, Signal::SIGCONT);
        }
        self.tracees.clear();
        eprintln!("[buildtrace: detached]");
    }

    fn resume(&self, pid: Pid, sig: Option<Signal>) {
        // ESRCH here means the tracee died between stops.
        let _ = ptrace::syscall(pid, sig);
    }
}

impl EventSource for PtraceSource {
    fn run(&mut self, stop: &StopToken, sink: &mut dyn FnMut(TraceEvent)) -> Result<()> {
        self.resume(self.root, None);

        loop {
            if stop.is_stopped() {
                self.detach_all();
                return Ok(());
            }

            // Non-blocking wait keeps the stop token responsive; waitpid has
            // no timeout of its own.
            match waitpid(
                None::<Pid>,
                Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL),
            ) {
                Ok(WaitStatus::StillAlive) => thread::sleep(Duration::from_millis(1)),
                Ok(WaitStatus::PtraceSyscall(pid)) => {
                    self.on_syscall_stop(pid, sink);
                    self.resume(pid, None);
                }
                Ok(WaitStatus::PtraceEvent(pid, _, event)) => {
                    self.on_ptrace_event(pid, event, sink);
                    self.resume(pid, None);
                }
                Ok(WaitStatus::Stopped(pid, sig)) => {
                    // First stop of a freshly cloned child arrives here.
                    let first = !self.tracees.contains_key(&pid);
                    self.register(pid);
                    let forward = match sig {
                        _ if first => None,
                        Signal::SIGSTOP | Signal::SIGTRAP => None,
                        other => Some(other),
                    };
                    self.resume(pid, forward);
                }
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    self.on_exit(pid, sink);
                    if self.tracees.is_empty() {
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => return Ok(()),
                Err(Errno::EINTR) => {}
                Err(err) => return Err(err).context("waitpid failed"),
            }
        }
    }
}

/// Map open(2) flags onto the create disposition the engine consumes.
/// Creating or truncating is write evidence; everything else opens existing
/// content.
fn disposition_from_flags(flags: u64) -> u32 {
    let create_mask = (libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL) as u64;
    if flags & create_mask != 0 {
        DISPOSITION_CREATE
    } else {
        DISPOSITION_OPEN_EXISTING
    }
}

/// Canonical path behind a descriptor, via `/proc/<pid>/fd`. Pipes, sockets
/// and anonymous inodes resolve to non-absolute targets and are skipped.
fn fd_path(pid: Pid, fd: i32) -> Option<String> {
    let link = std::fs::read_link(format!("/proc/{pid}/fd/{fd}")).ok()?;
    let target = link.to_string_lossy();
    let target = target.strip_suffix(" (deleted)").unwrap_or(&target);
    if target.starts_with('/') {
        Some(target.to_string())
    } else {
        None
    }
}

/// Full command line from `/proc/<pid>/cmdline`, NUL separators replaced by
/// spaces. Empty for kernel threads and for processes already gone.
fn read_cmdline(pid: Pid) -> String {
    let Ok(bytes) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
        return String::new();
    };
    let parts: Vec<String> = bytes
        .split(|byte| *byte == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    parts.join(" ")
}

fn read_comm(pid: Pid) -> String {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|comm| comm.trim_end().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_disposition_open_existing_without_create_flags() {
        assert_eq!(
            disposition_from_flags(libc::O_RDONLY as u64),
            DISPOSITION_OPEN_EXISTING
        );
        assert_eq!(
            disposition_from_flags(libc::O_RDWR as u64),
            DISPOSITION_OPEN_EXISTING
        );
    }

    #[test]
    fn test_disposition_create_for_creat_and_trunc() {
        assert_eq!(
            disposition_from_flags((libc::O_WRONLY | libc::O_CREAT) as u64),
            DISPOSITION_CREATE
        );
        assert_eq!(
            disposition_from_flags((libc::O_RDWR | libc::O_TRUNC) as u64),
            DISPOSITION_CREATE
        );
    }

    #[test]
    fn test_fd_path_resolves_regular_files() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let me = Pid::from_raw(std::process::id() as i32);
        let path = fd_path(me, file.as_file().as_raw_fd()).unwrap();
        assert!(path.starts_with('/'));
        assert_eq!(path, file.path().to_string_lossy());
    }

    #[test]
    fn test_fd_path_skips_pipes() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let me = Pid::from_raw(std::process::id() as i32);
        assert_eq!(fd_path(me, read_end.as_raw_fd()), None);
    }

    #[test]
    fn test_read_cmdline_of_self_mentions_test_binary() {
        let me = Pid::from_raw(std::process::id() as i32);
        assert!(read_cmdline(me).contains("buildtrace"));
    }

    #[test]
    fn test_attach_to_missing_process_is_setup_error() {
        // Pid -1 is never attachable; must surface as AttachError, not panic.
        let err = PtraceSource::attach(-1).err().unwrap();
        assert!(matches!(err, AttachError::Attach { pid: -1, .. }));
    }
}
