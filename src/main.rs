use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use buildtrace::{cli::Cli, engine, events::StopToken, ninja, postprocess, tracer};
use clap::Parser;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing_subscriber::EnvFilter;

/// How long a capture session runs before the graph is finalized.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Structured dump of the post-processed command list.
const TRACE_DUMP_PATH: &str = "build_trace.json";

/// The emitted build-graph document.
const NINJA_PATH: &str = "build.ninja";

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Initialize tracing subscriber for diagnostic output. Level is driven by
/// `RUST_LOG`, defaulting to `info`.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Route SIGINT into the session's stop token so an operator abort finalizes
/// the partial trace instead of discarding it.
fn install_interrupt(stop: StopToken) -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGINT, &action) }
        .context("failed to install SIGINT handler")?;

    thread::spawn(move || loop {
        if INTERRUPTED.load(Ordering::SeqCst) {
            eprintln!("[buildtrace: interrupted, finalizing trace]");
            stop.stop();
            return;
        }
        if stop.is_stopped() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    });
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing();

    // A failure to attach is the one fatal error; everything after this
    // degrades gracefully and still yields a (possibly partial) graph.
    let source = tracer::PtraceSource::attach(args.root_pid)?;

    let stop = StopToken::new();
    install_interrupt(stop.clone())?;

    let trace = engine::run(source, args.root_pid, CAPTURE_TIMEOUT, stop)?;
    let commands = postprocess::post_process(&trace);

    let dump = serde_json::to_string_pretty(&commands).context("failed to serialize commands")?;
    std::fs::write(TRACE_DUMP_PATH, dump)
        .with_context(|| format!("failed to write {TRACE_DUMP_PATH}"))?;

    std::fs::write(NINJA_PATH, ninja::commands_to_ninja(&commands))
        .with_context(|| format!("failed to write {NINJA_PATH}"))?;

    eprintln!(
        "[buildtrace: {} commands -> {TRACE_DUMP_PATH}, {NINJA_PATH}]",
        commands.len()
    );
    Ok(())
}
