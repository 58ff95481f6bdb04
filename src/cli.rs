//! CLI argument parsing for buildtrace

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "buildtrace")]
#[command(version)]
#[command(
    about = "Trace a build's process tree and emit its dependency graph as a Ninja file",
    long_about = None
)]
pub struct Cli {
    /// Process ID of the build's root process; its descendants are traced
    #[arg(value_name = "PID")]
    pub root_pid: i32,
}
