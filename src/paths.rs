//! Path classification for the dependency graph
//!
//! Pure predicates deciding whether a path is a response/argument file or is
//! build-system noise that must not appear as an input or output.

/// Suffix of response/argument files produced by compiler drivers.
pub const RSP_SUFFIX: &str = "rsp";

/// Prefix the OS gives freshly created temporary files.
const RSP_PREFIX: &str = "tmp";

/// Base name of a path, tolerating both path separators.
fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// True iff `path` names a response/argument file: a temporary file holding
/// command-line arguments too long for direct invocation.
pub fn is_response_file(path: &str) -> bool {
    let name = file_name(path);
    name.starts_with(RSP_PREFIX) && name.ends_with(RSP_SUFFIX)
}

/// True iff `path` is build-system bookkeeping rather than a genuine
/// input or output: empty paths, anything under a temp directory, tracker
/// log files and prefetch files.
pub fn is_noise_path(path: &str) -> bool {
    if path.is_empty() {
        return true;
    }
    let lower = path.to_ascii_lowercase();
    lower.contains("/tmp/")
        || lower.contains("\\temp\\")
        || lower.ends_with(".tlog")
        || lower.ends_with(".pf")
}
