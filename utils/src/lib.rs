//! Process-level helpers shared by the netquant binaries.

use bytesize::ByteSize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Install the global `tracing` subscriber.
///
/// The filter defaults to `INFO` and can be overridden through `RUST_LOG`. Returns an
/// error message if a global subscriber was already installed.
pub fn setup_logging(json: bool) -> Result<(), String> {
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
    };
    let installed = if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(filter())
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = tracing_subscriber::fmt()
            .compact()
            .with_level(true)
            .with_target(false)
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };
    installed.map_err(|e| format!("setting up logging failed: {e}"))
}

/// Human readable size, e.g. `1.2 MiB`.
pub fn human_bytes(bytes: u64) -> String {
    ByteSize::b(bytes).display().iec().to_string()
}
