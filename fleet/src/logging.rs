//! Diagnostic tracing for operators.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: human diagnostics via `RUST_LOG`, output to
//!   stderr. Not persisted.
//! - **Ledger and audit (`io/ledger`, `io/audit`)**: product records under the
//!   state directory. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `verbosity` selects the default level:
/// 0 → `warn`, 1 → `info`, 2+ → `debug`.
///
/// # Example
/// ```bash
/// RUST_LOG=fleet=debug fleet run ~/src/*
/// ```
pub fn init(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second init (e.g. tests driving `main` twice) is harmless; keep the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
