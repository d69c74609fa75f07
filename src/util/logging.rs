//! Standardized logging setup for Tenaya binaries and tests.
//!
//! All Rust logs follow the `YYYY-MM-DD HH:MM:SS LEVEL target: message`
//! format so that dispatcher traces line up with the rest of the stack.

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    // Default log level: info everywhere, debug for the dispatcher itself.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,tenaya=debug");
    }
    let _ = tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S".to_string(),
        ))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(false)
        .try_init();
}
