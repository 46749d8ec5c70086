//! Convenience tracing setup, grounded on the pack's `tracing_subscriber::fmt::init()`
//! pattern. Not required — a host application may install its own
//! subscriber instead.

/// Installs an env-filterable `fmt` subscriber, defaulting to `info` when
/// `RUST_LOG` is unset.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .ok();
}
