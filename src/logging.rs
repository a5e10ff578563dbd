use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global subscriber: stderr formatting filtered by `RUST_LOG`,
/// falling back to `info`.
pub fn init() {
    init_with_default("info");
}

/// Like [`init`] with a caller-chosen fallback filter. Calling it twice is a
/// no-op.
pub fn init_with_default(default_filter: &str) {
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(filter_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_does_not_panic() {
        init_with_default("warn");
        init_with_default("debug");
        tracing::info!("logging initialized");
    }
}
