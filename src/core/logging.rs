use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset: engine events at `log_level`,
/// everything else at `warn`.
pub fn engine_directives(log_level: &str) -> String {
    format!("warn,{}={}", env!("CARGO_CRATE_NAME"), log_level)
}

/// Installs the global subscriber, writing to stderr so the epoch report on
/// stdout stays machine-readable.
pub fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(engine_directives(log_level)));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();

    tracing::debug!(log_level, "engine logging ready");
}
