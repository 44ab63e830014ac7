//! tracing-subscriber wiring, compiled in through the `trace` feature.
//!
//! Filtering follows `RUST_LOG` over a build-dependent default (debug in
//! test/debug builds, info otherwise). `TAPNET_LOG_FORMAT=json` switches to
//! line-oriented JSON, `TAPNET_LOG_TO_STDERR` redirects away from stdout so
//! scenario output stays clean, and `TAPNET_DISABLE_LOGS` installs only the
//! filter with no output layer.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{Layer, Registry};

pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
    let default_filter = if cfg!(any(test, debug_assertions)) {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let default_filter = level.unwrap_or(default_filter);
    let filter_layer = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env_lossy();

    use tracing_subscriber::layer::SubscriberExt;

    if std::env::var("TAPNET_DISABLE_LOGS").is_ok() {
        return Ok(());
    }
    let to_stderr = std::env::var("TAPNET_LOG_TO_STDERR").is_ok();
    let use_json = std::env::var("TAPNET_LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);
    let with_locations = cfg!(any(test, debug_assertions));

    let fmt_layer = match (use_json, to_stderr) {
        (true, true) => tracing_subscriber::fmt::layer()
            .with_level(true)
            .json()
            .with_file(with_locations)
            .with_line_number(with_locations)
            .with_writer(std::io::stderr)
            .boxed(),
        (true, false) => tracing_subscriber::fmt::layer()
            .with_level(true)
            .json()
            .with_file(with_locations)
            .with_line_number(with_locations)
            .boxed(),
        (false, true) => tracing_subscriber::fmt::layer()
            .with_level(true)
            .pretty()
            .with_file(with_locations)
            .with_line_number(with_locations)
            .with_writer(std::io::stderr)
            .boxed(),
        (false, false) => tracing_subscriber::fmt::layer()
            .with_level(true)
            .pretty()
            .with_file(with_locations)
            .with_line_number(with_locations)
            .boxed(),
    };

    let filtered = fmt_layer.with_filter(filter_layer);
    let subscriber = Registry::default().with(filtered);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
