//! Subscriber setup for binaries embedding the throttle service.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the host unless it opts into this helper.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

/// Install a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `level`. Set `THROTTLE_LOG_FORMAT=json` for JSON output.
///
/// ```no_run
/// use adaptive_throttle::tracer::init_tracer;
///
/// init_tracer(None)?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
    let default_filter = if cfg!(any(test, debug_assertions)) {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter_layer = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(level.unwrap_or(default_filter).into())
        .from_env_lossy();

    let use_json = std::env::var("THROTTLE_LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let fmt_layer = if use_json {
        tracing_subscriber::fmt::layer()
            .with_level(true)
            .json()
            .with_file(cfg!(any(test, debug_assertions)))
            .with_line_number(cfg!(any(test, debug_assertions)))
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_level(true)
            .pretty()
            .with_file(cfg!(any(test, debug_assertions)))
            .with_line_number(cfg!(any(test, debug_assertions)))
            .boxed()
    };

    let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
