#![cfg(not(tarpaulin_include))]

use rollcall::app;
use rollcall::config::Settings;

/// Main entry point for the roll-call viewer
///
/// Initializes logging (`RUST_LOG`, default `info`), reads the settings from
/// the environment and serves the viewer until the process is stopped.
///
/// # Returns
/// * `Result<(), Box<dyn std::error::Error>>` - Success or error object
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::from_env();
    log::info!(
        "cache ttl {}s, max staleness {}",
        settings.cache.ttl.as_secs(),
        settings
            .cache
            .max_staleness
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "unbounded".to_string())
    );

    app::run(settings).await
}
