//! Forkchat - streaming chat with branching history
//!
#![doc = "Forkchat - streaming chat with branching history"]
#![doc = "Main entry point for the forkchat command line."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use forkchat::cli::Cli;
use forkchat::commands;
use forkchat::config::Config;
use forkchat::session::metrics::init_metrics_exporter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    init_tracing(cli.verbose);
    init_metrics_exporter();

    // Load configuration (validated on load)
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;
    tracing::debug!(
        api_base = %config.provider.api_base,
        model = %config.provider.model,
        "Configuration loaded"
    );

    commands::run(cli, config).await
}

/// Initialize tracing subscriber with environment filter
///
/// Logs go to stderr; stdout carries reply text only.
fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        "forkchat=debug"
    } else {
        "forkchat=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let json = std::env::var("FORKCHAT_JSON_LOGS")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
