//! Logging setup for stepflow using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. the environment variable named by [`LogConfig::env_var`] (`STEPFLOW_LOG`)
//! 2. [`LogConfig::level`]
//! 3. `info`

use crate::config::LogConfig;
use crate::step::StepMetadata;
use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Installs the global logging subscriber, writing to stderr.
///
/// Returns false if a subscriber was already installed, in which case the
/// existing one is kept.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_env(&config.env_var)
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.is_ok()
}

/// Creates the root span for one build; step spans nest under it.
#[must_use]
pub fn build_span(metadata: &StepMetadata) -> Span {
    tracing::info_span!(
        "build",
        build_id = metadata.build_id,
        team = %metadata.team_name,
        pipeline = %metadata.pipeline_name,
        job = %metadata.job_name,
    )
}
