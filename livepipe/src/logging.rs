//! Logging initialisation

use livepipe_core::PipelineResult;
use tracing_subscriber::EnvFilter;

/// Install a formatted `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `filter`. Returns `Ok(false)` when a
/// global subscriber is already installed.
pub fn init_logging(filter: &str) -> PipelineResult<bool> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .is_ok();
    Ok(installed)
}
