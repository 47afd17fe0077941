//! Logging setup
//!
//! Logs go to stderr so stdout stays reserved for the CSV report. The filter
//! comes from `RUST_LOG` and defaults to `info`.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// # Arguments
///
/// * `json` - Emit one JSON object per event instead of human-readable lines
///
/// # Returns
///
/// * `Ok(())` once installed
/// * `Err(String)` if a global subscriber is already set
pub fn init_logging(json: bool) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| format!("Failed to initialise logging: {}", e))
}
