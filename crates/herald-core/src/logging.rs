use tracing_subscriber::{fmt, EnvFilter};

use crate::{Error, Result};

/// Install the global tracing subscriber.
///
/// Default: info for herald crates and `service_name`, warn for everything
/// else. Can be overridden with `RUST_LOG`.
pub fn init(service_name: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,herald=info,herald_core=info,herald_drivers=info,{service_name}=info"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| Error::config(format!("logging already initialised: {e}")))
}
