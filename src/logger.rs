//! tracing subscriber bootstrap
use crate::errors::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Build the filter for `level`; `RUST_LOG` wins when it is set and valid.
pub fn filter(level: &str) -> Result<EnvFilter> {
  if let Ok(filter) = EnvFilter::try_from_default_env() {
    return Ok(filter);
  }
  EnvFilter::try_new(level.trim()).map_err(|e| Error::config(format!("cannot parse log level {:?}: {}", level, e)))
}

/// Install the global fmt subscriber.
pub fn init(level: &str) -> Result<()> {
  tracing_subscriber::registry()
    .with(filter(level)?)
    .with(tracing_subscriber::fmt::layer().with_target(false))
    .try_init()
    .map_err(|e| Error::config(format!("logger already installed: {}", e)))
}
