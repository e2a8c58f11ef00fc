use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

/// Installs the global `tracing` subscriber: compact `fmt` output filtered
/// by `RUST_LOG`, or by `info` (`debug` when `verbose`) when it is unset.
pub fn init_logger(verbose: bool) -> Result<(), TryInitError> {
  let default = if verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(default));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer()
          .with_target(false)
          .with_thread_ids(false)
          .compact())
    .try_init()
}
