//! Logging setup
//!
//! The library only emits `tracing` events. Binaries and tests that want to
//! see them install a subscriber here; `RUST_LOG` overrides the default
//! filter.

use crate::error::TlsError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install a global formatting subscriber.
///
/// `default_filter` applies when `RUST_LOG` is unset or invalid, e.g.
/// `"sslclient=debug"`. Fails if a global subscriber is already installed.
pub fn init_logging(default_filter: &str) -> Result<(), TlsError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| TlsError::Logging(e.to_string()))
}

