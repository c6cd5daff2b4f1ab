//! Tracing initialization for the Branchloom engine.
//!
//! The engine itself only emits `tracing` events and spans; wiring a
//! subscriber is the host application's choice. [`init`] installs a
//! reasonable default: env-filtered fmt output plus an error layer so
//! span traces attach to diagnostics.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the default subscriber (fmt + `RUST_LOG` filtering + error layer).
///
/// Idempotent in practice: a second call fails to set the global default and
/// is ignored. Intended for binaries and integration tests; library users
/// embedding the engine should install their own subscriber instead.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(ErrorLayer::default())
        .try_init();
}
