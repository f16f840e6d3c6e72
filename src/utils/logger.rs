use crate::utils::log_ring::{LogRing, LogRingLayer};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes the global tracing subscriber for logging.
///
/// This function configures a tracing subscriber with:
/// - An environment filter that attempts to read the log level from the environment.
///   If that fails, it defaults to `"info"`.
/// - A formatting layer that prints log messages in a human-readable format.
/// - A [`LogRingLayer`] that keeps the most recent lines in `ring` for the
///   diagnostics endpoint and forwards errors to the external sink, if any.
///
/// Once initialized, all log messages (using the `tracing` crate) will be emitted according to this configuration.
///
pub fn init(ring: Arc<LogRing>) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(LogRingLayer::new(ring))
        .init();
}
