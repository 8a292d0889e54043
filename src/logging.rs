//! Tracing setup.
//!
//! Decoders emit `debug!`/`trace!` events for skipped blobs, unresolved
//! pointers and load-command inconsistencies. Nothing is printed unless a
//! subscriber is installed, either by the embedding program or by one of the
//! helpers below.

use std::sync::Once;
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

static INIT: Once = Once::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a human-readable subscriber filtered by `RUST_LOG` (default `info`).
///
/// Only the first call has an effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_line_number(true);

        // A subscriber installed by the host program wins.
        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer)
            .try_init();

        info!("machscope tracing initialized");
    });
}

/// Install a JSON subscriber for structured log collection.
pub fn init_tracing_json() {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_current_span(true);

        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer)
            .try_init();

        info!("machscope tracing initialized (JSON mode)");
    });
}
