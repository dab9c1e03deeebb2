//! Logging initialization.
//!
//! Structured logs via `tracing-subscriber`, filterable with `RUST_LOG`.
//! The teacher's OTLP exporter stack is not carried here: see DESIGN.md for
//! why a single-process batch pipeline has no use for distributed tracing.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
