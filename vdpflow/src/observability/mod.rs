//! Observability utilities.

mod spans;
mod subscriber;

pub use spans::{SpanAttributes, SpanTimer};
pub use subscriber::{init_tracing, init_tracing_with_filter, LogFormat, DEFAULT_FILTER};
