//! Human-readable rendering of pipelines and their cached outputs.
pub mod trace;

pub use trace::format_trace;
