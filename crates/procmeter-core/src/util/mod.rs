//! Utility functions.

mod filename;

pub use filename::{DEFAULT_TEMPLATE, TIMESTAMP_FORMAT, expand_template};
