//! Single place to pull in the `tracing` ecosystem.
//!
//! Crates of this workspace use `observability_deps::tracing::*` instead of depending on
//! `tracing` directly, so that the version and the enabled level features stay in sync.
#![warn(missing_docs)]

pub use tracing;
