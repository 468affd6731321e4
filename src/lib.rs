//! Mender - self-healing CI workflow engine.
//!
//! Drives failing CI runs through diagnose → patch → test → prove → merge.
//! The durable journal is the source of truth; in-memory cases are
//! projections. External analyzers, the dedup index, and the event sink
//! live behind ports.

pub mod adapters;
pub mod domain;
pub mod services;

pub use domain::{EngineError, EngineResult};
pub use services::{ConfigError, EngineConfig};
