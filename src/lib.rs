//! Runtime-reconfigurable fan-out of `tracing` events to syslog and HTTP
//! log targets.
//!
//! A [`Manager`](manager::Manager) keeps one live output per enabled
//! target and republishes a dispatch snapshot after every change. The
//! [`DispatchLayer`](layer::DispatchLayer) reads that snapshot lock-free
//! on every event.

pub mod error;
pub mod record;
pub mod target;
pub mod output;
pub mod syslog;
#[cfg(feature = "http")]
pub mod http;
pub mod backend;
pub mod settings;
pub mod store;
pub mod dispatch;
pub mod layer;
pub mod manager;
pub mod init;

/// Tracing target for diagnostics about delivery itself. The dispatch
/// layer ignores events on this target.
pub const INTERNAL_TARGET: &str = "tracing_log_targets::internal";

pub use error::{ManagerError, OutputError, StoreError, ValidationError};
pub use manager::{Manager, ReconcileReport};
pub use record::{Level, LogRecord};
pub use target::{FilterLevel, TargetConfig};
