#![forbid(unsafe_code)]

//! Core of the Trail offline-first workout tracker.
//!
//! This crate provides:
//! - Domain types (sessions, sensor points, heart-rate samples, sync operations)
//! - A durable, crash-surviving collection store
//! - Position sampling with distance, pace and auto-pause
//! - Heart-rate capture from a paired device or a simulation
//! - A FIFO-per-entity sync queue with retry and backoff
//! - The session controller tying them together

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod store;
pub mod geo;
pub mod location;
pub mod sampler;
pub mod heart_rate;
pub mod remote;
pub mod sync_queue;
pub mod session;
pub mod export;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use store::Store;
pub use sampler::{PositionSampler, SamplerStats};
pub use heart_rate::HeartRateSensor;
pub use remote::{LedgerEndpoint, OfflineEndpoint, RemoteEndpoint};
pub use sync_queue::{DrainReport, RetryPolicy, SyncQueue};
pub use session::{PumpReport, SessionController, SessionSensors};
