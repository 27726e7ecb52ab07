//! Layer-4 TCP redirector.
//!
//! Accepts connections on every port of a static port map, relays raw bytes to the mapped
//! backend, reports per-connection telemetry to a control plane in batches behind a circuit
//! breaker, and serves an authenticated local status API.

pub mod breaker;
pub mod config;
pub mod forward;
pub mod monitor;
pub mod router;
pub mod stats;
pub mod supervisor;
pub mod telemetry;

pub use config::{Cli, Config, ConfigError, load_config};
pub use supervisor::{Redirector, run};
