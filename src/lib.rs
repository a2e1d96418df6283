pub mod admission;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod options;
pub mod payouts;
pub mod selection;
pub mod settlement;
pub mod state;
pub mod store;
pub mod tasks;

pub use crate::config::{load_config, AppConfig};
pub use crate::error::EngineError;
pub use crate::state::{build_state, AppState};

/// Commission rates are expressed in parts-per-million of the sale amount.
pub const PPM_DENOMINATOR: i64 = 1_000_000;

pub(crate) const SWEEP_SLOW_WARN_MS: u128 = 250;
