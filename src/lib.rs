pub mod config;
pub mod errors;
pub mod fleet;
pub mod telemetry;

pub use config::FleetConfig;
pub use errors::{FleetError, FleetResult};
