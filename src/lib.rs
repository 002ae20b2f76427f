pub mod audit;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod scheduler;
pub mod sweep;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{Engine, EngineError};
pub use scheduler::{DeliveryError, Notifier};
