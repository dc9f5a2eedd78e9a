pub mod audit;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod lock;
pub mod monitor;
pub mod orchestrator;
pub mod paths;
pub mod power;
pub mod resilience;
pub mod runtime;

pub use error::{Result, TandemError};
