pub mod bus;
pub mod config;
pub mod cryostasis;
pub mod emotion;
pub mod error;
pub mod io;
pub mod memory;
pub mod monitor;
pub mod orchestrator;
pub mod runtime;
pub mod types;
