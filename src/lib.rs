pub mod aggregate;
pub mod analysis;
pub mod calculator;
pub mod capacity;
pub mod config;
pub mod error;
pub mod exposure;
pub mod hazard;
pub mod logging;
pub mod monitor;
pub mod partition;
pub mod rng;
pub mod scenario;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod types;
pub mod vulnerability;
