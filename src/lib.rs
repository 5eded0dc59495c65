pub mod types;
pub mod prng;
pub mod identity;
pub mod transport;
pub mod error_handling;
pub mod session;
pub mod orchestrator;
pub mod metrics;
pub mod prometheus_metrics;
pub mod report;
pub mod config;
