pub mod adapters;
pub mod app;
pub mod capability;
pub mod config;
pub mod error;
pub mod machine;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;
pub mod workflow;
