pub mod commands;
pub mod manifests;
pub mod owner;
pub mod telemetry;
