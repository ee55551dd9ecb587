pub mod constants;
pub mod node;
pub mod policy;
pub mod telemetry;
