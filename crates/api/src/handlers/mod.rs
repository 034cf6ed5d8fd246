pub mod devices;
pub mod metrics;
