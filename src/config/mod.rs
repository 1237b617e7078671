//! Daemon configuration: YAML-backed, validated at load time.

mod loader;
mod types;

pub use types::{AuthSection, Config, LimitsSection, ServerSection, TelemetrySection};
