pub mod format;
pub mod http;
pub mod monitor;
pub mod overage;
pub mod reset;
pub mod settings;
pub mod tiers;
