use anyhow::Context;
use std::path::PathBuf;

use crate::monitor::DEFAULT_TRAFFIC_LIMIT_TB;

/// Service configuration, read once at startup from the environment (a .env
/// file is honored via dotenv). The orchestration core itself takes no
/// env/file dependency; everything here belongs to the outer service.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_token: String,
    pub bind_addr: String,
    pub traffic_limit_tb: u64,
    pub monitor_interval_secs: u64,
    pub overage_file: PathBuf,
    pub alert_state_file: PathBuf,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_token = std::env::var("HETZNER_API_TOKEN")
            .context("HETZNER_API_TOKEN must be set")?
            .trim()
            .to_string();
        if api_token.is_empty() {
            anyhow::bail!("HETZNER_API_TOKEN must not be empty");
        }

        let traffic_limit_tb: u64 = parse_env("TRAFFIC_LIMIT_TB", DEFAULT_TRAFFIC_LIMIT_TB)?;
        // A zero limit would make every usage percentage infinite and page on
        // every server, so it is a configuration error.
        if traffic_limit_tb == 0 {
            anyhow::bail!("TRAFFIC_LIMIT_TB must be greater than zero");
        }

        Ok(Self {
            api_token,
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            traffic_limit_tb,
            monitor_interval_secs: parse_env("MONITOR_INTERVAL_SECS", 86_400)?,
            overage_file: env_or("OVERAGE_HISTORY_FILE", "overage_history.json").into(),
            alert_state_file: env_or("ALERT_STATE_FILE", "server_alert_state.json").into(),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The only test in the binary touching these variables, so no
    // cross-test interference despite the process-global environment.
    #[test]
    fn zero_traffic_limit_is_rejected() {
        std::env::set_var("HETZNER_API_TOKEN", "test-token");
        std::env::set_var("TRAFFIC_LIMIT_TB", "0");

        let err = Settings::from_env().unwrap_err();
        assert!(err.to_string().contains("TRAFFIC_LIMIT_TB"));

        std::env::remove_var("TRAFFIC_LIMIT_TB");
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.traffic_limit_tb, DEFAULT_TRAFFIC_LIMIT_TB);
        std::env::remove_var("HETZNER_API_TOKEN");
    }
}
