use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::format::{format_traffic, traffic_emoji, TB};
use trafficguard_providers::ServerProvider;

pub const DEFAULT_TRAFFIC_LIMIT_TB: u64 = 20;
pub const WARNING_THRESHOLD: f64 = 0.75;
pub const CRITICAL_THRESHOLD: f64 = 0.98;

/// Where threshold alerts go. Delivery is best-effort: a failed send is
/// logged and retried on the next monitor pass, never escalated.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, message: &str) -> anyhow::Result<()>;
}

/// Fallback sink that only writes to the service log. The chat front-end
/// plugs in its own sink.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send_alert(&self, message: &str) -> anyhow::Result<()> {
        tracing::warn!("{message}");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ServerAlertState {
    last_warning: String,
    last_critical: String,
}

/// Flat-file once-per-day dedupe for alerts, keyed by server id.
pub struct AlertStateStore {
    path: PathBuf,
}

impl AlertStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> HashMap<u64, ServerAlertState> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                tracing::error!("failed to parse alert state {:?}: {}", self.path, e);
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::error!("failed to load alert state {:?}: {}", self.path, e);
                HashMap::new()
            }
        }
    }

    fn save(&self, state: &HashMap<u64, ServerAlertState>) -> anyhow::Result<()> {
        std::fs::write(&self.path, serde_json::to_string_pretty(state)?)?;
        Ok(())
    }

    fn get(&self, server_id: u64) -> ServerAlertState {
        self.load().get(&server_id).cloned().unwrap_or_default()
    }

    fn mark_warning(&self, server_id: u64, date: &str) -> anyhow::Result<()> {
        let mut state = self.load();
        state.entry(server_id).or_default().last_warning = date.to_string();
        self.save(&state)
    }

    fn mark_critical(&self, server_id: u64, date: &str) -> anyhow::Result<()> {
        let mut state = self.load();
        state.entry(server_id).or_default().last_critical = date.to_string();
        self.save(&state)
    }
}

/// Periodic pass over all servers that raises warning/critical alerts when
/// outbound traffic crosses the configured share of the monthly allowance.
pub struct TrafficMonitor {
    provider: Arc<dyn ServerProvider>,
    sink: Arc<dyn AlertSink>,
    store: AlertStateStore,
    limit_tb: u64,
}

impl TrafficMonitor {
    pub fn new(
        provider: Arc<dyn ServerProvider>,
        sink: Arc<dyn AlertSink>,
        store: AlertStateStore,
        limit_tb: u64,
    ) -> Self {
        Self {
            provider,
            sink,
            store,
            limit_tb,
        }
    }

    pub async fn run_once(&self) -> anyhow::Result<()> {
        tracing::info!("🔍 Running traffic monitor check...");
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let limit_bytes = self.limit_tb.saturating_mul(TB);

        let servers = self.provider.list_servers().await?;
        if servers.is_empty() {
            tracing::warn!("No servers found during monitor check");
            return Ok(());
        }

        for server in servers {
            let usage_pct = server.outgoing_traffic as f64 / limit_bytes as f64 * 100.0;
            let traffic_tb = server.outgoing_traffic as f64 / TB as f64;
            let state = self.store.get(server.id);
            let emoji = traffic_emoji(traffic_tb, self.limit_tb);

            if usage_pct >= CRITICAL_THRESHOLD * 100.0 {
                if state.last_critical != today {
                    let message = format!(
                        "🚨 CRITICAL TRAFFIC ALERT\n\n\
                         Server: {}\n\
                         {} Traffic: {} ({:.1}%)\n\n\
                         ⚠️ Traffic limit almost exhausted!\n\
                         Consider resetting traffic to avoid overage charges.",
                        server.name,
                        emoji,
                        format_traffic(server.outgoing_traffic, self.limit_tb),
                        usage_pct
                    );
                    // Only advance the dedupe date on a delivered alert so a
                    // failed send is retried on the next pass.
                    match self.sink.send_alert(&message).await {
                        Ok(()) => {
                            self.store.mark_critical(server.id, &today)?;
                            tracing::info!("Critical alert sent for server {}", server.name);
                        }
                        Err(e) => {
                            tracing::error!("Failed to send critical alert: {e:#}");
                        }
                    }
                }
            } else if usage_pct >= WARNING_THRESHOLD * 100.0 && state.last_warning != today {
                let message = format!(
                    "⚠️ TRAFFIC WARNING\n\n\
                     Server: {}\n\
                     {} Traffic: {} ({:.1}%)\n\n\
                     Traffic usage has exceeded {:.0}% of the monthly limit.",
                    server.name,
                    emoji,
                    format_traffic(server.outgoing_traffic, self.limit_tb),
                    usage_pct,
                    WARNING_THRESHOLD * 100.0
                );
                match self.sink.send_alert(&message).await {
                    Ok(()) => {
                        self.store.mark_warning(server.id, &today)?;
                        tracing::info!("Warning alert sent for server {}", server.name);
                    }
                    Err(e) => {
                        tracing::error!("Failed to send warning alert: {e:#}");
                    }
                }
            }
        }

        tracing::info!("✅ Traffic monitor check completed");
        Ok(())
    }
}
