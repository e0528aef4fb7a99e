use anyhow::Context;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use trafficguard_orchestrator::http::{self, AppState};
use trafficguard_orchestrator::monitor::{AlertStateStore, LogAlertSink, TrafficMonitor};
use trafficguard_orchestrator::overage::OverageTracker;
use trafficguard_orchestrator::reset::TrafficResetOrchestrator;
use trafficguard_orchestrator::settings::Settings;
use trafficguard_providers::hetzner::{HetznerClient, HetznerConfig};
use trafficguard_providers::ServerProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let settings = Settings::from_env()?;

    let client = HetznerClient::new(HetznerConfig::new(settings.api_token.clone()))
        .context("failed to build Hetzner client")?;
    let provider: Arc<dyn ServerProvider> = Arc::new(client);

    let orchestrator = TrafficResetOrchestrator::new(provider.clone());
    let overage = OverageTracker::new(settings.overage_file.clone());

    // Background threshold monitor, one pass per interval (daily by default).
    {
        let monitor = TrafficMonitor::new(
            provider.clone(),
            Arc::new(LogAlertSink),
            AlertStateStore::new(settings.alert_state_file.clone()),
            settings.traffic_limit_tb,
        );
        let interval = Duration::from_secs(settings.monitor_interval_secs);
        tokio::spawn(async move {
            loop {
                if let Err(e) = monitor.run_once().await {
                    tracing::error!("traffic monitor pass failed: {e:#}");
                }
                sleep(interval).await;
            }
        });
    }

    let state = Arc::new(AppState {
        orchestrator,
        overage,
    });
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    tracing::info!("trafficguard orchestrator listening on {}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
