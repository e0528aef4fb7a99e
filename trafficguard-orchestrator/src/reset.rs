use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use uuid::Uuid;

use crate::tiers::TierResolver;
use trafficguard_common::{LogEntry, ResetOutcome, ResetRun, ServerStatus};
use trafficguard_providers::ServerProvider;

/// Invoked with the full ordered log after every append. Best-effort by
/// contract: a failing callback never aborts the run.
pub type ProgressCallback = Arc<dyn Fn(&[LogEntry]) -> anyhow::Result<()> + Send + Sync>;

/// Poll ceilings and settle delays of the reset workflow. The settle sleeps
/// respect the provider's eventual-consistency window between "action
/// accepted" and "state queryable as changed"; they are not retries.
#[derive(Debug, Clone)]
pub struct ResetPacing {
    pub poll_interval: Duration,
    /// Power-state convergence window: terminal when exhausted.
    pub power_wait_attempts: u32,
    /// Tier convergence window: a warning when exhausted, never terminal.
    pub tier_wait_attempts: u32,
    pub settle_short: Duration,
    pub settle_medium: Duration,
    pub settle_long: Duration,
}

impl Default for ResetPacing {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            power_wait_attempts: 40,
            tier_wait_attempts: 30,
            settle_short: Duration::from_secs(2),
            settle_medium: Duration::from_secs(3),
            settle_long: Duration::from_secs(5),
        }
    }
}

impl ResetPacing {
    /// Same attempt ceilings, near-zero delays. For tests.
    pub fn fast() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            settle_short: Duration::ZERO,
            settle_medium: Duration::ZERO,
            settle_long: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Step sequence terminated early; the failure is already in the log.
struct Aborted;

struct RunLog {
    entries: Vec<LogEntry>,
    progress: Option<ProgressCallback>,
}

impl RunLog {
    fn push(&mut self, icon: &str, message: impl Into<String>) {
        let entry = LogEntry::new(icon, message);
        tracing::info!("[reset] {entry}");
        self.entries.push(entry);
        if let Some(callback) = &self.progress {
            // Progress rendering is fire-and-forget; swallow its failures.
            if let Err(e) = callback(&self.entries) {
                tracing::debug!("progress callback failed: {e:#}");
            }
        }
    }
}

/// Drives the traffic counter reset for one server: power off, temporarily
/// upgrade the tier (the provider zeroes the counter on any tier change),
/// restore the original tier, power back on. Every step re-fetches provider
/// state and appends to the run log before progressing.
pub struct TrafficResetOrchestrator {
    provider: Arc<dyn ServerProvider>,
    tiers: TierResolver,
    pacing: ResetPacing,
    in_flight: Mutex<HashSet<u64>>,
}

struct InFlightGuard<'a> {
    registry: &'a Mutex<HashSet<u64>>,
    server_id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.registry.lock() {
            active.remove(&self.server_id);
        }
    }
}

impl TrafficResetOrchestrator {
    pub fn new(provider: Arc<dyn ServerProvider>) -> Self {
        Self {
            provider,
            tiers: TierResolver::new(),
            pacing: ResetPacing::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_tiers(mut self, tiers: TierResolver) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_pacing(mut self, pacing: ResetPacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Run the full reset workflow for one server. Never returns an error:
    /// every failure path ends up as a terminal log entry plus a `Failed`
    /// outcome, and the log is the complete causal record either way.
    pub async fn reset_server_traffic(
        &self,
        server_id: u64,
        progress: Option<ProgressCallback>,
    ) -> ResetRun {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut log = RunLog {
            entries: Vec::new(),
            progress,
        };

        // Interleaved power/tier actions on one machine are unsafe, so a
        // second request for a server with a run in flight is rejected
        // outright instead of queued.
        let _guard = {
            let mut active = match self.in_flight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !active.insert(server_id) {
                log.push(
                    "❌",
                    format!("A traffic reset is already in progress for server {server_id}"),
                );
                return ResetRun {
                    run_id,
                    server_id,
                    outcome: ResetOutcome::AlreadyInProgress,
                    log: log.entries,
                    started_at,
                    finished_at: Utc::now(),
                };
            }
            drop(active);
            InFlightGuard {
                registry: &self.in_flight,
                server_id,
            }
        };

        let outcome = match self.run_steps(server_id, &mut log).await {
            Ok(()) => ResetOutcome::Succeeded,
            Err(Aborted) => ResetOutcome::Failed,
        };

        ResetRun {
            run_id,
            server_id,
            outcome,
            log: log.entries,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_steps(&self, server_id: u64, log: &mut RunLog) -> Result<(), Aborted> {
        log.push("📥", "Fetching server information...");
        let server = match self.provider.get_server(server_id).await {
            Ok(server) => server,
            Err(e) => {
                log.push("❌", format!("Failed to fetch server information: {e}"));
                return Err(Aborted);
            }
        };
        // Baseline for the whole run. Later steps re-fetch and compare
        // against this, never against a live "current" value.
        let current_status = server.status.clone();
        let current_tier = server.server_type.clone();
        log.push("💾", format!("Current plan: {current_tier}"));

        let Some(upgrade_tier) = self.tiers.resolve_upgrade(&current_tier) else {
            log.push("❌", format!("No upgrade plan available for {current_tier}"));
            return Err(Aborted);
        };
        let upgrade_tier = upgrade_tier.to_string();
        log.push("🔼", format!("Upgrade plan selected: {upgrade_tier}"));

        // The provider refuses tier changes on a running machine; power state
        // must be confirmed off before touching the tier.
        if current_status.is_running() {
            log.push("🔴", "Shutting down server...");
            self.power_off_confirmed(server_id, log, "Server failed to shutdown")
                .await?;
            log.push("✅", "Server is now OFF");
            sleep(self.pacing.settle_short).await;
        }

        log.push("🔼", format!("Upgrading to {upgrade_tier}..."));
        if let Err(e) = self
            .provider
            .change_server_type(server_id, &upgrade_tier, false)
            .await
        {
            log.push("❌", format!("Upgrade request failed: {e}"));
            return Err(Aborted);
        }
        sleep(self.pacing.settle_long).await;

        log.push("⏳", "Waiting for upgrade to complete...");
        self.await_tier(
            server_id,
            &upgrade_tier,
            "Upgrade completed successfully",
            "Still upgrading",
            log,
        )
        .await;
        sleep(self.pacing.settle_medium).await;

        self.start(server_id, "Starting server...", log).await?;
        sleep(self.pacing.settle_long).await;

        // Downgrade half: restore the tier captured at FETCH. A terminal
        // failure from here on leaves the server on the upgraded tier; that
        // is surfaced through the log, not auto-remediated.
        log.push("🔽", format!("Downgrading back to {current_tier}..."));
        self.power_off_confirmed(server_id, log, "Failed to shutdown for downgrade")
            .await?;
        sleep(self.pacing.settle_short).await;

        if let Err(e) = self
            .provider
            .change_server_type(server_id, &current_tier, false)
            .await
        {
            log.push("❌", format!("Downgrade request failed: {e}"));
            return Err(Aborted);
        }
        sleep(self.pacing.settle_long).await;

        log.push("⏳", "Waiting for downgrade to complete...");
        self.await_tier(
            server_id,
            &current_tier,
            "Downgrade completed successfully",
            "Still downgrading",
            log,
        )
        .await;
        sleep(self.pacing.settle_medium).await;

        self.start(server_id, "Starting server with original plan...", log)
            .await?;

        log.push("🎉", "Traffic reset process completed!");
        Ok(())
    }

    /// Issue poweroff and block until the server is confirmed off. Both a
    /// rejected request and an exhausted convergence window are terminal.
    async fn power_off_confirmed(
        &self,
        server_id: u64,
        log: &mut RunLog,
        failure_message: &str,
    ) -> Result<(), Aborted> {
        if let Err(e) = self.provider.power_off(server_id).await {
            log.push("❌", format!("{failure_message}: {e}"));
            return Err(Aborted);
        }
        let converged = self
            .provider
            .wait_for_status(
                server_id,
                &ServerStatus::Off,
                self.pacing.power_wait_attempts,
                self.pacing.poll_interval,
            )
            .await;
        if !converged {
            log.push("❌", failure_message);
            return Err(Aborted);
        }
        Ok(())
    }

    /// Poll until the reported tier matches `target`. Exhausting the window
    /// is logged as a warning but never aborts: the tier change is eventually
    /// consistent and the following power-on is safe regardless.
    async fn await_tier(
        &self,
        server_id: u64,
        target: &str,
        done_message: &str,
        still_message: &str,
        log: &mut RunLog,
    ) {
        let attempts = self.pacing.tier_wait_attempts;
        let started = std::time::Instant::now();
        for i in 0..attempts {
            match self.provider.get_server(server_id).await {
                Ok(server) if server.server_type == target => {
                    log.push("✅", done_message);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("poll failed while awaiting tier change on {server_id}: {e}");
                }
            }
            sleep(self.pacing.poll_interval).await;
            if (i + 1) % 6 == 0 {
                let elapsed = started.elapsed().as_secs();
                log.push("⏳", format!("{still_message}... ({elapsed}s elapsed)"));
            }
        }
        log.push(
            "⚠️",
            format!("Tier change to {target} not confirmed in time, continuing"),
        );
    }

    /// Issue poweron and wait for running. A rejected request is terminal; a
    /// convergence timeout only warns, since the protected invariant is
    /// "never change tier while power state is unconfirmed off".
    async fn start(
        &self,
        server_id: u64,
        message: &str,
        log: &mut RunLog,
    ) -> Result<(), Aborted> {
        log.push("🟢", message);
        if let Err(e) = self.provider.power_on(server_id).await {
            log.push("❌", format!("Power on request failed: {e}"));
            return Err(Aborted);
        }
        let running = self
            .provider
            .wait_for_status(
                server_id,
                &ServerStatus::Running,
                self.pacing.power_wait_attempts,
                self.pacing.poll_interval,
            )
            .await;
        if running {
            log.push("✅", "Server is now RUNNING");
        } else {
            log.push("⚠️", "Server started but status check timed out");
        }
        Ok(())
    }
}
