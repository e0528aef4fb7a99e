use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyOverage {
    pub overage_cost: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Flat-file history of monthly overage cost, keyed by "YYYY-MM". Lives
/// outside the orchestration core; load failures degrade to an empty history
/// so a corrupt file can never block a reset run.
pub struct OverageTracker {
    path: PathBuf,
}

impl OverageTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> BTreeMap<String, MonthlyOverage> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(data) => data,
                Err(e) => {
                    tracing::error!("failed to parse overage data {:?}: {}", self.path, e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::error!("failed to load overage data {:?}: {}", self.path, e);
                BTreeMap::new()
            }
        }
    }

    fn save(&self, data: &BTreeMap<String, MonthlyOverage>) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(data)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }

    pub fn record_monthly_overage(&self, overage_cost: f64) -> anyhow::Result<()> {
        let current_month = Utc::now().format("%Y-%m").to_string();
        let mut data = self.load();
        data.insert(
            current_month.clone(),
            MonthlyOverage {
                overage_cost: round_cents(overage_cost),
                recorded_at: Utc::now(),
            },
        );
        self.save(&data)?;
        tracing::info!(
            "Recorded overage for {}: €{:.2}",
            current_month,
            overage_cost
        );
        Ok(())
    }

    pub fn total_overage(&self) -> f64 {
        round_cents(self.load().values().map(|m| m.overage_cost).sum())
    }

    /// Per-month costs, newest first.
    pub fn monthly_breakdown(&self) -> Vec<(String, f64)> {
        self.load()
            .into_iter()
            .rev()
            .map(|(month, data)| (month, data.overage_cost))
            .collect()
    }

    pub fn current_month_overage(&self) -> f64 {
        let current_month = Utc::now().format("%Y-%m").to_string();
        self.load()
            .get(&current_month)
            .map(|m| m.overage_cost)
            .unwrap_or(0.0)
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
