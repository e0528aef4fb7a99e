use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::overage::OverageTracker;
use crate::reset::TrafficResetOrchestrator;
use trafficguard_common::ResetOutcome;

pub struct AppState {
    pub orchestrator: TrafficResetOrchestrator,
    pub overage: OverageTracker,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/servers/:id/actions/reset_traffic", post(reset_traffic))
        .route("/overage", get(overage))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Runs the full reset workflow synchronously and returns the verdict plus
/// the ordered log, so the caller can render the complete causal record.
async fn reset_traffic(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<u64>,
) -> impl IntoResponse {
    let run = state.orchestrator.reset_server_traffic(server_id, None).await;
    let status = match run.outcome {
        ResetOutcome::Succeeded => StatusCode::OK,
        ResetOutcome::AlreadyInProgress => StatusCode::CONFLICT,
        ResetOutcome::Failed => StatusCode::BAD_GATEWAY,
    };
    (status, Json(run))
}

async fn overage(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "total": state.overage.total_overage(),
        "current_month": state.overage.current_month_overage(),
        "months": state
            .overage
            .monthly_breakdown()
            .into_iter()
            .map(|(month, cost)| json!({ "month": month, "overage_cost": cost }))
            .collect::<Vec<_>>(),
    }))
}
