//! REST control surface for the policy application layer.
//!
//! JSON endpoints forwarding to the controller:
//! - `POST /v1/rules`: install monitoring flows for policy rules
//! - `POST /v1/subscribers/default_drop`: per-subscriber default-drop flows
//! - `POST /v1/subscribers/delete`: remove every flow of a subscriber
//! - `GET /v1/policy_usage`: last aggregated usage table
//! - `POST /v1/stats`: on-demand counters filtered by cookie

use crate::collaborators::PrefixResolver;
use crate::controller::ControllerHandle;
use crate::error::{EnforcementStatsError, Result};
use crate::flows::{FlowInstaller, RuleFlowRequest};
use crate::mappers::PrefixMapper;
use crate::types::{PolicyRule, UsageRecordTable};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// JSON response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiErrorResponse>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ApiErrorResponse) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiErrorResponse {
    /// HTTP status code
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// A rule version to meter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedRule {
    pub rule: PolicyRule,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateRulesRequest {
    pub sid: String,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub teid: u32,
    #[serde(default)]
    pub shard_id: u64,
    pub rules: Vec<VersionedRule>,
}

/// Install outcome of one rule; there is no partial success per rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule_id: String,
    pub version: u64,
    pub installed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberRequest {
    pub sid: String,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub teid: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub cookie: u64,
    #[serde(default)]
    pub cookie_mask: u64,
}

#[derive(Clone)]
pub struct ApiState {
    handle: ControllerHandle,
    prefixes: Arc<PrefixMapper>,
}

impl ApiState {
    pub fn new(handle: ControllerHandle, prefixes: Arc<PrefixMapper>) -> Self {
        Self { handle, prefixes }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/rules", post(activate_rules))
        .route("/v1/subscribers/default_drop", post(install_default_drop))
        .route("/v1/subscribers/delete", post(delete_subscriber))
        .route("/v1/policy_usage", get(policy_usage))
        .route("/v1/stats", post(get_stats))
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: ApiState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Control API listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn status_for(error: &EnforcementStatsError) -> StatusCode {
    match error {
        EnforcementStatsError::ResolutionFailure { .. }
        | EnforcementStatsError::Codec { .. }
        | EnforcementStatsError::Config { .. } => StatusCode::BAD_REQUEST,
        EnforcementStatsError::ProtocolTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        e if e.is_datapath_failure() || e.is_storage_unavailable() => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(operation: &str, result: Result<T>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))).into_response(),
        Err(e) => {
            warn!(operation, error = %e, "Control API request failed");
            let status = status_for(&e);
            let body = ApiResponse::<T>::error(ApiErrorResponse {
                code: status.as_u16(),
                message: format!("{} failed", operation),
                details: Some(e.to_string()),
            });
            (status, Json(body)).into_response()
        }
    }
}

async fn activate_rules(
    State(state): State<ApiState>,
    Json(req): Json<ActivateRulesRequest>,
) -> Response {
    let mut results = Vec::with_capacity(req.rules.len());
    for versioned in &req.rules {
        let installed = state
            .handle
            .flows()
            .install_rule_flows(&RuleFlowRequest {
                sid: &req.sid,
                ip: req.ip,
                rule: &versioned.rule,
                version: versioned.version,
                shard_id: req.shard_id,
                teid: req.teid,
            })
            .await
            .is_success();
        results.push(RuleResult {
            rule_id: versioned.rule.id.clone(),
            version: versioned.version,
            installed,
        });
    }
    respond("activate rules", Ok(results))
}

async fn install_default_drop(
    State(state): State<ApiState>,
    Json(req): Json<SubscriberRequest>,
) -> Response {
    let result = async {
        if let Some(IpAddr::V6(ue_ip)) = req.ip {
            state.prefixes.register_ue(ue_ip).await?;
        }
        let installed = state
            .handle
            .flows()
            .install_default_drop(&req.sid, req.ip, req.teid)
            .await
            .is_success();
        Ok::<_, EnforcementStatsError>(installed)
    }
    .await;
    respond("install default drop", result)
}

async fn delete_subscriber(
    State(state): State<ApiState>,
    Json(req): Json<SubscriberRequest>,
) -> Response {
    let result = async {
        state
            .handle
            .flows()
            .delete_subscriber_flows(&req.sid, req.ip, req.teid)
            .await?;
        if let Some(IpAddr::V6(ue_ip)) = req.ip {
            state.prefixes.remove(state.prefixes.prefix_for(ue_ip)).await?;
        }
        Ok::<_, EnforcementStatsError>(req.sid.clone())
    }
    .await;
    respond("delete subscriber flows", result)
}

async fn policy_usage(State(state): State<ApiState>) -> Response {
    respond::<UsageRecordTable>("get policy usage", state.handle.policy_usage().await)
}

async fn get_stats(State(state): State<ApiState>, Json(query): Json<StatsQuery>) -> Response {
    respond(
        "get stats",
        state.handle.get_stats(query.cookie, query.cookie_mask).await,
    )
}
