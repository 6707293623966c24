//! REST route layer.
//!
//! Handlers authenticate from the `Authorization: Bearer` header, run policy
//! checks (ownership, access level, state), and delegate to the db handle,
//! the lifecycle manager, and the feedback pipeline. Every failure path maps
//! through [`MarketError`] to a status code and `{"error": "..."}` body.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;

use crate::db::DbHandle;
use crate::errors::MarketError;
use crate::feedback::{self, TrendGrouping};
use crate::lifecycle::{DeploymentAction, LifecycleManager};
use crate::models::{
    AccessLevel, Deployment, DeploymentWithMetrics, ExecutionStatus, SubscriptionTier, User,
};
use crate::relay::{RelayMessage, StatusRelay};

pub struct AppState {
    pub db: DbHandle,
    pub relay: Arc<StatusRelay>,
    pub lifecycle: LifecycleManager,
}

pub type SharedState = Arc<AppState>;

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/users", post(create_user))
        .route("/api/users/me/notifications", get(list_notifications))
        .route("/api/deployments", post(create_deployment).get(list_deployments))
        .route("/api/deployments/{id}", get(get_deployment).delete(delete_deployment))
        .route("/api/deployments/{id}/start", post(start_deployment))
        .route("/api/deployments/{id}/stop", post(stop_deployment))
        .route("/api/deployments/{id}/restart", post(restart_deployment))
        .route("/api/deployments/{id}/metrics", get(get_metrics))
        .route("/api/deployments/{id}/executions", post(record_execution))
        .route("/api/executions/{id}/resolve", post(resolve_execution))
        .route("/api/agents/{id}/feedback", post(submit_feedback))
        .route("/api/feedback/{id}/response", post(respond_to_feedback))
        .route("/api/feedback/{id}/summary", get(feedback_summary))
        .route("/api/feedback/{id}/analytics", get(feedback_analytics))
}

// ── Authentication ───────────────────────────────────────────────────

/// Resolve the bearer token to a user. Absent header means anonymous;
/// a present but unknown or malformed token is rejected.
async fn authenticate_optional(
    state: &SharedState,
    headers: &HeaderMap,
) -> Result<Option<User>, MarketError> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let token = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(MarketError::Unauthenticated)?
        .to_string();
    let user = state
        .db
        .call(move |db| Ok(db.get_user_by_token(&token)?))
        .await?;
    user.map(Some).ok_or(MarketError::Unauthenticated)
}

async fn authenticate(state: &SharedState, headers: &HeaderMap) -> Result<User, MarketError> {
    authenticate_optional(state, headers)
        .await?
        .ok_or(MarketError::Unauthenticated)
}

async fn load_deployment(state: &SharedState, id: i64) -> Result<Deployment, MarketError> {
    state
        .db
        .call(move |db| {
            db.get_deployment(id)?.ok_or(MarketError::NotFound {
                entity: "Deployment",
                id,
            })
        })
        .await
}

/// Anonymous viewers hitting a gated deployment get 401 (a token might
/// grant access); authenticated viewers below the tier get 403.
fn ensure_viewable(deployment: &Deployment, viewer: Option<&User>) -> Result<(), MarketError> {
    if deployment.viewable_by(viewer) {
        return Ok(());
    }
    match viewer {
        Some(_) => Err(MarketError::Forbidden(format!(
            "deployment {} requires a higher subscription tier",
            deployment.id
        ))),
        None => Err(MarketError::Unauthenticated),
    }
}

fn validate_date(field: &'static str, value: Option<&str>) -> Result<(), MarketError> {
    if let Some(v) = value {
        chrono::NaiveDate::parse_from_str(v, "%Y-%m-%d").map_err(|_| {
            MarketError::validation(field, format!("expected YYYY-MM-DD, got '{}'", v))
        })?;
    }
    Ok(())
}

// ── Request payloads ─────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserRequest {
    name: String,
    subscription_tier: Option<SubscriptionTier>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDeploymentRequest {
    name: String,
    description: Option<String>,
    access_level: Option<AccessLevel>,
    framework: Option<String>,
    version: Option<String>,
    webhook_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordExecutionRequest {
    status: Option<ExecutionStatus>,
    response_time_ms: Option<f64>,
    tokens_used: Option<i64>,
    cost: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveExecutionRequest {
    success: bool,
    response_time_ms: Option<f64>,
    tokens_used: Option<i64>,
    cost: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackRequest {
    rating: i64,
    comment: Option<String>,
    categories: Option<BTreeMap<String, f64>>,
}

#[derive(Deserialize)]
struct RespondRequest {
    response: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyticsQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    group_by: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn create_user(
    State(state): State<SharedState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, MarketError> {
    if req.name.trim().is_empty() {
        return Err(MarketError::validation("name", "must not be empty"));
    }
    let tier = req.subscription_tier.unwrap_or(SubscriptionTier::Free);
    let name = req.name;
    let user = state
        .db
        .call(move |db| Ok(db.create_user(&name, &tier)?))
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn list_notifications(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, MarketError> {
    let actor = authenticate(&state, &headers).await?;
    let user_id = actor.id;
    let notifications = state
        .db
        .call(move |db| Ok(db.list_notifications(user_id)?))
        .await?;
    Ok(Json(notifications))
}

async fn create_deployment(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateDeploymentRequest>,
) -> Result<impl IntoResponse, MarketError> {
    let owner = authenticate(&state, &headers).await?;
    if req.name.trim().is_empty() {
        return Err(MarketError::validation("name", "must not be empty"));
    }
    let owner_id = owner.id;
    let created = state
        .db
        .call(move |db| {
            Ok(db.create_deployment(
                owner_id,
                &req.name,
                req.description.as_deref().unwrap_or(""),
                &req.access_level.unwrap_or(AccessLevel::Public),
                req.framework.as_deref().unwrap_or("webhook"),
                req.version.as_deref().unwrap_or("0.1.0"),
                req.webhook_url.as_deref(),
            )?)
        })
        .await?;
    tracing::info!(deployment_id = created.deployment.id, owner_id, "deployment created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_deployments(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, MarketError> {
    let viewer = authenticate_optional(&state, &headers).await?;
    let deployments = state.db.call(|db| Ok(db.list_deployments()?)).await?;
    let visible: Vec<Deployment> = deployments
        .into_iter()
        .filter(|d| d.viewable_by(viewer.as_ref()))
        .collect();
    Ok(Json(visible))
}

async fn get_deployment(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<DeploymentWithMetrics>, MarketError> {
    let viewer = authenticate_optional(&state, &headers).await?;
    let deployment = load_deployment(&state, id).await?;
    ensure_viewable(&deployment, viewer.as_ref())?;
    let view = state
        .db
        .call(move |db| {
            db.get_deployment_with_metrics(id)?
                .ok_or(MarketError::NotFound {
                    entity: "Deployment",
                    id,
                })
        })
        .await?;
    Ok(Json(view))
}

async fn delete_deployment(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, MarketError> {
    let actor = authenticate(&state, &headers).await?;
    let deployment = load_deployment(&state, id).await?;
    if deployment.owner_id != actor.id {
        return Err(MarketError::Forbidden(format!(
            "only the owner may delete deployment {}",
            id
        )));
    }
    state
        .db
        .call(move |db| Ok(db.delete_deployment(id)?))
        .await?;
    tracing::info!(deployment_id = id, "deployment deleted");
    Ok(Json(json!({"message": "Deployment deleted"})))
}

async fn start_deployment(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<DeploymentWithMetrics>, MarketError> {
    apply_action(&state, &headers, id, DeploymentAction::Start).await
}

async fn stop_deployment(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<DeploymentWithMetrics>, MarketError> {
    apply_action(&state, &headers, id, DeploymentAction::Stop).await
}

async fn restart_deployment(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<DeploymentWithMetrics>, MarketError> {
    apply_action(&state, &headers, id, DeploymentAction::Restart).await
}

async fn apply_action(
    state: &SharedState,
    headers: &HeaderMap,
    id: i64,
    action: DeploymentAction,
) -> Result<Json<DeploymentWithMetrics>, MarketError> {
    let actor = authenticate(state, headers).await?;
    let view = state
        .lifecycle
        .apply(&state.db, &state.relay, &actor, id, action)
        .await?;
    Ok(Json(view))
}

async fn get_metrics(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, MarketError> {
    let viewer = authenticate_optional(&state, &headers).await?;
    let deployment = load_deployment(&state, id).await?;
    ensure_viewable(&deployment, viewer.as_ref())?;
    let metrics = state
        .db
        .call(move |db| {
            db.get_metrics(id)?.ok_or(MarketError::NotFound {
                entity: "Deployment",
                id,
            })
        })
        .await?;
    Ok(Json(metrics))
}

async fn record_execution(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<RecordExecutionRequest>,
) -> Result<impl IntoResponse, MarketError> {
    let viewer = authenticate_optional(&state, &headers).await?;
    let deployment = load_deployment(&state, id).await?;
    ensure_viewable(&deployment, viewer.as_ref())?;

    let status = req.status.unwrap_or(ExecutionStatus::Pending);
    let user_id = viewer.map(|u| u.id);
    let (execution, metrics) = state
        .db
        .call(move |db| {
            let execution = db.record_execution(
                id,
                user_id,
                &status,
                req.response_time_ms,
                req.tokens_used,
                req.cost,
            )?;
            let metrics = db.get_metrics(id)?;
            Ok((execution, metrics))
        })
        .await?;

    if execution.status.is_resolved() {
        if let Some(metrics) = metrics {
            state.relay.publish(&RelayMessage::MetricsUpdated {
                deployment_id: id,
                metrics,
            });
        }
    }
    Ok((StatusCode::CREATED, Json(execution)))
}

async fn resolve_execution(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<ResolveExecutionRequest>,
) -> Result<impl IntoResponse, MarketError> {
    let actor = authenticate(&state, &headers).await?;
    let execution = state
        .db
        .call(move |db| {
            db.get_execution(id)?.ok_or(MarketError::NotFound {
                entity: "Execution",
                id,
            })
        })
        .await?;
    let deployment = load_deployment(&state, execution.deployment_id).await?;
    if deployment.owner_id != actor.id {
        return Err(MarketError::Forbidden(
            "only the deployment owner may resolve executions".to_string(),
        ));
    }
    if execution.status.is_resolved() {
        return Err(MarketError::validation(
            "execution",
            format!("execution {} is already resolved", id),
        ));
    }

    let deployment_id = deployment.id;
    let (resolved, metrics) = state
        .db
        .call(move |db| {
            let resolved = db.resolve_execution(
                id,
                req.success,
                req.response_time_ms,
                req.tokens_used,
                req.cost,
            )?;
            let metrics = db.get_metrics(deployment_id)?;
            Ok((resolved, metrics))
        })
        .await?;
    if let Some(metrics) = metrics {
        state.relay.publish(&RelayMessage::MetricsUpdated {
            deployment_id,
            metrics,
        });
    }
    Ok(Json(resolved))
}

async fn submit_feedback(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<FeedbackRequest>,
) -> Result<impl IntoResponse, MarketError> {
    let reviewer = authenticate(&state, &headers).await?;
    let deployment = load_deployment(&state, id).await?;
    ensure_viewable(&deployment, Some(&reviewer))?;
    feedback::ingest(
        &state.db,
        &deployment,
        &reviewer,
        req.rating,
        req.comment,
        req.categories.unwrap_or_default(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(json!({"message": "Feedback submitted"}))))
}

async fn respond_to_feedback(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<RespondRequest>,
) -> Result<impl IntoResponse, MarketError> {
    let actor = authenticate(&state, &headers).await?;
    if req.response.trim().is_empty() {
        return Err(MarketError::validation("response", "must not be empty"));
    }
    let feedback = state
        .db
        .call(move |db| {
            db.get_feedback(id)?.ok_or(MarketError::NotFound {
                entity: "Feedback",
                id,
            })
        })
        .await?;
    let deployment = load_deployment(&state, feedback.deployment_id).await?;
    if deployment.owner_id != actor.id {
        return Err(MarketError::Forbidden(
            "only the deployment owner may respond to feedback".to_string(),
        ));
    }

    let reviewer_id = feedback.user_id;
    let deployment_name = deployment.name.clone();
    let updated = state
        .db
        .call(move |db| {
            let updated = db.set_feedback_response(id, &req.response)?;
            db.create_notification(
                reviewer_id,
                "response",
                &format!("The creator of {} replied to your review", deployment_name),
            )?;
            Ok(updated)
        })
        .await?;
    Ok(Json(updated))
}

async fn feedback_summary(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(q): Query<SummaryQuery>,
) -> Result<impl IntoResponse, MarketError> {
    let viewer = authenticate_optional(&state, &headers).await?;
    let deployment = load_deployment(&state, id).await?;
    ensure_viewable(&deployment, viewer.as_ref())?;
    validate_date("startDate", q.start_date.as_deref())?;
    validate_date("endDate", q.end_date.as_deref())?;
    let limit = q.limit.unwrap_or(10).min(100);

    let rows = state
        .db
        .call(move |db| Ok(db.list_feedback(id, q.start_date.as_deref(), q.end_date.as_deref())?))
        .await?;
    Ok(Json(feedback::summarize(&rows, limit)))
}

async fn feedback_analytics(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(q): Query<AnalyticsQuery>,
) -> Result<impl IntoResponse, MarketError> {
    let viewer = authenticate_optional(&state, &headers).await?;
    let deployment = load_deployment(&state, id).await?;
    ensure_viewable(&deployment, viewer.as_ref())?;
    validate_date("startDate", q.start_date.as_deref())?;
    validate_date("endDate", q.end_date.as_deref())?;
    let grouping = q
        .group_by
        .as_deref()
        .map(str::parse::<TrendGrouping>)
        .transpose()
        .map_err(|e| MarketError::validation("groupBy", e))?
        .unwrap_or(TrendGrouping::Day);

    let rows = state
        .db
        .call(move |db| Ok(db.list_feedback(id, q.start_date.as_deref(), q.end_date.as_deref())?))
        .await?;
    Ok(Json(feedback::analyze(&rows, grouping)))
}
