//! HTTP surface the admin GUI uses to create/update/delete `FW_Profiles`.
//! `check_radius_with_keepalive` mirrors
//! `original_source/routers/routes_firewall.py`'s function of the same name:
//! up to 3 attempts, 500ms apart, with a best-effort keepalive between.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use slog::Logger;
use sqlx::PgPool;

use crate::error::AdminApiError;
use crate::reconciler::{self, Signal, SignalData};
use crate::state::{self, FwProfile, NewProfile};

impl IntoResponse for AdminApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminApiError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdminApiError::SessionNotFound => StatusCode::BAD_REQUEST,
            AdminApiError::ProfileNotFound(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

const KEEPALIVE_ATTEMPTS: u32 = 3;
const KEEPALIVE_SPACING: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct ApiState {
    pub pool: Arc<PgPool>,
    pub reconciler: reconciler::Handle,
    pub app_client: Client,
    /// `/keepalive` endpoint of the captive-portal/client app, not this process.
    pub app_keepalive_url: String,
    pub log: Logger,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/firewall_profiles", post(create_profile).get(list_profiles))
        .route(
            "/firewall_profiles/:id",
            get(get_profile).put(update_profile).delete(delete_profile),
        )
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Debug, Serialize)]
struct FwProfileOut {
    id: i64,
    login: String,
    name: String,
    tcp_rules: String,
    udp_rules: String,
    firewall_profile: String,
    ip_pool: Option<String>,
    ip_v6_pool: Option<String>,
    region_id: Option<i64>,
    policy_id: Option<i64>,
    hash: String,
}

impl From<FwProfile> for FwProfileOut {
    fn from(p: FwProfile) -> Self {
        FwProfileOut {
            id: p.id,
            login: p.login,
            name: p.name,
            tcp_rules: p.tcp_rules,
            udp_rules: p.udp_rules,
            firewall_profile: p.firewall_profile,
            ip_pool: p.ip_pool,
            ip_v6_pool: p.ip_v6_pool,
            region_id: p.region_id,
            policy_id: p.policy_id,
            hash: p.hash,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    login: Option<String>,
    page: Option<i64>,
    page_size: Option<i64>,
}

async fn list_profiles(
    State(state): State<ApiState>,
    Query(q): Query<ListQuery>,
) -> Result<impl IntoResponse, AdminApiError> {
    let profiles = state::list_profiles_paginated(
        &state.pool,
        q.login.as_deref(),
        q.page.unwrap_or(1),
        q.page_size.unwrap_or(50),
    )
    .await
    .map_err(|e| {
        slog::error!(state.log, "Failed to list profiles"; "error" => e.to_string());
        AdminApiError::from(e)
    })?;
    let out: Vec<FwProfileOut> = profiles.into_iter().map(Into::into).collect();
    Ok((StatusCode::OK, Json(out)))
}

async fn get_profile(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AdminApiError> {
    let profile = state::get_profile_by_id(&state.pool, id)
        .await
        .map_err(|e| {
            slog::error!(state.log, "Failed to fetch profile"; "error" => e.to_string());
            AdminApiError::from(e)
        })?
        .ok_or(AdminApiError::ProfileNotFound(id))?;
    Ok((StatusCode::OK, Json(FwProfileOut::from(profile))))
}

#[derive(Debug, Deserialize)]
struct CreateProfileRequest {
    login: String,
    name: String,
    tcp_rules: String,
    udp_rules: String,
    firewall_profile: String,
    ip_pool: Option<String>,
    ip_v6_pool: Option<String>,
    region_id: Option<i64>,
}

async fn create_profile(
    State(state): State<ApiState>,
    Json(req): Json<CreateProfileRequest>,
) -> Result<impl IntoResponse, AdminApiError> {
    let session = check_radius_with_keepalive(&state, &req.login).await?;

    let new = NewProfile {
        login: &req.login,
        name: &req.name,
        tcp_rules: &req.tcp_rules,
        udp_rules: &req.udp_rules,
        firewall_profile: &req.firewall_profile,
        ip_pool: req.ip_pool.as_deref(),
        ip_v6_pool: req.ip_v6_pool.as_deref(),
        region_id: req.region_id,
    };

    let profile = state::insert_profile(&state.pool, &new).await.map_err(|e| {
        slog::error!(state.log, "Failed to insert profile"; "error" => e.to_string());
        AdminApiError::from(e)
    })?;

    if let Some(nas_ip) = session.nas_ip_address.and_then(|v| v.parse().ok()) {
        let signal = Signal::Create(SignalData {
            login: profile.login.clone(),
            hash: profile.hash.clone(),
            old_hash: None,
            framed_ip_address: session.framed_ip_address,
            delegated_ipv6_prefix: session.delegated_ipv6_prefix,
            tcp_rules: profile.tcp_rules.clone(),
            udp_rules: profile.udp_rules.clone(),
            nas_ip_address: nas_ip,
            policy_id: profile.policy_id,
        });
        if let Err(e) = state.reconciler.dispatch(signal).await {
            slog::error!(state.log, "Failed to dispatch create signal from admin API"; "error" => e.to_string());
        }
    }

    Ok((StatusCode::CREATED, Json(FwProfileOut::from(profile))))
}

#[derive(Debug, Deserialize)]
struct UpdateProfileRequest {
    tcp_rules: String,
    udp_rules: String,
}

async fn update_profile(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, AdminApiError> {
    let existing = state::get_profile_by_id(&state.pool, id)
        .await
        .map_err(|e| {
            slog::error!(state.log, "Failed to fetch profile for update"; "error" => e.to_string());
            AdminApiError::from(e)
        })?
        .ok_or(AdminApiError::ProfileNotFound(id))?;

    let session = check_radius_with_keepalive(&state, &existing.login).await?;

    let (old_hash, updated) = state::update_profile(&state.pool, id, &req.tcp_rules, &req.udp_rules)
        .await
        .map_err(|e| {
            slog::error!(state.log, "Failed to update profile"; "error" => e.to_string());
            AdminApiError::from(e)
        })?;

    if let Some(nas_ip) = session.nas_ip_address.and_then(|v| v.parse().ok()) {
        let signal = Signal::Edit(SignalData {
            login: updated.login.clone(),
            hash: updated.hash.clone(),
            old_hash: Some(old_hash),
            framed_ip_address: session.framed_ip_address,
            delegated_ipv6_prefix: session.delegated_ipv6_prefix,
            tcp_rules: updated.tcp_rules.clone(),
            udp_rules: updated.udp_rules.clone(),
            nas_ip_address: nas_ip,
            policy_id: updated.policy_id,
        });
        if let Err(e) = state.reconciler.dispatch(signal).await {
            slog::error!(state.log, "Failed to dispatch edit signal from admin API"; "error" => e.to_string());
        }
    }

    Ok((StatusCode::OK, Json(FwProfileOut::from(updated))))
}

async fn delete_profile(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AdminApiError> {
    let existing = state::get_profile_by_id(&state.pool, id)
        .await
        .map_err(|e| {
            slog::error!(state.log, "Failed to fetch profile for delete"; "error" => e.to_string());
            AdminApiError::from(e)
        })?
        .ok_or(AdminApiError::ProfileNotFound(id))?;

    let session = check_radius_with_keepalive(&state, &existing.login).await?;

    let removed = state::delete_profile(&state.pool, id)
        .await
        .map_err(|e| {
            slog::error!(state.log, "Failed to delete profile"; "error" => e.to_string());
            AdminApiError::from(e)
        })?
        .ok_or(AdminApiError::ProfileNotFound(id))?;

    if let Some(nas_ip) = session.nas_ip_address.and_then(|v| v.parse().ok()) {
        let signal = Signal::Delete(SignalData {
            login: removed.login.clone(),
            hash: removed.hash.clone(),
            old_hash: None,
            framed_ip_address: session.framed_ip_address,
            delegated_ipv6_prefix: session.delegated_ipv6_prefix,
            tcp_rules: removed.tcp_rules.clone(),
            udp_rules: removed.udp_rules.clone(),
            nas_ip_address: nas_ip,
            policy_id: removed.policy_id,
        });
        if let Err(e) = state.reconciler.dispatch(signal).await {
            slog::error!(state.log, "Failed to dispatch delete signal from admin API"; "error" => e.to_string());
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Verifies there is a live `RADIUS_Sessions` row for `login`, retrying up
/// to `KEEPALIVE_ATTEMPTS` times with `KEEPALIVE_SPACING` between attempts
/// and firing a best-effort keepalive POST between tries so an active
/// client can re-send Accounting-Start.
async fn check_radius_with_keepalive(
    state: &ApiState,
    login: &str,
) -> Result<state::RadiusSession, AdminApiError> {
    for attempt in 0..KEEPALIVE_ATTEMPTS {
        match fetch_session(&state.pool, login).await {
            Ok(Some(session)) => return Ok(session),
            Ok(None) => {}
            Err(e) => {
                slog::error!(state.log, "Failed to query session during keepalive check"; "error" => e.to_string());
            }
        }

        if attempt + 1 < KEEPALIVE_ATTEMPTS {
            send_keepalive(state, login).await;
            tokio::time::sleep(KEEPALIVE_SPACING).await;
        }
    }

    Err(AdminApiError::SessionNotFound)
}

async fn fetch_session(
    pool: &PgPool,
    login: &str,
) -> Result<Option<state::RadiusSession>, sqlx::Error> {
    sqlx::query_as::<_, state::RadiusSession>(
        "SELECT user_name, timestamp, acct_status_type, framed_ip_address, \
         delegated_ipv6_prefix, nas_ip_address FROM \"RADIUS_Sessions\" WHERE user_name = $1",
    )
    .bind(login)
    .fetch_optional(pool)
    .await
}

async fn send_keepalive(state: &ApiState, login: &str) {
    let body = serde_json::json!({"login": login});
    if let Err(e) = state
        .app_client
        .post(&state.app_keepalive_url)
        .json(&body)
        .send()
        .await
    {
        slog::warn!(state.log, "Best-effort keepalive failed"; "login" => login, "error" => e.to_string());
    }
}
