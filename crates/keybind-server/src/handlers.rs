use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{
    engine::Outcome,
    store::{
        audit::{
            AuditEvent, ACTION_KEY_CREATE, ACTION_KEY_DELETE, ACTION_KEY_LIST,
            ACTION_KEY_RESET_HWID, ACTION_KEY_STATUS, ACTION_KEY_VALIDATE,
        },
        AuditQuery, KeyRecord, KeyStatus, KeyStore,
    },
    AppState,
};

/// Upper bound on `duration_days` for new keys (100 years).
pub const MAX_DURATION_DAYS: u32 = 36_500;

// ── IP extraction ────────────────────────────────────────────────────────────

fn extract_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|xff| xff.split(',').next());
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());

    forwarded
        .into_iter()
        .chain(real_ip)
        .map(str::trim)
        .find(|ip| !ip.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| addr.ip().to_string())
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Validate ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ValidateRequest {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub hwid: Option<String>,
}

/// Body of every validation endpoint response.
#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub status: &'static str,
    pub message: &'static str,
}

fn validate_response(code: StatusCode, message: &'static str) -> Response {
    let status = if code.is_success() { "success" } else { "error" };
    (code, Json(ValidateResponse { status, message })).into_response()
}

/// Map an engine outcome to the public status code and message.
pub fn outcome_response(outcome: Outcome) -> Response {
    let (code, message) = match outcome {
        Outcome::BadRequest => (StatusCode::BAD_REQUEST, "Key and HWID are required."),
        Outcome::NotFound => (StatusCode::NOT_FOUND, "Key not found."),
        Outcome::Inactive => (StatusCode::FORBIDDEN, "Key is inactive or expired."),
        Outcome::HwidMismatch => (StatusCode::FORBIDDEN, "HWID mismatch."),
        Outcome::ValidAndBound => (StatusCode::OK, "HWID assigned and key validated."),
        Outcome::Valid => (StatusCode::OK, "Key validated."),
        Outcome::InternalError => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error.",
        ),
    };
    validate_response(code, message)
}

/// `/api/validate-key`: check a key for a hardware ID, binding it on first use.
///
/// Routed for every method so non-POST requests get the JSON 405 body.
pub async fn validate_key(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return validate_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }
    let ip = extract_ip(&headers, &addr);

    let req: ValidateRequest = serde_json::from_slice(&body).unwrap_or_default();
    let outcome = match (req.key.as_deref(), req.hwid.as_deref()) {
        (Some(key), Some(hwid)) => state.engine.validate(key, hwid),
        _ => Outcome::BadRequest,
    };

    info!(key_id = ?req.key, outcome = outcome.as_str(), "audit: key.validate");
    let _ = state.store.record_audit(AuditEvent::new(
        ACTION_KEY_VALIDATE,
        req.key.clone(),
        ip,
        outcome.is_success(),
        Some(outcome.as_str().into()),
    ));

    outcome_response(outcome)
}

// ── Owner API: list / get ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListKeysParams {
    pub owner: Option<String>,
}

pub async fn list_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ListKeysParams>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    match state.store.list_keys(params.owner.as_deref()) {
        Ok(keys) => {
            let _ = state.store.record_audit(AuditEvent::new(
                ACTION_KEY_LIST,
                None,
                ip,
                true,
                Some(format!("count={}", keys.len())),
            ));
            Json(json!({ "keys": keys })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn get_key(State(state): State<AppState>, Path(key_id): Path<String>) -> Response {
    match state.store.find_by_key_id(&key_id) {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => key_not_found(),
        Err(e) => internal_error(e.into()),
    }
}

// ── Owner API: create ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub owner_email: String,
    /// Omit for a key that never expires.
    pub duration_days: Option<u32>,
}

pub async fn create_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    let body: CreateKeyRequest = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    let owner = body.owner_email.trim();
    if owner.is_empty() {
        return bad_request("owner_email is required");
    }
    if let Some(days) = body.duration_days {
        if days == 0 || days > MAX_DURATION_DAYS {
            return bad_request(&format!(
                "duration_days must be between 1 and {MAX_DURATION_DAYS}"
            ));
        }
    }

    match state
        .store
        .create_key(owner, body.duration_days, state.clock.now_utc())
    {
        Ok(record) => {
            info!(
                key_id = %record.key_id,
                owner = %record.owner_email,
                duration_days = ?body.duration_days,
                "audit: key.create"
            );
            let _ = state.store.record_audit(AuditEvent::new(
                ACTION_KEY_CREATE,
                Some(record.key_id.clone()),
                ip,
                true,
                Some(format!("owner={}", record.owner_email)),
            ));
            (StatusCode::CREATED, Json(record)).into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ── Owner API: status / reset ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PatchKeyRequest {
    pub status: String,
}

pub async fn patch_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(key_id): Path<String>,
    body: Bytes,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    let body: PatchKeyRequest = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let Some(status) = KeyStatus::parse(&body.status) else {
        return bad_request("status must be \"active\" or \"paused\"");
    };
    let result = state.store.set_status(&key_id, status);
    owner_update(&state, ACTION_KEY_STATUS, key_id, ip, result, |r| {
        format!("status={}", r.status)
    })
}

pub async fn toggle_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(key_id): Path<String>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    let result = state.store.toggle_status(&key_id);
    owner_update(&state, ACTION_KEY_STATUS, key_id, ip, result, |r| {
        format!("status={}", r.status)
    })
}

pub async fn reset_hwid(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(key_id): Path<String>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    let result = state.store.reset_hwid(&key_id);
    owner_update(&state, ACTION_KEY_RESET_HWID, key_id, ip, result, |_| {
        "hwid=null".to_owned()
    })
}

/// Shared tail of the single-record owner mutations: audit, log, respond.
fn owner_update(
    state: &AppState,
    action: &str,
    key_id: String,
    ip: String,
    result: anyhow::Result<Option<KeyRecord>>,
    detail: impl FnOnce(&KeyRecord) -> String,
) -> Response {
    match result {
        Ok(Some(record)) => {
            let detail = detail(&record);
            info!(key_id = %key_id, %detail, "audit: {action}");
            let _ = state.store.record_audit(AuditEvent::new(
                action,
                Some(key_id),
                ip,
                true,
                Some(detail),
            ));
            Json(record).into_response()
        }
        Ok(None) => {
            let _ = state.store.record_audit(AuditEvent::new(
                action,
                Some(key_id),
                ip,
                false,
                Some("not found".into()),
            ));
            key_not_found()
        }
        Err(e) => internal_error(e),
    }
}

// ── Owner API: delete ───────────────────────────────────────────────────────

pub async fn delete_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(key_id): Path<String>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    match state.store.delete_key(&key_id) {
        Ok(existed) => {
            info!(key_id = %key_id, existed, "audit: key.delete");
            let _ = state.store.record_audit(AuditEvent::new(
                ACTION_KEY_DELETE,
                Some(key_id),
                ip,
                existed,
                (!existed).then(|| "not found".to_owned()),
            ));
            if existed {
                Json(json!({"deleted": true})).into_response()
            } else {
                key_not_found()
            }
        }
        Err(e) => internal_error(e),
    }
}

// ── Audit query ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuditQueryParams {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub action: Option<String>,
    pub limit: Option<usize>,
}

pub async fn audit_events(
    State(state): State<AppState>,
    Query(params): Query<AuditQueryParams>,
) -> Response {
    let query = AuditQuery {
        since: params.since,
        until: params.until,
        action: params.action,
        limit: params.limit.unwrap_or(100).min(1000),
    };
    match state.store.list_audit(&query) {
        Ok(events) => Json(json!({ "events": events })).into_response(),
        Err(e) => internal_error(e.into()),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn key_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "key not found"})),
    )
        .into_response()
}

/// Decode an owner API JSON body regardless of content type; anything that
/// does not parse is a 400 carrying the parser's reason.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| bad_request(&format!("invalid request body: {e}")))
}

fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}
