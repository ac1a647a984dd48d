use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{any, get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_api_key,
    handlers::{
        audit_events, create_key, delete_key, get_key, health, list_keys, patch_key, reset_hwid,
        toggle_key, validate_key,
    },
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token for the owner API. `None` leaves it unauthenticated.
    pub api_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
    pub audit_retention_days: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("KEYBIND_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("KEYBIND_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            api_key: std::env::var("KEYBIND_API_KEY").ok().filter(|k| !k.is_empty()),
            data_dir: std::env::var("KEYBIND_DATA_DIR").ok().map(PathBuf::from),
            sweep_interval: Duration::from_secs(3600),
            cors_origins: std::env::var("KEYBIND_CORS_ORIGINS").ok(),
            audit_retention_days: std::env::var("KEYBIND_AUDIT_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

/// Read a secret from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Pick the owner API token: the key file wins over an inline key, and an
/// empty inline key counts as unset.
pub fn resolve_api_key(key: Option<String>, key_file: Option<&Path>) -> Result<Option<String>> {
    let key = key.filter(|k| !k.is_empty());
    match key_file {
        Some(path) => {
            if key.is_some() {
                warn!("both an API key and an API key file are set; using the file");
            }
            read_key_file(path).map(Some)
        }
        None => Ok(key),
    }
}

/// Create and return the directory holding `keybind.db`: `data_dir` when
/// given, else the platform data dir (`~/.local/share/keybind/` on Linux).
pub fn resolve_data_dir(data_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match data_dir {
        Some(dir) => dir.to_path_buf(),
        None => ProjectDirs::from("", "", "keybind")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_path_buf(),
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("create data dir {}", dir.display()))?;
    Ok(dir)
}

/// Audit retention in seconds, saturating instead of overflowing.
fn retention_seconds(days: u64) -> i64 {
    i64::try_from(days.saturating_mul(86_400)).unwrap_or(i64::MAX)
}

/// Build the HTTP router: public validation and health routes plus the
/// owner API behind [`require_api_key`].
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/api/validate-key", any(validate_key));

    let protected = Router::new()
        .route("/keys", get(list_keys).post(create_key))
        .route("/keys/{key_id}", get(get_key).patch(patch_key).delete(delete_key))
        .route("/keys/{key_id}/toggle", post(toggle_key))
        .route("/keys/{key_id}/reset-hwid", post(reset_hwid))
        .route("/audit", get(audit_events))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_deref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let store = crate::store::Store::open(&data_dir.join("keybind.db")).context("open store")?;

    store.clone().spawn_audit_sweep(
        cfg.sweep_interval,
        retention_seconds(cfg.audit_retention_days),
    );

    if cfg.api_key.is_none() {
        warn!("no KEYBIND_API_KEY configured: owner API is unauthenticated");
    }

    let state = AppState::new(store, cfg.api_key);
    let app = router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "keybind server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::PATCH,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
