use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "keybind", about = "License key activation and HWID binding", version)]
struct Cli {
    /// keybind server URL
    #[arg(long, env = "KEYBIND_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Owner API bearer token
    #[arg(long, env = "KEYBIND_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the keybind HTTP server
    Serve(ServeArgs),
    /// Validate a key for a hardware ID, binding it on first use
    Validate {
        key: String,
        hwid: String,
    },
    /// Issue a new key
    Create {
        /// Owner email recorded on the key
        #[arg(long)]
        owner: String,
        /// Days until expiry; omit for a key that never expires
        #[arg(long)]
        days: Option<u32>,
    },
    /// List keys
    List {
        /// Only keys belonging to this owner
        #[arg(long)]
        owner: Option<String>,
    },
    /// Pause a key so every validation is rejected
    Pause { key: String },
    /// Reactivate a paused key
    Resume { key: String },
    /// Flip a key between active and paused
    Toggle { key: String },
    /// Unbind a key from its hardware ID
    ResetHwid { key: String },
    /// Delete a key
    Delete { key: String },
    /// Show recent audit events
    Audit {
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Filter by action, e.g. key.validate
        #[arg(long)]
        action: Option<String>,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "KEYBIND_PORT", default_value = "8080")]
    port: u16,
    #[arg(long, env = "KEYBIND_HOST", default_value = "0.0.0.0")]
    host: String,
    /// Directory holding keybind.db [default: platform data dir]
    #[arg(long, env = "KEYBIND_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Comma-separated allowed CORS origins [default: any]
    #[arg(long, env = "KEYBIND_CORS_ORIGINS")]
    cors_origins: Option<String>,
    /// Days of audit history to keep
    #[arg(long, env = "KEYBIND_AUDIT_RETENTION_DAYS", default_value = "30")]
    audit_retention_days: u64,
    /// Owner API bearer token; omit to leave the owner API open
    #[arg(long, env = "KEYBIND_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// File holding the owner API token, preferred over --api-key
    #[arg(long, env = "KEYBIND_API_KEY_FILE")]
    api_key_file: Option<PathBuf>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve(_) => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("KEYBIND_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let api = Api::new(&cli.server, cli.token.clone());

    match cli.command {
        Commands::Serve(args) => cmd_serve(args).await,
        Commands::Validate { key, hwid } => cmd_validate(&api, &key, &hwid).await,
        Commands::Create { owner, days } => {
            let record: KeyItem = api
                .send(
                    api.post("/keys")?
                        .json(&json!({"owner_email": owner, "duration_days": days})),
                )
                .await?;
            println!("{}", record.key_id);
            Ok(())
        }
        Commands::List { owner } => cmd_list(&api, owner.as_deref()).await,
        Commands::Pause { key } => set_status(&api, &key, "paused").await,
        Commands::Resume { key } => set_status(&api, &key, "active").await,
        Commands::Toggle { key } => {
            let record: KeyItem = api
                .send(api.post(&format!("/keys/{key}/toggle"))?)
                .await?;
            println!("✓ {} is now {}", record.key_id, record.status);
            Ok(())
        }
        Commands::ResetHwid { key } => {
            let record: KeyItem = api
                .send(api.post(&format!("/keys/{key}/reset-hwid"))?)
                .await?;
            println!("✓ {} unbound", record.key_id);
            Ok(())
        }
        Commands::Delete { key } => {
            let _: Value = api
                .send(api.authed(api.client.delete(api.url(&format!("/keys/{key}"))))?)
                .await?;
            println!("✓ deleted {key}");
            Ok(())
        }
        Commands::Audit { limit, action } => cmd_audit(&api, limit, action).await,
    }
}

// ── HTTP client ───────────────────────────────────────────────────────────────

struct Api {
    client: Client,
    server: String,
    token: Option<String>,
}

impl Api {
    fn new(server: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            server: server.trim_end_matches('/').to_owned(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    fn authed(&self, req: RequestBuilder) -> Result<RequestBuilder> {
        let token = self
            .token
            .as_deref()
            .context("--token / KEYBIND_TOKEN is required for this command")?;
        Ok(req.bearer_auth(token))
    }

    fn get(&self, path: &str) -> Result<RequestBuilder> {
        self.authed(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str) -> Result<RequestBuilder> {
        self.authed(self.client.post(self.url(path)))
    }

    /// Send an owner API request and decode a successful JSON body.
    async fn send<T: serde::de::DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await.context("HTTP request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let json: Value = resp.json().await.unwrap_or_default();
            anyhow::bail!(
                "server returned {status}: {}",
                json["error"].as_str().unwrap_or("")
            );
        }
        resp.json().await.context("parse response")
    }
}

#[derive(Deserialize)]
struct KeyItem {
    key_id: String,
    owner_email: String,
    hwid: Option<String>,
    status: String,
    expires_at: Option<i64>,
}

#[derive(Deserialize)]
struct AuditItem {
    timestamp: i64,
    action: String,
    key_id: Option<String>,
    source_ip: String,
    success: bool,
    detail: Option<String>,
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(args: ServeArgs) -> Result<()> {
    let api_key = keybind_server::resolve_api_key(args.api_key, args.api_key_file.as_deref())?;
    let cfg = keybind_server::ServerConfig {
        host: args.host,
        port: args.port,
        api_key,
        data_dir: args.data_dir,
        cors_origins: args.cors_origins,
        audit_retention_days: args.audit_retention_days,
        ..Default::default()
    };
    keybind_server::run(cfg).await
}

async fn cmd_validate(api: &Api, key: &str, hwid: &str) -> Result<()> {
    let resp = api
        .client
        .post(api.url("/api/validate-key"))
        .json(&json!({"key": key, "hwid": hwid}))
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    let message = json["message"].as_str().unwrap_or("");
    if status.is_success() {
        println!("✓ {message}");
        Ok(())
    } else {
        anyhow::bail!("{status}: {message}")
    }
}

async fn cmd_list(api: &Api, owner: Option<&str>) -> Result<()> {
    let mut req = api.get("/keys")?;
    if let Some(owner) = owner {
        req = req.query(&[("owner", owner)]);
    }
    let json: Value = api.send(req).await?;
    let keys: Vec<KeyItem> =
        serde_json::from_value(json["keys"].clone()).context("parse key list")?;

    if keys.is_empty() {
        println!("(no keys)");
        return Ok(());
    }
    let now = Utc::now().timestamp_micros();
    for k in &keys {
        let binding = k.hwid.as_deref().unwrap_or("unbound");
        println!(
            "  {} — {} — {} — {} — {}",
            k.key_id,
            k.owner_email,
            k.status,
            binding,
            expiry_info(k.expires_at, now)
        );
    }
    Ok(())
}

async fn set_status(api: &Api, key: &str, status: &str) -> Result<()> {
    let req = api
        .authed(api.client.patch(api.url(&format!("/keys/{key}"))))?
        .json(&json!({"status": status}));
    let record: KeyItem = api.send(req).await?;
    println!("✓ {} is now {}", record.key_id, record.status);
    Ok(())
}

async fn cmd_audit(api: &Api, limit: usize, action: Option<String>) -> Result<()> {
    let mut req = api.get("/audit")?.query(&[("limit", limit.to_string())]);
    if let Some(action) = action {
        req = req.query(&[("action", action)]);
    }
    let json: Value = api.send(req).await?;
    let events: Vec<AuditItem> =
        serde_json::from_value(json["events"].clone()).context("parse audit events")?;

    for e in &events {
        let when = DateTime::<Utc>::from_timestamp(e.timestamp, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| e.timestamp.to_string());
        println!(
            "  {when} {} {} {} {} {}",
            if e.success { "ok  " } else { "fail" },
            e.action,
            e.key_id.as_deref().unwrap_or("-"),
            e.source_ip,
            e.detail.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Human summary of a key's expiry relative to `now` (both Unix microseconds).
fn expiry_info(expires_at: Option<i64>, now: i64) -> String {
    match expires_at {
        Some(exp) if exp > now => {
            format!("expires in {}", format_duration(((exp - now) / 1_000_000) as u64))
        }
        Some(_) => "expired".to_string(),
        None => "never expires".to_string(),
    }
}

fn format_duration(secs: u64) -> String {
    if secs >= 86400 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m");
        assert_eq!(format_duration(7200), "2h");
        assert_eq!(format_duration(30 * 86400), "30d");
    }

    #[test]
    fn expiry_summary() {
        let now = 1_000_000_000_000;
        assert_eq!(expiry_info(None, now), "never expires");
        assert_eq!(expiry_info(Some(now), now), "expired");
        assert_eq!(expiry_info(Some(now + 3_600_000_000), now), "expires in 1h");
    }

    #[test]
    fn owner_commands_need_token() {
        let api = Api::new("http://localhost:8080/", None);
        assert!(api.get("/keys").is_err());
        assert_eq!(api.url("/keys"), "http://localhost:8080/keys");

        let api = Api::new("http://localhost:8080", Some("t".into()));
        assert!(api.post("/keys").is_ok());
    }

    #[test]
    fn cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let args = ["keybind", "create", "--owner", "o@example.com", "--days", "30"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Create { ref owner, days: Some(30) } if owner == "o@example.com"
        ));
    }

    #[test]
    fn serve_flags_cover_server_config() {
        let cli = Cli::try_parse_from([
            "keybind",
            "serve",
            "--data-dir",
            "/var/lib/keybind",
            "--cors-origins",
            "https://app.example.com",
            "--audit-retention-days",
            "7",
            "--api-key-file",
            "/run/secrets/keybind",
        ])
        .unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.data_dir, Some(PathBuf::from("/var/lib/keybind")));
        assert_eq!(args.cors_origins.as_deref(), Some("https://app.example.com"));
        assert_eq!(args.audit_retention_days, 7);
        assert_eq!(args.api_key_file, Some(PathBuf::from("/run/secrets/keybind")));
    }
}
