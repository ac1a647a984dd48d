//! Append-only trail of validations and owner actions.
//!
//! Event ids come from a counter in the same write transaction as the insert,
//! so id order is also time order. Queries walk newest to oldest and pruning
//! walks oldest to newest, each stopping at the first event outside its window.

use std::time::Duration;

use chrono::Utc;
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use super::db::{decode, encode, Store, AUDIT_LOG, COUNTERS};
use super::error::StoreError;

const AUDIT_SEQ: &str = "audit_seq";

pub const ACTION_KEY_VALIDATE: &str = "key.validate";
pub const ACTION_KEY_CREATE: &str = "key.create";
pub const ACTION_KEY_LIST: &str = "key.list";
pub const ACTION_KEY_STATUS: &str = "key.status";
pub const ACTION_KEY_RESET_HWID: &str = "key.reset_hwid";
pub const ACTION_KEY_DELETE: &str = "key.delete";

/// One audited request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: u64,
    /// Unix seconds.
    pub timestamp: i64,
    pub action: String,
    pub key_id: Option<String>,
    pub source_ip: String,
    pub success: bool,
    pub detail: Option<String>,
}

impl AuditEvent {
    /// Stamped with the current time; the store assigns `id` on insert.
    pub fn new(
        action: &str,
        key_id: Option<String>,
        source_ip: String,
        success: bool,
        detail: Option<String>,
    ) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now().timestamp(),
            action: action.to_owned(),
            key_id,
            source_ip,
            success,
            detail,
        }
    }
}

/// Filter for [`Store::list_audit`]. Time bounds are inclusive Unix seconds.
#[derive(Debug, Clone)]
pub struct AuditQuery {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub action: Option<String>,
    pub limit: usize,
}

impl AuditQuery {
    fn older_than_window(&self, event: &AuditEvent) -> bool {
        self.since.is_some_and(|since| event.timestamp < since)
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        self.until.map_or(true, |until| event.timestamp <= until)
            && self.action.as_deref().map_or(true, |a| event.action == a)
    }
}

impl Store {
    /// Append `event` and return the id it was stored under.
    pub fn record_audit(&self, mut event: AuditEvent) -> Result<u64, StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut counters = txn.open_table(COUNTERS)?;
            let id = counters.get(AUDIT_SEQ)?.map_or(1, |last| last.value() + 1);
            counters.insert(AUDIT_SEQ, id)?;

            event.id = id;
            let bytes = encode(&event)?;
            txn.open_table(AUDIT_LOG)?.insert(id, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(event.id)
    }

    /// Events matching `query`, newest first, at most `query.limit` of them.
    pub fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(AUDIT_LOG)?;

        let events: Result<Vec<AuditEvent>, StoreError> = table
            .iter()?
            .rev()
            .map(|entry| {
                let (_, bytes) = entry?;
                decode::<AuditEvent>(bytes.value())
            })
            .take_while(|event| !matches!(event, Ok(e) if query.older_than_window(e)))
            .filter(|event| event.as_ref().map_or(true, |e| query.matches(e)))
            .take(query.limit)
            .collect();
        events
    }

    /// Remove events stamped before `cutoff` (Unix seconds). Returns how many went.
    pub fn prune_audit(&self, cutoff: i64) -> Result<usize, StoreError> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(AUDIT_LOG)?;
            let stale = table
                .iter()?
                .map(|entry| -> Result<(u64, i64), StoreError> {
                    let (id, bytes) = entry?;
                    Ok((id.value(), decode::<AuditEvent>(bytes.value())?.timestamp))
                })
                .take_while(|entry| !matches!(entry, Ok((_, ts)) if *ts >= cutoff))
                .map(|entry| entry.map(|(id, _)| id))
                .collect::<Result<Vec<u64>, StoreError>>()?;
            for id in &stale {
                table.remove(*id)?;
            }
            stale.len()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Every `interval`, drop events older than `retention_secs` on a blocking thread.
    pub fn spawn_audit_sweep(self, interval: Duration, retention_secs: i64) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cutoff = Utc::now().timestamp().saturating_sub(retention_secs);
                let store = self.clone();
                match tokio::task::spawn_blocking(move || store.prune_audit(cutoff)).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(removed)) => info!(removed, cutoff, "pruned audit events"),
                    Ok(Err(e)) => warn!(error = %e, "audit sweep failed"),
                    Err(e) => warn!(error = %e, "audit sweep task panicked"),
                }
            }
        });
    }
}
