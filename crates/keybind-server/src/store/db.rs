use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use super::error::StoreError;
use super::model::{KeyRecord, KeyStatus};
use super::{BindResult, KeyStore};

pub(crate) const KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("keys");
pub(crate) const AUDIT_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("audit_log");
pub(crate) const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Length of generated key identifiers.
pub const KEY_ID_LEN: usize = 12;

/// Collisions at 62^12 are not expected; this only bounds the loop.
const MAX_KEY_ID_ATTEMPTS: usize = 8;

/// Thread-safe handle to the redb store.
///
/// Every mutation runs inside a single redb write transaction. redb admits one
/// writer at a time, so a read-check-write inside one transaction is an atomic
/// compare-and-set against concurrent validations and owner actions.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(KEYS)?;
        write_txn.open_table(AUDIT_LOG)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Issue a new key for `owner_email`, active and unbound.
    ///
    /// The identifier is generated and checked for collisions inside the same
    /// write transaction that inserts it, so `key_id` stays unique.
    pub fn create_key(
        &self,
        owner_email: &str,
        duration_days: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<KeyRecord> {
        let expires_at = match duration_days {
            Some(days) => Some(
                now.checked_add_signed(chrono::Duration::days(days.into()))
                    .context("expiry out of range")?
                    .timestamp_micros(),
            ),
            None => None,
        };

        let write_txn = self.db.begin_write()?;
        let record = {
            let mut table = write_txn.open_table(KEYS)?;
            let mut created = None;
            for _ in 0..MAX_KEY_ID_ATTEMPTS {
                let key_id = generate_key_id();
                let taken = table.get(key_id.as_str())?.is_some();
                if taken {
                    debug!(key_id = %key_id, "key id collision, regenerating");
                    continue;
                }
                let record = KeyRecord {
                    key_id,
                    owner_email: owner_email.to_owned(),
                    hwid: None,
                    status: KeyStatus::Active,
                    created_at: now.timestamp_micros(),
                    expires_at,
                    duration_days: duration_days.unwrap_or(0),
                };
                let bytes = encode(&record)?;
                table.insert(record.key_id.as_str(), bytes.as_slice())?;
                created = Some(record);
                break;
            }
            created.context("could not allocate a unique key id")?
        };
        write_txn.commit()?;

        info!(key_id = %record.key_id, owner = %record.owner_email, "created key");
        Ok(record)
    }

    /// List keys, optionally restricted to one owner, oldest first.
    pub fn list_keys(&self, owner_email: Option<&str>) -> Result<Vec<KeyRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KEYS)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            let record: KeyRecord = decode(v.value())?;
            if owner_email.map_or(true, |owner| record.owner_email == owner) {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Set the status of a key. Returns `None` if the key does not exist.
    pub fn set_status(&self, key_id: &str, status: KeyStatus) -> Result<Option<KeyRecord>> {
        Ok(self.update_record(key_id, |record| record.status = status)?)
    }

    /// Flip a key between active and paused.
    pub fn toggle_status(&self, key_id: &str) -> Result<Option<KeyRecord>> {
        Ok(self.update_record(key_id, |record| record.status = record.status.toggled())?)
    }

    /// Unbind a key so the next validation binds whichever device presents it.
    pub fn reset_hwid(&self, key_id: &str) -> Result<Option<KeyRecord>> {
        Ok(self.update_record(key_id, |record| record.hwid = None)?)
    }

    /// Delete a key by id. Returns true if it existed.
    pub fn delete_key(&self, key_id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(KEYS)?;
            let existed = table.remove(key_id)?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Read-modify-write of one record inside a single write transaction.
    fn update_record<F>(&self, key_id: &str, apply: F) -> Result<Option<KeyRecord>, StoreError>
    where
        F: FnOnce(&mut KeyRecord),
    {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(KEYS)?;
            let raw_bytes: Option<Vec<u8>> = table.get(key_id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => None,
                Some(bytes) => {
                    let mut record: KeyRecord = decode(&bytes)?;
                    apply(&mut record);
                    let updated = encode(&record)?;
                    table.insert(key_id, updated.as_slice())?;
                    Some(record)
                }
            }
        };
        write_txn.commit()?;
        Ok(updated)
    }
}

impl KeyStore for Store {
    fn find_by_key_id(&self, key_id: &str) -> Result<Option<KeyRecord>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KEYS)?;
        let raw_bytes: Option<Vec<u8>> = table.get(key_id)?.map(|guard| guard.value().to_vec());
        raw_bytes.map(|bytes| decode(&bytes)).transpose()
    }

    fn conditional_bind_hwid(
        &self,
        key_id: &str,
        new_hwid: &str,
    ) -> Result<BindResult, StoreError> {
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(KEYS)?;
            let raw_bytes: Option<Vec<u8>> = table.get(key_id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => BindResult::NotFound,
                Some(bytes) => {
                    let mut record: KeyRecord = decode(&bytes)?;
                    if record.hwid.is_some() {
                        BindResult::AlreadyBound
                    } else {
                        record.hwid = Some(new_hwid.to_owned());
                        let updated = encode(&record)?;
                        table.insert(key_id, updated.as_slice())?;
                        BindResult::Bound
                    }
                }
            }
        };
        write_txn.commit()?;

        debug!(key_id = %key_id, result = ?result, "conditional hwid bind");
        Ok(result)
    }
}

/// Random alphanumeric key identifier of [`KEY_ID_LEN`] characters.
pub fn generate_key_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_ID_LEN)
        .map(char::from)
        .collect()
}

pub(super) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serde::encode_to_vec(
        value,
        bincode::config::standard(),
    )?)
}

pub(super) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    pub(crate) fn make_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    /// Insert a record verbatim, bypassing id generation.
    pub(crate) fn insert_record(store: &Store, record: &KeyRecord) {
        let write_txn = store.db.begin_write().unwrap();
        {
            let mut table = write_txn.open_table(KEYS).unwrap();
            let bytes = encode(record).unwrap();
            table.insert(record.key_id.as_str(), bytes.as_slice()).unwrap();
        }
        write_txn.commit().unwrap();
    }

    #[test]
    fn create_key_defaults() {
        let (s, _dir) = make_store();
        let now = Utc::now();
        let record = s.create_key("owner@example.com", Some(30), now).unwrap();

        assert_eq!(record.key_id.len(), KEY_ID_LEN);
        assert!(record.key_id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(record.hwid, None);
        assert_eq!(record.status, KeyStatus::Active);
        assert_eq!(record.duration_days, 30);
        assert_eq!(
            record.expires_at,
            Some((now + chrono::Duration::days(30)).timestamp_micros())
        );
        assert_eq!(s.find_by_key_id(&record.key_id).unwrap(), Some(record));
    }

    #[test]
    fn create_key_without_duration_is_perpetual() {
        let (s, _dir) = make_store();
        let record = s.create_key("owner@example.com", None, Utc::now()).unwrap();
        assert_eq!(record.expires_at, None);
        assert_eq!(record.duration_days, 0);
    }

    #[test]
    fn find_missing_key() {
        let (s, _dir) = make_store();
        assert_eq!(s.find_by_key_id("NOPE").unwrap(), None);
    }

    #[test]
    fn conditional_bind_only_binds_once() {
        let (s, _dir) = make_store();
        let record = s.create_key("o@example.com", Some(1), Utc::now()).unwrap();

        assert_eq!(
            s.conditional_bind_hwid(&record.key_id, "DEVICE-1").unwrap(),
            BindResult::Bound
        );
        assert_eq!(
            s.conditional_bind_hwid(&record.key_id, "DEVICE-2").unwrap(),
            BindResult::AlreadyBound
        );
        let stored = s.find_by_key_id(&record.key_id).unwrap().unwrap();
        assert_eq!(stored.hwid.as_deref(), Some("DEVICE-1"));
    }

    #[test]
    fn conditional_bind_missing_key() {
        let (s, _dir) = make_store();
        assert_eq!(
            s.conditional_bind_hwid("NOPE", "DEVICE-1").unwrap(),
            BindResult::NotFound
        );
    }

    #[test]
    fn reset_hwid_allows_rebind() {
        let (s, _dir) = make_store();
        let record = s.create_key("o@example.com", Some(1), Utc::now()).unwrap();
        s.conditional_bind_hwid(&record.key_id, "DEVICE-1").unwrap();

        let reset = s.reset_hwid(&record.key_id).unwrap().unwrap();
        assert_eq!(reset.hwid, None);
        assert_eq!(
            s.conditional_bind_hwid(&record.key_id, "DEVICE-2").unwrap(),
            BindResult::Bound
        );
    }

    #[test]
    fn status_updates() {
        let (s, _dir) = make_store();
        let record = s.create_key("o@example.com", Some(1), Utc::now()).unwrap();

        let toggled = s.toggle_status(&record.key_id).unwrap().unwrap();
        assert_eq!(toggled.status, KeyStatus::Paused);
        let toggled = s.toggle_status(&record.key_id).unwrap().unwrap();
        assert_eq!(toggled.status, KeyStatus::Active);

        let set = s.set_status(&record.key_id, KeyStatus::Paused).unwrap().unwrap();
        assert_eq!(set.status, KeyStatus::Paused);

        assert!(s.toggle_status("NOPE").unwrap().is_none());
        assert!(s.set_status("NOPE", KeyStatus::Active).unwrap().is_none());
        assert!(s.reset_hwid("NOPE").unwrap().is_none());
    }

    #[test]
    fn status_change_keeps_binding() {
        let (s, _dir) = make_store();
        let record = s.create_key("o@example.com", Some(1), Utc::now()).unwrap();
        s.conditional_bind_hwid(&record.key_id, "DEVICE-1").unwrap();
        let paused = s.toggle_status(&record.key_id).unwrap().unwrap();
        assert_eq!(paused.hwid.as_deref(), Some("DEVICE-1"));
    }

    #[test]
    fn delete_key() {
        let (s, _dir) = make_store();
        let record = s.create_key("o@example.com", Some(1), Utc::now()).unwrap();
        assert!(s.delete_key(&record.key_id).unwrap());
        assert!(!s.delete_key(&record.key_id).unwrap());
        assert_eq!(s.find_by_key_id(&record.key_id).unwrap(), None);
    }

    #[test]
    fn list_filters_by_owner() {
        let (s, _dir) = make_store();
        let now = Utc::now();
        let a1 = s.create_key("a@example.com", Some(1), now).unwrap();
        let _b = s
            .create_key("b@example.com", Some(1), now + chrono::Duration::seconds(1))
            .unwrap();
        let a2 = s
            .create_key("a@example.com", None, now + chrono::Duration::seconds(2))
            .unwrap();

        let all = s.list_keys(None).unwrap();
        assert_eq!(all.len(), 3);

        let mine = s.list_keys(Some("a@example.com")).unwrap();
        assert_eq!(mine, vec![a1, a2]);
        assert!(s.list_keys(Some("nobody@example.com")).unwrap().is_empty());
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let key_id = {
            let s = Store::open(&path).unwrap();
            let record = s.create_key("o@example.com", Some(7), Utc::now()).unwrap();
            s.conditional_bind_hwid(&record.key_id, "DEVICE-1").unwrap();
            record.key_id
        };

        let s = Store::open(&path).unwrap();
        let stored = s.find_by_key_id(&key_id).unwrap().unwrap();
        assert_eq!(stored.hwid.as_deref(), Some("DEVICE-1"));
        assert_eq!(stored.duration_days, 7);
    }
}
