pub mod audit;
pub mod db;
pub mod error;
pub mod model;

pub use audit::{AuditEvent, AuditQuery};
pub use db::Store;
pub use error::StoreError;
pub use model::{KeyRecord, KeyStatus};

/// Outcome of an atomic first-use HWID bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindResult {
    /// The stored HWID was null and is now the presented one.
    Bound,
    /// Another HWID was already stored when the write ran.
    AlreadyBound,
    /// No record with this key id.
    NotFound,
}

/// Persistence contract consumed by the validation engine.
pub trait KeyStore: Send + Sync {
    /// Unique point lookup by key id.
    fn find_by_key_id(&self, key_id: &str) -> Result<Option<KeyRecord>, StoreError>;

    /// Set `hwid` to `new_hwid` only if the stored `hwid` is still null at
    /// write time. Must be a single atomic compare-and-set.
    fn conditional_bind_hwid(&self, key_id: &str, new_hwid: &str)
        -> Result<BindResult, StoreError>;
}
