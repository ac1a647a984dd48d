//! Key validation and first-use HWID binding.
//!
//! [`Engine::validate`] is the whole decision procedure. It is stateless apart
//! from the injected store and clock, never panics, and resolves every path to
//! an [`Outcome`]. The only mutation it performs is the conditional bind of an
//! unbound key.

use std::sync::Arc;

use tracing::{debug, error};

use crate::clock::{Clock, SystemClock};
use crate::store::{BindResult, KeyRecord, KeyStore};

/// Retries allowed after losing a first-bind race.
const MAX_BIND_RETRIES: usize = 1;

/// Result of validating a key against a presented hardware ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Key id or HWID missing.
    BadRequest,
    NotFound,
    /// Paused or expired.
    Inactive,
    /// Bound to different hardware.
    HwidMismatch,
    /// Already bound to this hardware.
    Valid,
    /// Was unbound; now bound to this hardware.
    ValidAndBound,
    InternalError,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Valid | Self::ValidAndBound)
    }

    /// Stable snake_case name used in logs and audit details.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::Inactive => "inactive",
            Self::HwidMismatch => "hwid_mismatch",
            Self::Valid => "valid",
            Self::ValidAndBound => "valid_and_bound",
            Self::InternalError => "internal_error",
        }
    }
}

/// Validation & binding engine over an injected store and clock.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn KeyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Validate `key_id` for `hwid`, binding the key on first use.
    pub fn validate(&self, key_id: &str, hwid: &str) -> Outcome {
        if key_id.is_empty() || hwid.is_empty() {
            return Outcome::BadRequest;
        }

        let mut record = match self.lookup(key_id) {
            Ok(Some(record)) => record,
            Ok(None) => return Outcome::NotFound,
            Err(outcome) => return outcome,
        };

        if !record.is_live(self.clock.now_micros()) {
            return Outcome::Inactive;
        }

        for attempt in 0..=MAX_BIND_RETRIES {
            if let Some(outcome) = compare_bound(&record, hwid) {
                return outcome;
            }

            match self.store.conditional_bind_hwid(key_id, hwid) {
                Ok(BindResult::Bound) => return Outcome::ValidAndBound,
                // Deleted between the read and the bind.
                Ok(BindResult::NotFound) => return Outcome::NotFound,
                Ok(BindResult::AlreadyBound) if attempt < MAX_BIND_RETRIES => {
                    debug!(key_id = %key_id, "lost first-bind race, re-reading");
                    record = match self.lookup(key_id) {
                        Ok(Some(record)) => record,
                        Ok(None) => return Outcome::NotFound,
                        Err(outcome) => return outcome,
                    };
                }
                Ok(BindResult::AlreadyBound) => break,
                Err(e) => {
                    error!(key_id = %key_id, error = %e, "hwid bind failed");
                    return Outcome::InternalError;
                }
            }
        }

        error!(key_id = %key_id, "hwid bind conflicted after retry");
        Outcome::InternalError
    }

    fn lookup(&self, key_id: &str) -> Result<Option<KeyRecord>, Outcome> {
        self.store.find_by_key_id(key_id).map_err(|e| {
            error!(key_id = %key_id, error = %e, "key lookup failed");
            Outcome::InternalError
        })
    }
}

/// Decide from an already-bound record; `None` means the key is unbound.
fn compare_bound(record: &KeyRecord, hwid: &str) -> Option<Outcome> {
    record.hwid.as_deref().map(|bound| {
        if bound == hwid {
            Outcome::Valid
        } else {
            Outcome::HwidMismatch
        }
    })
}
