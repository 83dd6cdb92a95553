//! Lease records and the compare-and-swap store they live in
//!
//! Election is built on a single named lease per cluster. The store is a
//! trait so deployments can back it with whatever consistent keystore
//! they run; the in-memory implementation exists for single-binary use
//! and tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure modes of a lease store operation
#[derive(Debug, Error)]
pub enum LeaseStoreError {
    /// The compare-and-swap precondition failed: someone else wrote first
    #[error("lease version conflict: expected {expected}, found {found}")]
    Conflict { expected: u64, found: u64 },

    /// No lease exists under the requested name
    #[error("lease {0} not found")]
    NotFound(String),

    /// The store itself could not be reached; treated as a lost renewal
    #[error("lease store transport error: {0}")]
    Transport(String),
}

/// A leadership lease
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    /// Identity of the current holder
    pub holder_identity: String,
    /// How long the lease is valid after each renewal
    pub lease_duration: Duration,
    /// Wall-clock time of the last renewal
    pub renew_time: DateTime<Utc>,
    /// Monotonic version used as the compare-and-swap precondition
    pub resource_version: u64,
}

impl Lease {
    /// Whether the lease has lapsed as of `now`
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        let valid_until = self.renew_time
            + chrono::TimeDelta::from_std(self.lease_duration)
                .unwrap_or_else(|_| chrono::TimeDelta::seconds(15));
        now > valid_until
    }
}

/// Consistent keystore holding leadership leases
///
/// Every mutation is conditional: `update` succeeds only when the stored
/// version still matches `expected_version`. That single primitive is
/// what makes concurrent electors safe.
pub trait LeaseStore: Send + Sync {
    /// Fetch the lease under `name`
    fn get(&self, name: &str) -> Result<Lease, LeaseStoreError>;

    /// Create the lease, failing if one already exists
    fn create(&self, name: &str, lease: Lease) -> Result<Lease, LeaseStoreError>;

    /// Replace the lease iff its version is still `expected_version`
    ///
    /// On success the returned lease carries the new version.
    fn update(
        &self,
        name: &str,
        lease: Lease,
        expected_version: u64,
    ) -> Result<Lease, LeaseStoreError>;
}

/// In-process lease store
///
/// A mutex-guarded map with version bookkeeping. The mutex gives the
/// same linearizable compare-and-swap a real keystore would.
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseStore for InMemoryLeaseStore {
    fn get(&self, name: &str) -> Result<Lease, LeaseStoreError> {
        self.leases
            .lock()
            .expect("lease store mutex poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| LeaseStoreError::NotFound(name.to_string()))
    }

    fn create(&self, name: &str, mut lease: Lease) -> Result<Lease, LeaseStoreError> {
        let mut leases = self.leases.lock().expect("lease store mutex poisoned");
        if let Some(existing) = leases.get(name) {
            return Err(LeaseStoreError::Conflict {
                expected: 0,
                found: existing.resource_version,
            });
        }
        lease.resource_version = 1;
        leases.insert(name.to_string(), lease.clone());
        Ok(lease)
    }

    fn update(
        &self,
        name: &str,
        mut lease: Lease,
        expected_version: u64,
    ) -> Result<Lease, LeaseStoreError> {
        let mut leases = self.leases.lock().expect("lease store mutex poisoned");
        let current = leases
            .get(name)
            .ok_or_else(|| LeaseStoreError::NotFound(name.to_string()))?;
        if current.resource_version != expected_version {
            return Err(LeaseStoreError::Conflict {
                expected: expected_version,
                found: current.resource_version,
            });
        }
        lease.resource_version = expected_version + 1;
        leases.insert(name.to_string(), lease.clone());
        Ok(lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: &str) -> Lease {
        Lease {
            holder_identity: holder.to_string(),
            lease_duration: Duration::from_secs(15),
            renew_time: Utc::now(),
            resource_version: 0,
        }
    }

    /// Story: Create is first-writer-wins
    #[test]
    fn story_create_rejects_duplicates() {
        let store = InMemoryLeaseStore::new();
        store.create("ctrl", lease("node-a")).unwrap();
        assert!(matches!(
            store.create("ctrl", lease("node-b")),
            Err(LeaseStoreError::Conflict { .. })
        ));
        assert_eq!(store.get("ctrl").unwrap().holder_identity, "node-a");
    }

    /// Story: A stale version loses the compare-and-swap
    ///
    /// Two electors read version 1; the first to write wins and bumps the
    /// version, the second's update bounces off the precondition.
    #[test]
    fn story_stale_update_conflicts() {
        let store = InMemoryLeaseStore::new();
        let created = store.create("ctrl", lease("node-a")).unwrap();
        assert_eq!(created.resource_version, 1);

        let winner = store.update("ctrl", lease("node-a"), 1).unwrap();
        assert_eq!(winner.resource_version, 2);

        let err = store.update("ctrl", lease("node-b"), 1).unwrap_err();
        assert!(matches!(
            err,
            LeaseStoreError::Conflict {
                expected: 1,
                found: 2
            }
        ));
    }

    /// Story: Expiry is judged against the renewal time
    #[test]
    fn story_expiry_window() {
        let mut l = lease("node-a");
        l.renew_time = Utc::now() - chrono::TimeDelta::seconds(30);
        assert!(l.expired(Utc::now()));

        l.renew_time = Utc::now();
        assert!(!l.expired(Utc::now()));
    }
}
