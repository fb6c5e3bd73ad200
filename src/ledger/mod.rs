//! Capacity ledger access protocol
//!
//! All writers of the [`CapacityLedger`] resource go through this module.
//! There is no in-process lock: the scheduler extender and the node agent
//! run in different processes, so every mutation is a version-checked
//! read-modify-write against the API server, retried a bounded number of
//! times on conflict. Writes that would not change the object are skipped
//! entirely to avoid update storms.

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use tracing::debug;

use crate::crd::{CapacityLedger, CapacityLedgerSpec, CapacityLedgerStatus};
use crate::error::{Error, Result};

/// Upper bound on read-modify-write attempts before a conflict is surfaced
pub const MAX_UPDATE_ATTEMPTS: u32 = 5;

// =============================================================================
// Ledger Client Port
// =============================================================================

/// Raw object access underneath the ledger store; the Kubernetes adapter is
/// the production implementation, tests drive the store with an in-memory
/// fake that injects version conflicts
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Fetch the latest version of a node's ledger
    async fn get(&self, node: &str) -> Result<Option<CapacityLedger>>;

    /// Create a new ledger object
    async fn create(&self, ledger: &CapacityLedger) -> Result<CapacityLedger>;

    /// Submit a status update carrying the read `resourceVersion`; the
    /// API server rejects stale versions with a 409
    async fn update_status(&self, ledger: &CapacityLedger) -> Result<CapacityLedger>;
}

/// [`LedgerClient`] backed by the cluster API
pub struct KubeLedgerClient {
    api: Api<CapacityLedger>,
}

impl KubeLedgerClient {
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl LedgerClient for KubeLedgerClient {
    async fn get(&self, node: &str) -> Result<Option<CapacityLedger>> {
        self.api.get_opt(node).await.map_err(Into::into)
    }

    async fn create(&self, ledger: &CapacityLedger) -> Result<CapacityLedger> {
        self.api
            .create(&PostParams::default(), ledger)
            .await
            .map_err(Into::into)
    }

    async fn update_status(&self, ledger: &CapacityLedger) -> Result<CapacityLedger> {
        let name = ledger
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument("ledger without a name".into()))?;
        self.api
            .replace_status(name, &PostParams::default(), serde_json::to_vec(ledger)?)
            .await
            .map_err(Into::into)
    }
}

// =============================================================================
// Ledger Store
// =============================================================================

/// Outcome of a ledger mutation
#[derive(Debug)]
pub enum UpdateOutcome {
    /// The mutation was a no-op; nothing was written
    Unchanged,
    /// The ledger was written; carries the stored object
    Updated(Box<CapacityLedger>),
}

impl UpdateOutcome {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, UpdateOutcome::Unchanged)
    }
}

/// Shared mutation protocol over a node's capacity ledger
pub struct LedgerStore<C: LedgerClient> {
    client: C,
}

impl<C: LedgerClient> LedgerStore<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    #[cfg(test)]
    pub(crate) fn client(&self) -> &C {
        &self.client
    }

    /// Latest version of a node's ledger
    pub async fn get(&self, node: &str) -> Result<Option<CapacityLedger>> {
        self.client.get(node).await
    }

    /// Fetch the node's ledger, creating an empty one on first use. A
    /// create lost to a concurrent registration falls back to the winner's
    /// object.
    pub async fn get_or_create(&self, node: &str) -> Result<CapacityLedger> {
        if let Some(existing) = self.client.get(node).await? {
            return Ok(existing);
        }

        let fresh = CapacityLedger::new(node, CapacityLedgerSpec::default());
        match self.client.create(&fresh).await {
            Ok(created) => {
                debug!("registered capacity ledger for node {}", node);
                Ok(created)
            }
            Err(e) if is_already_exists(&e) => self
                .client
                .get(node)
                .await?
                .ok_or(Error::LedgerMissing { node: node.into() }),
            Err(e) => Err(e),
        }
    }

    /// Read-modify-write with bounded conflict retry. `mutate` returns
    /// whether it changed the status; an unchanged status skips the write.
    pub async fn modify_status<F>(&self, node: &str, mutate: F) -> Result<UpdateOutcome>
    where
        F: Fn(&mut CapacityLedgerStatus) -> bool + Send + Sync,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;

            let mut ledger = self
                .client
                .get(node)
                .await?
                .ok_or(Error::LedgerMissing { node: node.into() })?;

            let mut status = ledger.status.take().unwrap_or_default();
            if !mutate(&mut status) {
                return Ok(UpdateOutcome::Unchanged);
            }
            ledger.status = Some(status);

            match self.client.update_status(&ledger).await {
                Ok(stored) => return Ok(UpdateOutcome::Updated(Box::new(stored))),
                Err(e) if is_conflict(&e) && attempts < MAX_UPDATE_ATTEMPTS => {
                    debug!(
                        "ledger update conflict on {} (attempt {}), retrying",
                        node, attempts
                    );
                }
                Err(e) if is_conflict(&e) => {
                    return Err(Error::Conflict {
                        kind: "CapacityLedger".into(),
                        name: node.into(),
                        attempts,
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Add a capacity reservation for a claim; idempotent
    pub async fn reserve(&self, node: &str, claim_key: &str) -> Result<UpdateOutcome> {
        self.modify_status(node, |status| status.reserve(claim_key))
            .await
    }

    /// Remove a claim's capacity reservation; idempotent
    pub async fn release(&self, node: &str, claim_key: &str) -> Result<UpdateOutcome> {
        self.modify_status(node, |status| status.release(claim_key))
            .await
    }

    /// Record freshly observed volume group capacity; skips the write when
    /// the values are unchanged
    pub async fn refresh_capacity(
        &self,
        node: &str,
        total_gib: u64,
        free_gib: u64,
    ) -> Result<UpdateOutcome> {
        self.modify_status(node, |status| status.record_capacity(total_gib, free_gib))
            .await
    }
}

fn is_conflict(err: &Error) -> bool {
    matches!(err, Error::Kube(kube::Error::Api(resp)) if resp.code == 409)
}

fn is_already_exists(err: &Error) -> bool {
    matches!(err, Error::Kube(kube::Error::Api(resp)) if resp.code == 409 || resp.reason == "AlreadyExists")
}


#[cfg(test)]
mod tests {
    use super::testing::FakeLedgerClient;
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_reserve_and_release_round_trip() {
        let store = LedgerStore::new(FakeLedgerClient::with_ledger(
            "node-a",
            CapacityLedgerStatus {
                total_capacity: 20,
                free_capacity: 20,
                ..Default::default()
            },
        ));

        let outcome = store.reserve("node-a", "default/data-0").await.unwrap();
        assert!(!outcome.is_unchanged());

        let ledger = store.get("node-a").await.unwrap().unwrap();
        assert!(ledger.reservations().contains("default/data-0"));

        // releasing exactly once removes exactly that reservation
        let outcome = store.release("node-a", "default/data-0").await.unwrap();
        assert!(!outcome.is_unchanged());
        let ledger = store.get("node-a").await.unwrap().unwrap();
        assert!(ledger.reservations().is_empty());

        // a second release is a clean no-op, not a double-release
        let outcome = store.release("node-a", "default/data-0").await.unwrap();
        assert!(outcome.is_unchanged());
    }

    #[tokio::test]
    async fn test_reserve_idempotent_skips_write() {
        let store = LedgerStore::new(FakeLedgerClient::with_ledger(
            "node-a",
            CapacityLedgerStatus::default(),
        ));

        store.reserve("node-a", "default/data-0").await.unwrap();
        let writes_before = store.client.writes.load(Ordering::SeqCst);

        let outcome = store.reserve("node-a", "default/data-0").await.unwrap();
        assert!(outcome.is_unchanged());
        assert_eq!(store.client.writes.load(Ordering::SeqCst), writes_before);
    }

    #[tokio::test]
    async fn test_refresh_capacity_no_op_write_suppressed() {
        let store = LedgerStore::new(FakeLedgerClient::with_ledger(
            "node-a",
            CapacityLedgerStatus {
                total_capacity: 100,
                free_capacity: 40,
                ..Default::default()
            },
        ));

        let outcome = store.refresh_capacity("node-a", 100, 40).await.unwrap();
        assert!(outcome.is_unchanged());
        assert_eq!(store.client.writes.load(Ordering::SeqCst), 0);

        let outcome = store.refresh_capacity("node-a", 100, 35).await.unwrap();
        assert!(!outcome.is_unchanged());
    }

    #[tokio::test]
    async fn test_refresh_capacity_keeps_invariant() {
        let store = LedgerStore::new(FakeLedgerClient::with_ledger(
            "node-a",
            CapacityLedgerStatus::default(),
        ));

        store.refresh_capacity("node-a", 50, 60).await.unwrap();
        let ledger = store.get("node-a").await.unwrap().unwrap();
        assert!(ledger.free_capacity() <= ledger.total_capacity());
        assert_eq!(ledger.free_capacity(), 50);
    }

    #[tokio::test]
    async fn test_conflict_retry_succeeds() {
        let client = FakeLedgerClient::with_ledger("node-a", CapacityLedgerStatus::default());
        client.inject_conflicts.store(2, Ordering::SeqCst);
        let store = LedgerStore::new(client);

        let outcome = store.reserve("node-a", "default/data-0").await.unwrap();
        assert!(!outcome.is_unchanged());
        let ledger = store.get("node-a").await.unwrap().unwrap();
        assert!(ledger.reservations().contains("default/data-0"));
    }

    #[tokio::test]
    async fn test_conflict_retry_bounded() {
        let client = FakeLedgerClient::with_ledger("node-a", CapacityLedgerStatus::default());
        client
            .inject_conflicts
            .store(MAX_UPDATE_ATTEMPTS, Ordering::SeqCst);
        let store = LedgerStore::new(client);

        let err = store.reserve("node-a", "default/data-0").await.unwrap_err();
        assert_matches!(
            err,
            Error::Conflict {
                attempts: MAX_UPDATE_ATTEMPTS,
                ..
            }
        );
    }

    #[tokio::test]
    async fn test_modify_missing_ledger() {
        let store = LedgerStore::new(FakeLedgerClient::empty());
        let err = store.reserve("node-a", "default/data-0").await.unwrap_err();
        assert_matches!(err, Error::LedgerMissing { .. });
    }

    #[tokio::test]
    async fn test_get_or_create() {
        let store = LedgerStore::new(FakeLedgerClient::empty());

        let created = store.get_or_create("node-a").await.unwrap();
        assert_eq!(created.node_name(), "node-a");

        // second call returns the existing object instead of recreating
        let again = store.get_or_create("node-a").await.unwrap();
        assert_eq!(
            again.metadata.resource_version,
            created.metadata.resource_version
        );
    }
}
