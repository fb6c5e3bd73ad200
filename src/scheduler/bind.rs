//! Bind: reservation plus pod-to-node commit
//!
//! Binding reserves capacity for every qualifying claim on the chosen node
//! first, then submits the pod binding through the orchestrator API. A
//! failed binding rolls the reservations back on a best-effort basis: a
//! rollback that also fails leaves a stale reservation behind, which the
//! agent's prune pass heals once the claim resolves — the rollback only
//! bounds how long that window stays open.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Binding, ObjectReference, Pod};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::{info, warn};

use super::extender::ExtenderBindingArgs;
use super::PlacementEngine;
use crate::error::{Error, Result};
use crate::ledger::{LedgerClient, LedgerStore};

// =============================================================================
// Pod Binder Port
// =============================================================================

/// The pod-to-node commit against the orchestrator
#[async_trait]
pub trait PodBinder: Send + Sync {
    async fn bind(&self, namespace: &str, pod_name: &str, node: &str) -> Result<()>;
}

/// [`PodBinder`] posting the pods/binding subresource
pub struct KubePodBinder {
    client: Client,
}

impl KubePodBinder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodBinder for KubePodBinder {
    async fn bind(&self, namespace: &str, pod_name: &str, node: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let binding = Binding {
            metadata: ObjectMeta {
                name: Some(pod_name.to_string()),
                ..Default::default()
            },
            target: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Node".to_string()),
                name: Some(node.to_string()),
                ..Default::default()
            },
        };

        pods.create_subresource::<serde_json::Value>(
            "binding",
            pod_name,
            &PostParams::default(),
            serde_json::to_vec(&binding)?,
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// Bind Flow
// =============================================================================

/// Reserve every claim on the node, then commit the binding. Reservation
/// failure aborts before any binding call; binding failure releases the
/// fresh reservations best-effort and surfaces the binding error verbatim.
pub(crate) async fn reserve_and_bind<C: LedgerClient>(
    ledgers: &LedgerStore<C>,
    binder: &dyn PodBinder,
    namespace: &str,
    pod_name: &str,
    node: &str,
    claim_keys: &[String],
) -> Result<()> {
    let mut reserved = Vec::with_capacity(claim_keys.len());
    for key in claim_keys {
        match ledgers.reserve(node, key).await {
            Ok(_) => reserved.push(key.as_str()),
            Err(e) => {
                rollback(ledgers, node, &reserved).await;
                return Err(e);
            }
        }
    }

    if let Err(bind_err) = binder.bind(namespace, pod_name, node).await {
        rollback(ledgers, node, &reserved).await;
        return Err(bind_err);
    }

    info!(
        "pod {}/{} bound to node {} with {} reservation(s)",
        namespace,
        pod_name,
        node,
        reserved.len()
    );
    Ok(())
}

async fn rollback<C: LedgerClient>(ledgers: &LedgerStore<C>, node: &str, claim_keys: &[&str]) {
    for key in claim_keys {
        if let Err(e) = ledgers.release(node, key).await {
            warn!(
                "rollback of reservation {} on {} failed ({}); the agent prune pass will retire it",
                key, node, e
            );
        }
    }
}

impl PlacementEngine {
    /// Handle the extender bind call
    pub async fn handle_bind(&self, args: &ExtenderBindingArgs) -> Result<()> {
        if args.pod_name.is_empty() || args.node.is_empty() {
            return Err(Error::InvalidArgument(
                "bind requires a pod name and a node".into(),
            ));
        }
        let namespace = if args.pod_namespace.is_empty() {
            "default"
        } else {
            &args.pod_namespace
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods.get(&args.pod_name).await?;
        let claims = self.pod_claims(&pod).await?;
        let claim_keys: Vec<String> = claims.into_iter().map(|c| c.key).collect();

        reserve_and_bind(
            &self.ledgers,
            self.binder.as_ref(),
            namespace,
            &args.pod_name,
            &args.node,
            &claim_keys,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CapacityLedgerStatus;
    use crate::ledger::testing::FakeLedgerClient;
    use parking_lot::Mutex;

    struct FakeBinder {
        fail: bool,
        calls: Mutex<Vec<(String, String, String)>>,
    }

    impl FakeBinder {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PodBinder for FakeBinder {
        async fn bind(&self, namespace: &str, pod_name: &str, node: &str) -> Result<()> {
            self.calls
                .lock()
                .push((namespace.into(), pod_name.into(), node.into()));
            if self.fail {
                return Err(Error::Internal("binding rejected by apiserver".into()));
            }
            Ok(())
        }
    }

    fn store() -> LedgerStore<FakeLedgerClient> {
        LedgerStore::new(FakeLedgerClient::with_ledger(
            "node-a",
            CapacityLedgerStatus {
                total_capacity: 20,
                free_capacity: 20,
                ..Default::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_bind_reserves_then_commits() {
        let ledgers = store();
        let binder = FakeBinder::new(false);
        let keys = vec!["default/data-0".to_string()];

        reserve_and_bind(&ledgers, &binder, "default", "web-0", "node-a", &keys)
            .await
            .unwrap();

        let ledger = ledgers.get("node-a").await.unwrap().unwrap();
        assert!(ledger.reservations().contains("default/data-0"));
        assert_eq!(
            binder.calls.lock().as_slice(),
            &[(
                "default".to_string(),
                "web-0".to_string(),
                "node-a".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_failed_binding_rolls_back_reservation() {
        let ledgers = store();
        let binder = FakeBinder::new(true);
        let keys = vec!["default/data-0".to_string()];

        let err = reserve_and_bind(&ledgers, &binder, "default", "web-0", "node-a", &keys)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("binding rejected"));

        let ledger = ledgers.get("node-a").await.unwrap().unwrap();
        assert!(ledger.reservations().is_empty());
    }

    #[tokio::test]
    async fn test_bind_without_claims_still_commits() {
        let ledgers = store();
        let binder = FakeBinder::new(false);

        reserve_and_bind(&ledgers, &binder, "default", "web-0", "node-a", &[])
            .await
            .unwrap();

        let ledger = ledgers.get("node-a").await.unwrap().unwrap();
        assert!(ledger.reservations().is_empty());
        assert_eq!(binder.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_binds_both_reserve() {
        // two pods race on the same node; version conflicts force the
        // second writer to retry rather than overwrite the first
        let ledgers = std::sync::Arc::new(store());
        let binder = std::sync::Arc::new(FakeBinder::new(false));

        let l1 = ledgers.clone();
        let b1 = binder.clone();
        let first = tokio::spawn(async move {
            reserve_and_bind(
                &l1,
                b1.as_ref(),
                "default",
                "web-0",
                "node-a",
                &["default/data-0".to_string()],
            )
            .await
        });
        let l2 = ledgers.clone();
        let b2 = binder.clone();
        let second = tokio::spawn(async move {
            reserve_and_bind(
                &l2,
                b2.as_ref(),
                "default",
                "web-1",
                "node-a",
                &["default/data-1".to_string()],
            )
            .await
        });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let ledger = ledgers.get("node-a").await.unwrap().unwrap();
        assert!(ledger.reservations().contains("default/data-0"));
        assert!(ledger.reservations().contains("default/data-1"));
    }
}
