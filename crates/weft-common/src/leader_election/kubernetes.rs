//! Lease backend using Kubernetes Leases
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and the attempt
//! reports `Ok(false)`. This prevents two replicas from both believing they
//! acquired leadership.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{LeaderElectionError, LeaseLock};

/// Lease backend over coordination.k8s.io/v1
#[derive(Clone)]
pub struct KubeLeaseLock {
    client: Client,
    lease_name: String,
    namespace: String,
}

impl KubeLeaseLock {
    /// Create a backend for the named Lease in `namespace`
    pub fn new(client: Client, lease_name: &str, namespace: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Build a backend from the in-cluster or kubeconfig client
    ///
    /// Failing to construct the client is a setup error the caller treats as fatal.
    pub async fn try_default(lease_name: &str, namespace: &str) -> Result<Self, LeaderElectionError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, lease_name, namespace))
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Lease object naming `identity` as holder from `now`
    fn held_by(
        &self,
        identity: &str,
        lease_duration: Duration,
        now: chrono::DateTime<Utc>,
        transitions: i32,
        resource_version: Option<String>,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                lease_duration_seconds: Some(lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// First holder: create the Lease
    async fn create_lease(
        &self,
        api: &Api<Lease>,
        identity: &str,
        lease_duration: Duration,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let lease = self.held_by(identity, lease_duration, now, 0, None);
        let written = api.create(&PostParams::default(), &lease).await;
        cas_outcome(written, identity, "create")
    }

    /// Current holder: bump renewTime on the object we read
    async fn renew_lease(
        &self,
        api: &Api<Lease>,
        existing: &Lease,
        identity: &str,
        lease_duration: Duration,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        if existing.metadata.resource_version.is_none() {
            return Err(missing_resource_version());
        }

        let mut renewed = existing.clone();
        if let Some(spec) = renewed.spec.as_mut() {
            spec.renew_time = Some(MicroTime(now));
            spec.lease_duration_seconds = Some(lease_duration.as_secs() as i32);
        }
        let written = api
            .replace(&self.lease_name, &PostParams::default(), &renewed)
            .await;
        cas_outcome(written, identity, "renew")
    }

    /// New holder of an expired or released Lease
    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        existing: &Lease,
        identity: &str,
        lease_duration: Duration,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let resource_version = existing
            .metadata
            .resource_version
            .clone()
            .ok_or_else(missing_resource_version)?;
        let transitions = existing
            .spec
            .as_ref()
            .and_then(|s| s.lease_transitions)
            .unwrap_or(0)
            + 1;

        let lease = self.held_by(
            identity,
            lease_duration,
            now,
            transitions,
            Some(resource_version),
        );
        let written = api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await;
        let acquired = cas_outcome(written, identity, "take over")?;
        if acquired {
            info!(identity = %identity, transitions, "Took over lease");
        }
        Ok(acquired)
    }
}

/// A write rejected with 409 lost the compare-and-swap race
fn cas_outcome(
    written: Result<Lease, kube::Error>,
    identity: &str,
    operation: &str,
) -> Result<bool, LeaderElectionError> {
    match written {
        Ok(_) => {
            debug!(identity = %identity, operation, "Lease written");
            Ok(true)
        }
        Err(kube::Error::Api(e)) if e.code == 409 => {
            warn!(identity = %identity, operation, "Lease changed concurrently");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn missing_resource_version() -> LeaderElectionError {
    LeaderElectionError::Backend("lease missing resourceVersion".to_string())
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn try_acquire_or_renew(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<bool, LeaderElectionError> {
        let api = self.api();
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        let Some(lease) = existing else {
            return self.create_lease(&api, identity, lease_duration, now).await;
        };

        let spec = lease.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());

        if holder == Some(identity) {
            return self
                .renew_lease(&api, &lease, identity, lease_duration, now)
                .await;
        }

        let renew_time = spec.and_then(|s| s.renew_time.as_ref());
        let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
        let is_expired = match (holder, renew_time, duration_secs) {
            // Released leases have no holder
            (None, _, _) => true,
            (Some(_), Some(rt), Some(duration)) => {
                now > rt.0 + chrono::Duration::seconds(duration as i64)
            }
            _ => true,
        };

        if !is_expired {
            return Ok(false);
        }

        self.take_over_lease(&api, &lease, identity, lease_duration, now)
            .await
    }

    async fn release(&self, identity: &str) -> Result<(), LeaderElectionError> {
        let api = self.api();

        let lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(identity = %identity, "Lease not found, nothing to release");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let holder = lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref());
        if holder != Some(identity) {
            debug!(identity = %identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        // Clear the holder and backdate renewTime so the lease is acquirable now
        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "metadata": {
                "resourceVersion": lease.metadata.resource_version,
            },
            "spec": {
                "holderIdentity": null,
                "renewTime": MicroTime(past),
            }
        });

        api.patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        info!(identity = %identity, lease = %self.lease_name, "Lease released");
        Ok(())
    }
}
