//! Every write the controller performs against the cluster.
//!
//! Reads are served from [`crate::cache`]. Writes go through the [`Cluster`]
//! trait so reconcilers can be exercised without an API server.
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::{
    NamespaceResourceScope,
    api::{
        certificates::v1::CertificateSigningRequest,
        core::v1::{ObjectReference, Secret},
        rbac::v1::ClusterRole,
    },
};
use kube::{
    Api, Resource,
    api::{DeleteParams, Patch, PatchParams, PostParams},
    runtime::events::{Event, Recorder, Reporter},
};
use serde::de::DeserializeOwned;
use serde_json::json;
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use crate::{
    cache::ObjectKey,
    crd::{Allowlist, Login, ResourceKind, SelfSignedTlsBundle, SshKeyPair},
};

type Result<T, E = ClientError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("failed to create {kind} {name:?}"))]
    CreateObject {
        source: kube::Error,
        kind: &'static str,
        name: String,
    },

    #[snafu(display("failed to get existing {kind} {name:?}"))]
    GetObject {
        source: kube::Error,
        kind: &'static str,
        name: String,
    },

    #[snafu(display("failed to delete {kind} {name:?}"))]
    DeleteObject {
        source: kube::Error,
        kind: &'static str,
        name: String,
    },

    #[snafu(display("failed to update status of {kind} {key}"))]
    PatchStatus {
        source: kube::Error,
        kind: ResourceKind,
        key: ObjectKey,
    },
}

/// How [`Cluster::create_secret`] ended.
#[derive(Clone, Debug, PartialEq)]
pub enum SecretCreation {
    Created,

    /// A secret of that name already exists. It is handed back so callers
    /// can decide whether it is theirs.
    AlreadyExists(Box<Secret>),
}

/// Cluster-side mutations.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn create_secret(&self, secret: &Secret) -> Result<SecretCreation>;

    /// Deleting a secret which is already gone succeeds.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// Creating a ClusterRole which already exists succeeds.
    async fn create_cluster_role(&self, cluster_role: &ClusterRole) -> Result<()>;

    /// Deleting a ClusterRole which is already gone succeeds.
    async fn delete_cluster_role(&self, name: &str) -> Result<()>;

    /// Deleting a CertificateSigningRequest which is already gone succeeds.
    async fn delete_certificate_signing_request(&self, name: &str) -> Result<()>;

    /// Sets `status.ready` of a declared resource, leaving its spec alone.
    async fn mark_ready(&self, kind: ResourceKind, key: &ObjectKey) -> Result<()>;

    /// Publishes `event` on `reference`. Failures are logged, never returned.
    async fn publish_event(&self, reference: &ObjectReference, event: &Event);
}

/// [`Cluster`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
    recorder: Recorder,
    post_params: PostParams,
    status_patch_params: PatchParams,
}

impl KubeCluster {
    pub fn new(client: kube::Client, field_manager: &str) -> Self {
        let recorder = Recorder::new(client.clone(), Reporter {
            controller: field_manager.to_owned(),
            instance: None,
        });

        Self {
            client,
            recorder,
            post_params: PostParams {
                field_manager: Some(field_manager.to_owned()),
                ..PostParams::default()
            },
            status_patch_params: PatchParams {
                field_manager: Some(field_manager.to_owned()),
                ..PatchParams::default()
            },
        }
    }

    async fn patch_ready<K>(&self, api: Api<K>, kind: ResourceKind, key: &ObjectKey) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        let patch = Patch::Merge(json!({ "status": { "ready": true } }));
        api.patch_status(&key.name, &self.status_patch_params, &patch)
            .await
            .context(PatchStatusSnafu {
                kind,
                key: key.clone(),
            })?;
        Ok(())
    }

    fn namespaced<K>(&self, key: &ObjectKey) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &key.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

/// Maps a NotFound response to success.
fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), kube::Error> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(err) => Err(err),
    }
}

/// Maps a Conflict response, which a create gets for an existing name, to
/// `false`. Returns `true` if the object was created.
fn created_unless_conflict<T>(result: Result<T, kube::Error>) -> Result<bool, kube::Error> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn create_secret(&self, secret: &Secret) -> Result<SecretCreation> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let api: Api<Secret> = match &secret.metadata.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::default_namespaced(self.client.clone()),
        };
        let created = created_unless_conflict(api.create(&self.post_params, secret).await)
            .context(CreateObjectSnafu {
                kind: "Secret",
                name: name.clone(),
            })?;
        if created {
            debug!(k8s.secret.name = %name, "created secret");
            return Ok(SecretCreation::Created);
        }

        let existing = api.get(&name).await.context(GetObjectSnafu {
            kind: "Secret",
            name: name.clone(),
        })?;
        debug!(k8s.secret.name = %name, "secret already exists");
        Ok(SecretCreation::AlreadyExists(Box::new(existing)))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await).context(
            DeleteObjectSnafu {
                kind: "Secret",
                name,
            },
        )
    }

    async fn create_cluster_role(&self, cluster_role: &ClusterRole) -> Result<()> {
        let name = cluster_role.metadata.name.clone().unwrap_or_default();
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        let created =
            created_unless_conflict(api.create(&self.post_params, cluster_role).await).context(
                CreateObjectSnafu {
                    kind: "ClusterRole",
                    name: name.clone(),
                },
            )?;
        debug!(k8s.clusterrole.name = %name, created, "ensured cluster role");
        Ok(())
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<()> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await).context(
            DeleteObjectSnafu {
                kind: "ClusterRole",
                name,
            },
        )
    }

    async fn delete_certificate_signing_request(&self, name: &str) -> Result<()> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await).context(
            DeleteObjectSnafu {
                kind: "CertificateSigningRequest",
                name,
            },
        )
    }

    async fn mark_ready(&self, kind: ResourceKind, key: &ObjectKey) -> Result<()> {
        match kind {
            ResourceKind::Login => self.patch_ready(self.namespaced::<Login>(key), kind, key).await,
            ResourceKind::SshKeyPair => {
                self.patch_ready(self.namespaced::<SshKeyPair>(key), kind, key)
                    .await
            }
            ResourceKind::SelfSignedTlsBundle => {
                self.patch_ready(self.namespaced::<SelfSignedTlsBundle>(key), kind, key)
                    .await
            }
            ResourceKind::Allowlist => {
                let api: Api<Allowlist> = Api::all(self.client.clone());
                self.patch_ready(api, kind, key).await
            }
        }
    }

    async fn publish_event(&self, reference: &ObjectReference, event: &Event) {
        if let Err(err) = self.recorder.publish(event, reference).await {
            warn!(
                reason = %event.reason,
                error = &err as &dyn std::error::Error,
                "failed to publish Kubernetes event"
            );
        }
    }
}
