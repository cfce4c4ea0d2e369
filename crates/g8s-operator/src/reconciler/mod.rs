//! Sync handlers, one per declared kind.
//!
//! Every handler reads from [`Caches`] and writes through [`Cluster`], both
//! handed in through [`Context`]. A handler run for an object converges the
//! cluster towards the declared state and is safe to repeat.
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, runtime::reflector::Store};
use snafu::{ResultExt, Snafu};
use strum::EnumDiscriminants;
use tracing::info;

use crate::{
    cache::{Caches, ObjectKey},
    client::{ClientError, Cluster},
    credentials::GenerateError,
    crd::{Allowlist, Login, ResourceKind, SelfSignedTlsBundle, SshKeyPair},
    events::EventReason,
    logging::controller::ReconcilerError,
    resources::{self, backend_secret_name},
};

pub use allowlist::AllowlistReconciler;
pub use credential::CredentialReconciler;

mod allowlist;
mod credential;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(strum::IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to generate {kind} credentials"))]
    GenerateCredentials {
        source: GenerateError,
        kind: ResourceKind,
    },

    #[snafu(display("failed to build objects derived from {kind}"))]
    BuildObject {
        source: resources::Error,
        kind: ResourceKind,
    },

    #[snafu(display("Resource {resource:?} already exists and is not managed by {kind}"))]
    ResourceExists {
        resource: String,
        namespace: Option<String>,
        kind: ResourceKind,
    },

    #[snafu(display("secret {secret:?} holds no complete generation of {kind} credentials"))]
    IncompleteSecret {
        secret: String,
        namespace: Option<String>,
        kind: ResourceKind,
    },

    #[snafu(display(
        "backend secret {secret:?} referenced by {path} does not exist in namespace {namespace:?}"
    ))]
    MissingBackendSecret {
        secret: String,
        namespace: String,
        path: String,
    },

    #[snafu(display("failed to apply changes to the cluster"))]
    ApplyChanges { source: ClientError },
}

fn secret_reference(name: &str, namespace: Option<&str>) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_owned()),
        kind: Some("Secret".to_owned()),
        name: Some(name.to_owned()),
        namespace: namespace.map(ToOwned::to_owned),
        ..ObjectReference::default()
    }
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        match self {
            Self::ResourceExists { resource, kind, .. } => EventReason::ErrResourceExists {
                resource: resource.clone(),
                kind: *kind,
            }
            .reason(),
            _ => ErrorDiscriminants::from(self).into(),
        }
    }

    fn secondary_object(&self) -> Option<ObjectReference> {
        match self {
            Self::ResourceExists {
                resource,
                namespace,
                ..
            }
            | Self::IncompleteSecret {
                secret: resource,
                namespace,
                ..
            } => Some(secret_reference(resource, namespace.as_deref())),
            Self::MissingBackendSecret {
                secret, namespace, ..
            } => Some(secret_reference(secret, Some(namespace))),
            _ => None,
        }
    }
}

/// What a handler run did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// At least one object was written.
    Synced,
    /// The cluster already matched the declared state.
    Unchanged,
}

/// Everything a handler depends on.
pub struct Context {
    pub caches: Caches,
    pub cluster: Arc<dyn Cluster>,

    /// Namespace of the controller, which holds the backend secrets
    /// Allowlists mirror.
    pub namespace: String,
}

/// A declared resource kind with a cache and a `ready` status.
pub trait Declared: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    const DECLARED_KIND: ResourceKind;

    fn store(caches: &Caches) -> &Store<Self>;

    fn is_ready(&self) -> bool;
}

macro_rules! impl_declared {
    ($($ty:ty => $kind:ident, $store:ident;)+) => {
        $(impl Declared for $ty {
            const DECLARED_KIND: ResourceKind = ResourceKind::$kind;

            fn store(caches: &Caches) -> &Store<Self> {
                &caches.$store
            }

            fn is_ready(&self) -> bool {
                self.status.as_ref().is_some_and(|status| status.ready)
            }
        })+
    };
}

impl_declared! {
    Login => Login, logins;
    SshKeyPair => SshKeyPair, ssh_key_pairs;
    SelfSignedTlsBundle => SelfSignedTlsBundle, tls_bundles;
    Allowlist => Allowlist, allowlists;
}

/// The sync handler of one kind.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    type Resource: Declared;

    async fn reconcile(&self, resource: &Self::Resource) -> Result<Outcome>;
}

/// Removes what the cluster's garbage collector does not: the ClusterRole
/// of a deleted credential and, for TLS bundles, its
/// CertificateSigningRequest. Objects already gone are ignored.
pub async fn cleanup(
    ctx: &Context,
    kind: ResourceKind,
    name: &str,
    reference: &ObjectReference,
) -> Result<()> {
    let dependent = backend_secret_name(kind, name);

    ctx.cluster
        .delete_cluster_role(&dependent)
        .await
        .context(ApplyChangesSnafu)?;
    if kind == ResourceKind::SelfSignedTlsBundle {
        ctx.cluster
            .delete_certificate_signing_request(&dependent)
            .await
            .context(ApplyChangesSnafu)?;
    }

    info!(%kind, k8s.clusterrole.name = %dependent, "cleaned up after deleted resource");
    ctx.cluster
        .publish_event(reference, &EventReason::Deleted.to_event())
        .await;
    Ok(())
}

/// Marks `resource` ready unless it already is, and reports whether a write
/// happened.
async fn ensure_ready<K: Declared>(ctx: &Context, resource: &K) -> Result<bool> {
    if resource.is_ready() {
        return Ok(false);
    }
    ctx.cluster
        .mark_ready(K::DECLARED_KIND, &ObjectKey::from_object(resource))
        .await
        .context(ApplyChangesSnafu)?;
    Ok(true)
}

/// Publishes the `Synced` event on `resource`.
async fn report_synced<K: Declared>(ctx: &Context, resource: &K) {
    ctx.cluster
        .publish_event(&resource.object_ref(&()), &EventReason::Synced.to_event())
        .await;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_reported_as_err_resource_exists() {
        let err = Error::ResourceExists {
            resource: "login-db".to_owned(),
            namespace: Some("g8s".to_owned()),
            kind: ResourceKind::Login,
        };
        let reason = EventReason::ErrResourceExists {
            resource: "login-db".to_owned(),
            kind: ResourceKind::Login,
        };

        assert_eq!(err.category(), "ErrResourceExists");
        assert_eq!(err.to_string(), reason.message());
        assert_eq!(
            err.secondary_object().and_then(|object| object.name),
            Some("login-db".to_owned())
        );
    }

    #[test]
    fn other_errors_use_their_variant_name() {
        let err = Error::MissingBackendSecret {
            secret: "login-db".to_owned(),
            namespace: "g8s".to_owned(),
            path: ".spec.logins[0].targets[0]".to_owned(),
        };

        assert_eq!(err.category(), "MissingBackendSecret");
    }
}
