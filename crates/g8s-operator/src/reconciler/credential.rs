use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt as _;
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, instrument};

use super::{
    ApplyChangesSnafu, BuildObjectSnafu, Context, Declared, GenerateCredentialsSnafu,
    IncompleteSecretSnafu, Outcome, Reconcile, ResourceExistsSnafu, Result, ensure_ready,
    report_synced,
};
use crate::{
    cache::{self, ObjectKey},
    client::SecretCreation,
    credentials::{Credential, Fields, History},
    resources::{
        backend_secret, backend_secret_name, cluster_role, history_secret, history_secret_name,
        is_controlled_by, secret_fields,
    },
};

/// Sync handler shared by Login, SSHKeyPair and SelfSignedTLSBundle.
///
/// Keeps a backend secret holding the newest generation and a history
/// secret holding all generations. A missing half is rebuilt from the one
/// still present, so no generation is lost.
pub struct CredentialReconciler<C> {
    ctx: Arc<Context>,
    _kind: PhantomData<fn() -> C>,
}

impl<C> CredentialReconciler<C>
where
    C: Credential + Declared,
{
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            _kind: PhantomData,
        }
    }

    fn ensure_owned(&self, resource: &C, secret: &Secret) -> Result<()> {
        let uid = resource.uid().unwrap_or_default();
        ensure!(
            is_controlled_by(&secret.metadata, &uid),
            ResourceExistsSnafu {
                resource: secret.name_any(),
                namespace: resource.namespace(),
                kind: C::KIND,
            }
        );
        Ok(())
    }

    async fn sync(&self, resource: &C) -> Result<Outcome> {
        let ctx = &self.ctx;
        let name = resource.name_any();
        let namespace = resource.namespace();
        let backend_name = backend_secret_name(C::KIND, &name);
        let history_name = history_secret_name(C::KIND, &name);

        let backend = cache::get(&ctx.caches.secrets, namespace.as_deref(), &backend_name);
        let history = cache::get(&ctx.caches.secrets, namespace.as_deref(), &history_name);

        for secret in [&backend, &history].into_iter().flatten() {
            self.ensure_owned(resource, secret)?;
        }

        let mut wrote = false;
        match (backend, history) {
            (None, None) => {
                debug!("creating backend and history secrets");
                let mut history = History::new(C::FIELDS);
                resource
                    .rotate(&mut history)
                    .context(GenerateCredentialsSnafu { kind: C::KIND })?;

                let history = self.create_history(resource, history).await?;
                let newest = history.newest().context(IncompleteSecretSnafu {
                    secret: history_name,
                    namespace: namespace.clone(),
                    kind: C::KIND,
                })?;
                self.create_backend(resource, &resource.backend_fields(newest))
                    .await?;
                wrote = true;
            }
            (None, Some(history)) => {
                debug!("rebuilding backend secret from history");
                let history = History::from_fields(C::FIELDS, &secret_fields(&history));
                let newest = history.newest().context(IncompleteSecretSnafu {
                    secret: history_name,
                    namespace: namespace.clone(),
                    kind: C::KIND,
                })?;

                self.create_backend(resource, &resource.backend_fields(newest))
                    .await?;
                wrote = true;
            }
            (Some(backend), None) => {
                debug!("rebuilding history secret from backend");
                let history = History::from_backend(C::FIELDS, &secret_fields(&backend));
                ensure!(!history.is_empty(), IncompleteSecretSnafu {
                    secret: backend_name.clone(),
                    namespace: namespace.clone(),
                    kind: C::KIND,
                });

                self.create_history(resource, history).await?;
                wrote = true;
            }
            (Some(_), Some(_)) => debug!("backend and history secrets exist"),
        }

        if cache::get(&ctx.caches.cluster_roles, None, &backend_name).is_none() {
            let role = cluster_role(resource).context(BuildObjectSnafu { kind: C::KIND })?;
            ctx.cluster
                .create_cluster_role(&role)
                .await
                .context(ApplyChangesSnafu)?;
            wrote = true;
        }

        wrote |= ensure_ready(ctx, resource).await?;

        if wrote {
            report_synced(ctx, resource).await;
            Ok(Outcome::Synced)
        } else {
            Ok(Outcome::Unchanged)
        }
    }

    /// Creates `secret`. If a secret of that name exists already, it is
    /// returned instead, provided `resource` controls it.
    async fn create_secret(&self, resource: &C, secret: &Secret) -> Result<Option<Secret>> {
        match self
            .ctx
            .cluster
            .create_secret(secret)
            .await
            .context(ApplyChangesSnafu)?
        {
            SecretCreation::Created => Ok(None),
            SecretCreation::AlreadyExists(existing) => {
                self.ensure_owned(resource, &existing)?;
                debug!(
                    k8s.secret.name = %existing.name_any(),
                    "secret exists although it was not cached yet, keeping it"
                );
                Ok(Some(*existing))
            }
        }
    }

    async fn create_backend(&self, resource: &C, fields: &Fields) -> Result<()> {
        let secret = backend_secret(resource, fields).context(BuildObjectSnafu { kind: C::KIND })?;
        self.create_secret(resource, &secret).await.map(|_| ())
    }

    /// Creates the history secret and returns the history the cluster holds
    /// afterwards.
    async fn create_history(&self, resource: &C, history: History) -> Result<History> {
        let secret = history_secret(resource, &history).context(BuildObjectSnafu { kind: C::KIND })?;
        Ok(match self.create_secret(resource, &secret).await? {
            None => history,
            Some(existing) => History::from_fields(C::FIELDS, &secret_fields(&existing)),
        })
    }
}

#[async_trait]
impl<C> Reconcile for CredentialReconciler<C>
where
    C: Credential + Declared,
{
    type Resource = C;

    #[instrument(skip_all, fields(kind = %C::KIND, object = %ObjectKey::from_object(resource)))]
    async fn reconcile(&self, resource: &C) -> Result<Outcome> {
        self.sync(resource).await
    }
}
