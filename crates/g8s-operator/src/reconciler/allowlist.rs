use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt as _;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, info, instrument};

use super::{
    ApplyChangesSnafu, BuildObjectSnafu, Context, MissingBackendSecretSnafu, Outcome, Reconcile,
    Result, ensure_ready, report_synced,
};
use crate::{
    cache::{self, ObjectKey},
    client::SecretCreation,
    constants::{
        INJECTION_LABEL_KEY, INJECTION_LABEL_VALUE, MIRROR_OWNER_LABEL_KEY,
        MIRROR_OWNER_LABEL_VALUE,
    },
    crd::{Allowlist, ResourceKind},
    resources::{is_controlled_by, mirrored_secret},
};

/// Mirrors the backend secrets an [`Allowlist`] grants into the target
/// namespaces, then deletes every mirrored secret no target of any cached
/// Allowlist references anymore.
pub struct AllowlistReconciler {
    ctx: Arc<Context>,
}

fn is_opted_in(namespace: &Namespace) -> bool {
    namespace
        .labels()
        .get(INJECTION_LABEL_KEY)
        .is_some_and(|value| value == INJECTION_LABEL_VALUE)
}

impl AllowlistReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    fn namespace_opted_in(&self, name: &str) -> bool {
        cache::get(&self.ctx.caches.namespaces, None, name).is_some_and(|ns| is_opted_in(&ns))
    }

    /// Creates missing mirrors and returns the `(namespace, name)` of every
    /// mirror the Allowlist wants, along with whether anything was written.
    async fn mirror(&self, allowlist: &Allowlist) -> Result<(BTreeSet<(String, String)>, bool)> {
        let ctx = &self.ctx;
        let mut desired = BTreeSet::new();
        let mut wrote = false;

        for target in allowlist.spec.targets() {
            let secret_name = target.secret_name();
            let backend = cache::get(
                &ctx.caches.secrets,
                Some(ctx.namespace.as_str()),
                &secret_name,
            )
            .context(MissingBackendSecretSnafu {
                secret: secret_name.clone(),
                namespace: ctx.namespace.clone(),
                path: target.path(),
            })?;

            let namespace = &target.target.namespace;
            if !self.namespace_opted_in(namespace) {
                debug!(
                    k8s.namespace.name = %namespace,
                    path = %target.path(),
                    "namespace is not opted into mirroring, skipping target"
                );
                continue;
            }
            if !desired.insert((namespace.clone(), secret_name.clone())) {
                continue;
            }

            match cache::get(&ctx.caches.secrets, Some(namespace.as_str()), &secret_name) {
                Some(existing) => {
                    let owned = allowlist
                        .uid()
                        .is_some_and(|uid| is_controlled_by(&existing.metadata, &uid));
                    if !owned {
                        debug!(
                            k8s.namespace.name = %namespace,
                            k8s.secret.name = %secret_name,
                            "secret exists and is not mirrored by this Allowlist, leaving it alone"
                        );
                    }
                }
                None => {
                    let mirror = mirrored_secret(&backend, namespace, allowlist).context(
                        BuildObjectSnafu {
                            kind: ResourceKind::Allowlist,
                        },
                    )?;
                    match ctx
                        .cluster
                        .create_secret(&mirror)
                        .await
                        .context(ApplyChangesSnafu)?
                    {
                        SecretCreation::Created => wrote = true,
                        SecretCreation::AlreadyExists(_) => debug!(
                            k8s.namespace.name = %namespace,
                            k8s.secret.name = %secret_name,
                            "secret exists although it was not cached yet, leaving it alone"
                        ),
                    }
                }
            }
        }

        Ok((desired, wrote))
    }

    /// `(namespace, name)` of every mirror the other cached Allowlists
    /// reference in opted-in namespaces. Their backend secrets are not
    /// checked, that is up to their own reconciliation.
    fn referenced_elsewhere(&self, allowlist: &Allowlist) -> BTreeSet<(String, String)> {
        let name = allowlist.name_any();
        let mut referenced = BTreeSet::new();
        for other in self.ctx.caches.allowlists.state() {
            if other.name_any() == name {
                continue;
            }
            for target in other.spec.targets() {
                let namespace = &target.target.namespace;
                if self.namespace_opted_in(namespace) {
                    referenced.insert((namespace.clone(), target.secret_name()));
                }
            }
        }
        referenced
    }

    /// Deletes mirrored secrets in opted-in namespaces that are not in
    /// `desired`. Returns whether anything was deleted.
    async fn collect_garbage(&self, desired: &BTreeSet<(String, String)>) -> Result<bool> {
        let ctx = &self.ctx;
        let mirror_labels = BTreeMap::from([(
            MIRROR_OWNER_LABEL_KEY.to_owned(),
            MIRROR_OWNER_LABEL_VALUE.to_owned(),
        )]);
        let mut deleted = false;

        for namespace in ctx.caches.namespaces.state() {
            if !is_opted_in(&namespace) {
                continue;
            }
            let namespace = namespace.name_any();

            let mirrors = cache::list_matching(
                &ctx.caches.secrets,
                Some(namespace.as_str()),
                &mirror_labels,
            );
            for secret in mirrors {
                let key = (namespace.clone(), secret.name_any());
                if desired.contains(&key) {
                    continue;
                }

                ctx.cluster
                    .delete_secret(&key.0, &key.1)
                    .await
                    .context(ApplyChangesSnafu)?;
                info!(
                    k8s.namespace.name = %key.0,
                    k8s.secret.name = %key.1,
                    "deleted mirrored secret no longer referenced"
                );
                deleted = true;
            }
        }

        Ok(deleted)
    }
}

#[async_trait]
impl Reconcile for AllowlistReconciler {
    type Resource = Allowlist;

    #[instrument(skip_all, fields(object = %ObjectKey::from_object(allowlist)))]
    async fn reconcile(&self, allowlist: &Allowlist) -> Result<Outcome> {
        let (mut desired, mirrored) = self.mirror(allowlist).await?;
        desired.extend(self.referenced_elsewhere(allowlist));
        let collected = self.collect_garbage(&desired).await?;
        let marked = ensure_ready(&self.ctx, allowlist).await?;

        if mirrored || collected || marked {
            report_synced(&self.ctx, allowlist).await;
            Ok(Outcome::Synced)
        } else {
            Ok(Outcome::Unchanged)
        }
    }
}
