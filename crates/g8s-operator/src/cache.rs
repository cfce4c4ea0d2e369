//! Local read-only mirrors of the cluster objects the controller and the
//! webhook depend on.
//!
//! Each [`Store`] is written by exactly one watch task spawned through
//! [`spawn_watch`]. Every other component only reads.
use std::{collections::BTreeMap, error::Error, fmt, sync::Arc, time::Duration};

use futures::StreamExt as _;
use k8s_openapi::api::{
    core::v1::{Namespace, Secret},
    rbac::v1::ClusterRole,
};
use kube::{
    Api, Resource, ResourceExt as _,
    runtime::{
        WatchStreamExt as _,
        reflector::{self, ObjectRef, Store, store::Writer},
        watcher,
    },
};
use serde::de::DeserializeOwned;
use snafu::{ResultExt, Snafu};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    constants::API_GROUP,
    crd::{Allowlist, Login, ResourceKind, SelfSignedTlsBundle, SshKeyPair},
};

type Result<T, E = CacheError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum CacheError {
    #[snafu(display("{kind} cache did not sync within {}", humantime::format_duration(*timeout)))]
    CacheSyncTimeout {
        source: tokio::time::error::Elapsed,
        kind: &'static str,
        timeout: Duration,
    },

    #[snafu(display("{kind} cache writer was dropped before the initial sync"))]
    WriterDropped {
        source: reflector::store::WriterDropped,
        kind: &'static str,
    },
}

/// Identifies an object: `namespace/name`, or just `name` when
/// cluster-scoped.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(ToOwned::to_owned),
            name: name.to_owned(),
        }
    }

    pub fn from_object<K: Resource>(object: &K) -> Self {
        Self {
            namespace: object.meta().namespace.clone(),
            name: object.name_any(),
        }
    }

    pub fn object_ref<K>(&self) -> ObjectRef<K>
    where
        K: Resource<DynamicType = ()>,
    {
        let reference = ObjectRef::new(&self.name);
        match &self.namespace {
            Some(namespace) => reference.within(namespace),
            None => reference,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{name}", name = self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A declared resource that owns a dependent object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Owner {
    Login(ObjectKey),
    SshKeyPair(ObjectKey),
    SelfSignedTlsBundle(ObjectKey),
    Allowlist(ObjectKey),
}

impl Owner {
    pub fn new(kind: ResourceKind, key: ObjectKey) -> Self {
        match kind {
            ResourceKind::Login => Self::Login(key),
            ResourceKind::SshKeyPair => Self::SshKeyPair(key),
            ResourceKind::SelfSignedTlsBundle => Self::SelfSignedTlsBundle(key),
            ResourceKind::Allowlist => Self::Allowlist(key),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Login(_) => ResourceKind::Login,
            Self::SshKeyPair(_) => ResourceKind::SshKeyPair,
            Self::SelfSignedTlsBundle(_) => ResourceKind::SelfSignedTlsBundle,
            Self::Allowlist(_) => ResourceKind::Allowlist,
        }
    }

    pub fn key(&self) -> &ObjectKey {
        match self {
            Self::Login(key)
            | Self::SshKeyPair(key)
            | Self::SelfSignedTlsBundle(key)
            | Self::Allowlist(key) => key,
        }
    }
}

/// Who controls a dependent object, according to its controller owner
/// reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OwnerResolution {
    NoOwner,

    /// Controlled by a kind this controller does not reconcile.
    Untracked { kind: String },

    /// A cluster-scoped object controlled by a namespaced g8s resource which
    /// is not in the cache (anymore).
    Orphaned { kind: ResourceKind, name: String },

    Tracked(Owner),
}

/// A change observed by a watch task, after it was applied to the store.
#[derive(Debug)]
pub enum Change<K> {
    Applied(Arc<K>),
    Deleted(Arc<K>),
}

/// Readers of every store. Cheap to clone.
#[derive(Clone)]
pub struct Caches {
    pub logins: Store<Login>,
    pub ssh_key_pairs: Store<SshKeyPair>,
    pub tls_bundles: Store<SelfSignedTlsBundle>,
    pub allowlists: Store<Allowlist>,
    pub secrets: Store<Secret>,
    pub cluster_roles: Store<ClusterRole>,
    pub namespaces: Store<Namespace>,
}

/// The write halves of [`Caches`], each moved into its watch task.
pub struct CacheWriters {
    pub logins: Writer<Login>,
    pub ssh_key_pairs: Writer<SshKeyPair>,
    pub tls_bundles: Writer<SelfSignedTlsBundle>,
    pub allowlists: Writer<Allowlist>,
    pub secrets: Writer<Secret>,
    pub cluster_roles: Writer<ClusterRole>,
    pub namespaces: Writer<Namespace>,
}

impl Caches {
    pub fn new() -> (Self, CacheWriters) {
        let (logins, logins_writer) = reflector::store();
        let (ssh_key_pairs, ssh_key_pairs_writer) = reflector::store();
        let (tls_bundles, tls_bundles_writer) = reflector::store();
        let (allowlists, allowlists_writer) = reflector::store();
        let (secrets, secrets_writer) = reflector::store();
        let (cluster_roles, cluster_roles_writer) = reflector::store();
        let (namespaces, namespaces_writer) = reflector::store();

        (
            Self {
                logins,
                ssh_key_pairs,
                tls_bundles,
                allowlists,
                secrets,
                cluster_roles,
                namespaces,
            },
            CacheWriters {
                logins: logins_writer,
                ssh_key_pairs: ssh_key_pairs_writer,
                tls_bundles: tls_bundles_writer,
                allowlists: allowlists_writer,
                secrets: secrets_writer,
                cluster_roles: cluster_roles_writer,
                namespaces: namespaces_writer,
            },
        )
    }

    /// Waits until every store finished its initial list.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(tokio::time::Instant::now());

        wait_for_store(&self.logins, "Login", remaining()).await?;
        wait_for_store(&self.ssh_key_pairs, "SSHKeyPair", remaining()).await?;
        wait_for_store(&self.tls_bundles, "SelfSignedTLSBundle", remaining()).await?;
        wait_for_store(&self.allowlists, "Allowlist", remaining()).await?;
        wait_for_store(&self.secrets, "Secret", remaining()).await?;
        wait_for_store(&self.cluster_roles, "ClusterRole", remaining()).await?;
        wait_for_store(&self.namespaces, "Namespace", remaining()).await
    }

    /// Resolves the controller owner reference of `object` to the key of a
    /// reconciled resource.
    ///
    /// Namespaced owners share the namespace of their dependents. Dependents
    /// without a namespace, such as ClusterRoles, are matched against the
    /// owner's cache by uid.
    pub fn resolve_owner<K: Resource>(&self, object: &K) -> OwnerResolution {
        let Some(reference) = object
            .owner_references()
            .iter()
            .find(|reference| reference.controller == Some(true))
        else {
            return OwnerResolution::NoOwner;
        };

        let group = reference.api_version.split('/').next().unwrap_or_default();
        let kind = match ResourceKind::from_kind(&reference.kind) {
            Some(kind) if group == API_GROUP => kind,
            _ => {
                return OwnerResolution::Untracked {
                    kind: reference.kind.clone(),
                };
            }
        };

        if !kind.is_namespaced() {
            return OwnerResolution::Tracked(Owner::new(
                kind,
                ObjectKey::new(None, &reference.name),
            ));
        }
        if let Some(namespace) = object.meta().namespace.as_deref() {
            return OwnerResolution::Tracked(Owner::new(
                kind,
                ObjectKey::new(Some(namespace), &reference.name),
            ));
        }

        let found = match kind {
            ResourceKind::Login => find_by_uid(&self.logins, &reference.uid),
            ResourceKind::SshKeyPair => find_by_uid(&self.ssh_key_pairs, &reference.uid),
            ResourceKind::SelfSignedTlsBundle => find_by_uid(&self.tls_bundles, &reference.uid),
            ResourceKind::Allowlist => find_by_uid(&self.allowlists, &reference.uid),
        };
        match found {
            Some(key) => OwnerResolution::Tracked(Owner::new(kind, key)),
            None => OwnerResolution::Orphaned {
                kind,
                name: reference.name.clone(),
            },
        }
    }

    /// Keys of every cached Allowlist.
    pub fn allowlist_keys(&self) -> Vec<ObjectKey> {
        self.allowlists
            .state()
            .iter()
            .map(|allowlist| ObjectKey::from_object(allowlist.as_ref()))
            .collect()
    }
}

/// Waits until `store` finished its initial list, or fails after `timeout`.
pub async fn wait_for_store<K>(
    store: &Store<K>,
    kind: &'static str,
    timeout: Duration,
) -> Result<()>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + std::hash::Hash,
{
    tokio::time::timeout(timeout, store.wait_until_ready())
        .await
        .context(CacheSyncTimeoutSnafu { kind, timeout })?
        .context(WriterDroppedSnafu { kind })?;
    debug!(kind, "cache synced");
    Ok(())
}

/// Looks up the object `name` in `namespace`.
pub fn get<K>(store: &Store<K>, namespace: Option<&str>, name: &str) -> Option<Arc<K>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store.get(&ObjectKey::new(namespace, name).object_ref())
}

/// Every object in `namespace` whose labels include all of `labels`.
pub fn list_matching<K>(
    store: &Store<K>,
    namespace: Option<&str>,
    labels: &BTreeMap<String, String>,
) -> Vec<Arc<K>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store
        .state()
        .into_iter()
        .filter(|object| namespace.is_none() || object.meta().namespace.as_deref() == namespace)
        .filter(|object| {
            let object_labels = object.labels();
            labels
                .iter()
                .all(|(key, value)| object_labels.get(key) == Some(value))
        })
        .collect()
}

fn find_by_uid<K>(store: &Store<K>, uid: &str) -> Option<ObjectKey>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store
        .find(|object| object.meta().uid.as_deref() == Some(uid))
        .map(|object| ObjectKey::from_object(object.as_ref()))
}

/// Spawns the task which feeds `writer` from a watch on `api` and reports
/// every applied change to `handler`.
///
/// The store is updated before `handler` runs, so handlers observe the new
/// state.
pub fn spawn_watch<K, F>(
    api: Api<K>,
    config: watcher::Config,
    mut writer: Writer<K>,
    mut handler: F,
) -> JoinHandle<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    F: FnMut(Change<K>) + Send + 'static,
{
    tokio::spawn(async move {
        let kind = K::kind(&()).into_owned();
        let mut events = watcher(api, config).default_backoff().boxed();

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    warn!(
                        kind,
                        error = &err as &dyn Error,
                        "watch failed, retrying with backoff"
                    );
                    continue;
                }
            };

            writer.apply_watcher_event(&event);

            match event {
                watcher::Event::Apply(object) | watcher::Event::InitApply(object) => {
                    handler(Change::Applied(Arc::new(object)));
                }
                watcher::Event::Delete(object) => handler(Change::Deleted(Arc::new(object))),
                watcher::Event::Init | watcher::Event::InitDone => {}
            }
        }
    })
}

/// Feeds `object` into `writer` as if it was observed by a watch.
#[cfg(test)]
pub(crate) fn seed<K>(writer: &mut Writer<K>, object: K)
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    writer.apply_watcher_event(&watcher::Event::Apply(object));
}

/// Marks every store of `writers` as synced.
#[cfg(test)]
pub(crate) fn mark_synced(writers: &mut CacheWriters) {
    writers.logins.apply_watcher_event(&watcher::Event::InitDone);
    writers.ssh_key_pairs.apply_watcher_event(&watcher::Event::InitDone);
    writers.tls_bundles.apply_watcher_event(&watcher::Event::InitDone);
    writers.allowlists.apply_watcher_event(&watcher::Event::InitDone);
    writers.secrets.apply_watcher_event(&watcher::Event::InitDone);
    writers.cluster_roles.apply_watcher_event(&watcher::Event::InitDone);
    writers.namespaces.apply_watcher_event(&watcher::Event::InitDone);
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::core::ObjectMeta;
    use rstest::rstest;

    use super::*;
    use crate::crd::LoginSpec;

    fn owner_ref(api_version: &str, kind: &str, name: &str, uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_owned(),
            kind: kind.to_owned(),
            name: name.to_owned(),
            uid: uid.to_owned(),
            controller: Some(true),
            ..OwnerReference::default()
        }
    }

    fn secret(namespace: &str, name: &str, owner: Option<OwnerReference>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                owner_references: owner.map(|owner| vec![owner]),
                labels: Some(BTreeMap::from([("owner".to_owned(), "g8s-master".to_owned())])),
                resource_version: Some("1".to_owned()),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        }
    }

    #[rstest]
    #[case(ObjectKey::new(None, "g8s-master"), "g8s-master")]
    #[case(ObjectKey::new(Some("g8s"), "login-db"), "g8s/login-db")]
    fn keys_display_as_namespace_and_name(#[case] key: ObjectKey, #[case] expected: &str) {
        assert_eq!(key.to_string(), expected);
    }

    #[test]
    fn keys_convert_to_object_refs() {
        let reference: ObjectRef<Login> = ObjectKey::new(Some("g8s"), "db").object_ref();

        assert_eq!(reference.name, "db");
        assert_eq!(reference.namespace.as_deref(), Some("g8s"));
    }

    #[test]
    fn resolves_namespaced_owner_from_namespace() {
        let (caches, _writers) = Caches::new();
        let object = secret(
            "g8s",
            "login-db",
            Some(owner_ref("api.g8s.io/v1alpha1", "Login", "db", "uid-1")),
        );

        assert_eq!(
            caches.resolve_owner(&object),
            OwnerResolution::Tracked(Owner::Login(ObjectKey::new(Some("g8s"), "db")))
        );
    }

    #[test]
    fn resolves_cluster_scoped_dependent_by_uid() {
        let (caches, mut writers) = Caches::new();
        seed(&mut writers.logins, Login {
            metadata: ObjectMeta {
                name: Some("db".to_owned()),
                namespace: Some("g8s".to_owned()),
                uid: Some("uid-1".to_owned()),
                ..ObjectMeta::default()
            },
            spec: LoginSpec::default(),
            status: None,
        });
        let role = |uid: &str| ClusterRole {
            metadata: ObjectMeta {
                name: Some("login-db".to_owned()),
                owner_references: Some(vec![owner_ref(
                    "api.g8s.io/v1alpha1",
                    "Login",
                    "db",
                    uid,
                )]),
                ..ObjectMeta::default()
            },
            ..ClusterRole::default()
        };

        assert_eq!(
            caches.resolve_owner(&role("uid-1")),
            OwnerResolution::Tracked(Owner::Login(ObjectKey::new(Some("g8s"), "db")))
        );
        assert_eq!(
            caches.resolve_owner(&role("uid-2")),
            OwnerResolution::Orphaned {
                kind: ResourceKind::Login,
                name: "db".to_owned()
            }
        );
    }

    #[rstest]
    #[case::no_owner(None, OwnerResolution::NoOwner)]
    #[case::foreign_kind(
        Some(owner_ref("apps/v1", "Deployment", "web", "uid")),
        OwnerResolution::Untracked { kind: "Deployment".to_owned() }
    )]
    #[case::foreign_group(
        Some(owner_ref("example.com/v1", "Login", "web", "uid")),
        OwnerResolution::Untracked { kind: "Login".to_owned() }
    )]
    #[case::allowlist(
        Some(owner_ref("api.g8s.io/v1alpha1", "Allowlist", "g8s-master", "uid")),
        OwnerResolution::Tracked(Owner::Allowlist(ObjectKey::new(None, "g8s-master")))
    )]
    fn owner_resolution(#[case] owner: Option<OwnerReference>, #[case] expected: OwnerResolution) {
        let (caches, _writers) = Caches::new();

        assert_eq!(caches.resolve_owner(&secret("payments", "login-db", owner)), expected);
    }

    #[test]
    fn lookups_read_the_store() {
        let (caches, mut writers) = Caches::new();
        seed(&mut writers.secrets, secret("payments", "login-db", None));
        seed(&mut writers.secrets, secret("billing", "login-db", None));

        assert!(get(&caches.secrets, Some("payments"), "login-db").is_some());
        assert!(get(&caches.secrets, Some("ci"), "login-db").is_none());

        let labels = BTreeMap::from([("owner".to_owned(), "g8s-master".to_owned())]);
        assert_eq!(list_matching(&caches.secrets, Some("billing"), &labels).len(), 1);
        assert_eq!(list_matching(&caches.secrets, None, &labels).len(), 2);
        assert!(
            list_matching(
                &caches.secrets,
                None,
                &BTreeMap::from([("owner".to_owned(), "someone".to_owned())])
            )
            .is_empty()
        );
    }

    #[tokio::test]
    async fn readiness_times_out_until_synced() {
        let (caches, mut writers) = Caches::new();

        assert!(matches!(
            caches.wait_until_ready(Duration::from_millis(10)).await,
            Err(CacheError::CacheSyncTimeout { kind: "Login", .. })
        ));

        mark_synced(&mut writers);
        caches.wait_until_ready(Duration::from_secs(1)).await.unwrap();
    }
}
