//! Wires caches and reconcilers into the running controller, and the
//! Allowlist cache into the webhook server.
//!
//! Every declared kind runs in its own [`Controller`]. A credential is
//! reconciled when it changes, when a secret it owns changes, or when its
//! ClusterRole changes. An Allowlist is reconciled when it or a secret it
//! mirrored changes, and whenever any Allowlist or namespace changes.
//!
//! ClusterRoles are cluster-scoped and Allowlists own secrets outside their
//! (absent) namespace, so both are mapped to their owner through
//! [`Caches::resolve_owner`] instead of [`Controller::owns`].
//!
//! Reads go through [`Caches`], fed by one watch task per kind.
use std::{error::Error as StdError, fmt::Debug, sync::Arc};

use futures::{
    FutureExt as _, StreamExt as _,
    future::{BoxFuture, Shared},
};
use k8s_openapi::api::{
    core::v1::{Namespace, Secret},
    rbac::v1::ClusterRole,
};
use kube::{
    Api, Client, Resource, ResourceExt as _,
    runtime::{
        Controller,
        controller::{self, Action},
        reflector::{self, ObjectRef, store::Writer},
        watcher,
    },
};
use serde::de::DeserializeOwned;
use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
};
use tracing::{debug, error, info};

use crate::{
    backoff::SharedRateLimiter,
    cache::{self, CacheError, CacheWriters, Caches, Change, ObjectKey, OwnerResolution},
    cli::RunArguments,
    client::{Cluster, KubeCluster},
    constants::{API_GROUP, APP_NAME},
    crd::{Allowlist, Login, SelfSignedTlsBundle, SshKeyPair},
    logging::controller::report_controller_reconciled,
    reconciler::{
        self, AllowlistReconciler, Context, CredentialReconciler, Declared, Reconcile, cleanup,
    },
    webhook::{self, WebhookState},
};

type Result<T, E = Error> = std::result::Result<T, E>;

/// Resolves once the process is asked to stop.
type Shutdown = Shared<BoxFuture<'static, ()>>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to sync caches"))]
    SyncCaches { source: CacheError },

    #[snafu(display("failed to register {signal} signal handler"))]
    RegisterSignalHandler {
        source: std::io::Error,
        signal: &'static str,
    },

    #[snafu(display("failed to serve admission webhooks"))]
    ServeWebhooks { source: webhook::Error },
}

/// Handed to every reconciliation of one kind.
struct Handler<R> {
    reconciler: R,
    backoff: SharedRateLimiter<ObjectKey>,
}

impl<R> Handler<R> {
    fn new(reconciler: R) -> Self {
        Self {
            reconciler,
            backoff: SharedRateLimiter::default(),
        }
    }
}

async fn reconcile<R: Reconcile>(
    resource: Arc<R::Resource>,
    handler: Arc<Handler<R>>,
) -> reconciler::Result<Action> {
    let key = ObjectKey::from_object(resource.as_ref());
    let outcome = handler.reconciler.reconcile(&resource).await?;
    handler.backoff.forget(&key);
    debug!(
        kind = %<R::Resource as Declared>::DECLARED_KIND,
        object = %key,
        ?outcome,
        "handler finished"
    );
    Ok(Action::await_change())
}

/// Retries a failed object once its backoff has passed.
fn error_policy<R: Reconcile>(
    resource: Arc<R::Resource>,
    _error: &reconciler::Error,
    handler: Arc<Handler<R>>,
) -> Action {
    let key = ObjectKey::from_object(resource.as_ref());
    let delay = handler.backoff.when(&key);
    debug!(
        object = %key,
        delay = %humantime::format_duration(delay),
        "scheduling retry"
    );
    Action::requeue(delay)
}

/// Maps `dependent` to the resource of kind `K` controlling it, if any.
fn owner_of<K, D>(caches: &Caches, dependent: &D) -> Option<ObjectRef<K>>
where
    K: Declared,
    D: Resource,
{
    match caches.resolve_owner(dependent) {
        OwnerResolution::Tracked(owner) if owner.kind() == K::DECLARED_KIND => {
            Some(owner.key().object_ref())
        }
        OwnerResolution::Orphaned { kind, name } if kind == K::DECLARED_KIND => {
            debug!(
                %kind,
                owner = %name,
                object = %dependent.name_any(),
                "owner is gone, ignoring change"
            );
            None
        }
        _ => None,
    }
}

fn every_allowlist(caches: &Caches) -> Vec<ObjectRef<Allowlist>> {
    caches
        .allowlist_keys()
        .iter()
        .map(|key| key.object_ref())
        .collect()
}

fn credential_controller<K>(client: &Client, caches: &Caches) -> Controller<K>
where
    K: Declared + DeserializeOwned + Debug,
{
    let caches = caches.clone();
    Controller::new(Api::<K>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Secret>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<ClusterRole>::all(client.clone()),
            watcher::Config::default(),
            move |role| owner_of::<K, _>(&caches, &role),
        )
}

fn allowlist_controller(client: &Client, caches: &Caches) -> Controller<Allowlist> {
    let (mirrors, namespaces, allowlists) = (caches.clone(), caches.clone(), caches.clone());
    Controller::new(
        Api::<Allowlist>::all(client.clone()),
        watcher::Config::default(),
    )
    .watches(
        Api::<Secret>::all(client.clone()),
        watcher::Config::default(),
        move |secret| owner_of::<Allowlist, _>(&mirrors, &secret),
    )
    .watches(
        Api::<Namespace>::all(client.clone()),
        watcher::Config::default(),
        move |_namespace| every_allowlist(&namespaces),
    )
    // Whatever a deleted Allowlist mirrored is collected by the remaining ones.
    .watches(
        Api::<Allowlist>::all(client.clone()),
        watcher::Config::default(),
        move |_allowlist| every_allowlist(&allowlists),
    )
}

/// Runs `controller` until `shutdown` resolves. In-flight reconciliations
/// finish first.
async fn run<R>(
    controller: Controller<R::Resource>,
    reconciler: R,
    cluster: Arc<dyn Cluster>,
    config: controller::Config,
    shutdown: Shutdown,
) where
    R: Reconcile,
    R::Resource: DeserializeOwned + Debug,
{
    let controller_name = format!(
        "{}.{API_GROUP}",
        <R::Resource as Declared>::DECLARED_KIND.prefix()
    );

    controller
        .with_config(config)
        .graceful_shutdown_on(shutdown)
        .run(
            reconcile::<R>,
            error_policy::<R>,
            Arc::new(Handler::new(reconciler)),
        )
        .for_each(|result| {
            let (cluster, controller_name) = (&cluster, &controller_name);
            async move {
                report_controller_reconciled(cluster.as_ref(), controller_name, &result).await;
            }
        })
        .await;
    debug!(controller.name = controller_name, "controller stopped");
}

/// Watches a credential kind. Deleting a credential triggers [`cleanup`].
fn watch_credential<K>(client: &Client, writer: Writer<K>, ctx: Arc<Context>) -> JoinHandle<()>
where
    K: Declared + DeserializeOwned + Debug,
{
    cache::spawn_watch(
        Api::<K>::all(client.clone()),
        watcher::Config::default(),
        writer,
        move |change| {
            let Change::Deleted(object) = change else {
                return;
            };
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let name = object.name_any();
                let reference = object.object_ref(&());
                if let Err(err) = cleanup(&ctx, K::DECLARED_KIND, &name, &reference).await {
                    error!(
                        kind = %K::DECLARED_KIND,
                        name,
                        error = &err as &dyn StdError,
                        "failed to clean up after deleted resource"
                    );
                }
            });
        },
    )
}

/// Spawns one watch task per cached kind.
fn spawn_watches(client: &Client, writers: CacheWriters, ctx: &Arc<Context>) -> Vec<JoinHandle<()>> {
    let CacheWriters {
        logins,
        ssh_key_pairs,
        tls_bundles,
        allowlists,
        secrets,
        cluster_roles,
        namespaces,
    } = writers;
    let config = watcher::Config::default;

    vec![
        watch_credential::<Login>(client, logins, ctx.clone()),
        watch_credential::<SshKeyPair>(client, ssh_key_pairs, ctx.clone()),
        watch_credential::<SelfSignedTlsBundle>(client, tls_bundles, ctx.clone()),
        cache::spawn_watch(Api::<Allowlist>::all(client.clone()), config(), allowlists, |_| {}),
        cache::spawn_watch(Api::<Secret>::all(client.clone()), config(), secrets, |_| {}),
        cache::spawn_watch(
            Api::<ClusterRole>::all(client.clone()),
            config(),
            cluster_roles,
            |_| {},
        ),
        cache::spawn_watch(Api::<Namespace>::all(client.clone()), config(), namespaces, |_| {}),
    ]
}

/// Registers the SIGINT and SIGTERM handlers and returns a future resolving
/// on the first of either.
fn shutdown_signal() -> Result<Shutdown> {
    let mut sigint = signal(SignalKind::interrupt()).context(RegisterSignalHandlerSnafu {
        signal: "SIGINT",
    })?;
    let mut sigterm = signal(SignalKind::terminate()).context(RegisterSignalHandlerSnafu {
        signal: "SIGTERM",
    })?;

    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    .boxed()
    .shared())
}

/// Runs the controller until SIGINT or SIGTERM.
///
/// Reconciliations in progress finish before the process exits.
pub async fn run_controller(client: Client, args: &RunArguments) -> Result<()> {
    let shutdown = shutdown_signal()?;
    let (caches, writers) = Caches::new();
    let cluster: Arc<dyn Cluster> = Arc::new(KubeCluster::new(client.clone(), APP_NAME));
    let ctx = Arc::new(Context {
        caches: caches.clone(),
        cluster: cluster.clone(),
        namespace: args.namespace.clone(),
    });
    let watches = spawn_watches(&client, writers, &ctx);

    info!(
        timeout = %humantime::format_duration(args.cache_sync_timeout),
        "waiting for caches to sync"
    );
    if let Err(err) = caches.wait_until_ready(args.cache_sync_timeout).await {
        watches.iter().for_each(JoinHandle::abort);
        return Err(err).context(SyncCachesSnafu);
    }

    let config = controller::Config::default().concurrency(args.workers);
    info!(workers = args.workers, "controller started");
    tokio::join!(
        run(
            credential_controller::<Login>(&client, &caches),
            CredentialReconciler::<Login>::new(ctx.clone()),
            cluster.clone(),
            config.clone(),
            shutdown.clone(),
        ),
        run(
            credential_controller::<SshKeyPair>(&client, &caches),
            CredentialReconciler::<SshKeyPair>::new(ctx.clone()),
            cluster.clone(),
            config.clone(),
            shutdown.clone(),
        ),
        run(
            credential_controller::<SelfSignedTlsBundle>(&client, &caches),
            CredentialReconciler::<SelfSignedTlsBundle>::new(ctx.clone()),
            cluster.clone(),
            config.clone(),
            shutdown.clone(),
        ),
        run(
            allowlist_controller(&client, &caches),
            AllowlistReconciler::new(ctx.clone()),
            cluster,
            config,
            shutdown,
        ),
    );

    watches.iter().for_each(JoinHandle::abort);
    Ok(())
}

/// Serves the admission webhooks until SIGINT or SIGTERM.
pub async fn run_webhook(client: Client, args: &RunArguments) -> Result<()> {
    let (allowlists, writer) = reflector::store::<Allowlist>();
    let watch = cache::spawn_watch(
        Api::<Allowlist>::all(client),
        watcher::Config::default(),
        writer,
        |_change| {},
    );

    let result = serve_webhook(allowlists, args).await;
    watch.abort();
    result
}

async fn serve_webhook(
    allowlists: reflector::Store<Allowlist>,
    args: &RunArguments,
) -> Result<()> {
    cache::wait_for_store(&allowlists, "Allowlist", args.cache_sync_timeout)
        .await
        .context(SyncCachesSnafu)?;

    let state = WebhookState {
        allowlists,
        reserved_namespace: args.namespace.clone(),
    };
    webhook::serve(args.webhook_options(), state)
        .await
        .context(ServeWebhooksSnafu)
}
