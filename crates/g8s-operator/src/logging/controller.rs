//! Facilities for reporting reconciliation outcomes
//!
//! The primary entry point is [`report_controller_reconciled`].
use std::error::Error;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    Resource,
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
    },
};

use crate::{client::Cluster, logging::k8s_events::publish_controller_error_as_k8s_event};

/// [`Error`] extensions that help report reconciliation errors
///
/// This should be implemented for reconciler error types.
pub trait ReconcilerError: Error {
    /// `PascalCase`d name for the error category
    ///
    /// This can typically be implemented by delegating to [`strum::EnumDiscriminants`] and [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;

    /// A reference to a secondary object providing additional context, if any
    ///
    /// This should be [`Some`] if the error happens while evaluating some related object
    /// (for example: a backend secret owned by someone else).
    fn secondary_object(&self) -> Option<ObjectReference> {
        None
    }
}

/// Reports the result of reconciliation.
///
/// This is intended for use with the results of [`Controller::run`](kube::runtime::Controller::run).
///
/// Currently this means that the result is reported to:
/// * The current [`tracing::Subscriber`], typically at least stdout
/// * Kubernetes events on the reconciled object, if there is an error that is relevant to the end user
pub async fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    cluster: &dyn Cluster,
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, QueueErr>>,
) where
    K: Resource,
    ReconcileErr: ReconcilerError,
    QueueErr: Error,
{
    match result {
        Ok((object, _)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %object,
                "Reconciled object"
            );
        }
        Err(error) => {
            tracing::error!(
                controller.name = controller_name,
                error = error as &dyn Error,
                "Failed to reconcile object",
            );
            publish_controller_error_as_k8s_event(cluster, error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::Secret;
    use kube::runtime::watcher;
    use snafu::Snafu;

    use super::*;
    use crate::client::fake::FakeCluster;

    #[derive(Debug, Snafu)]
    #[snafu(display("backend secret is missing"))]
    struct MissingSecret;

    impl ReconcilerError for MissingSecret {
        fn category(&self) -> &'static str {
            "MissingSecret"
        }
    }

    type ControllerResult =
        Result<(ObjectRef<Secret>, Action), controller::Error<MissingSecret, watcher::Error>>;

    #[tokio::test]
    async fn failures_are_published_on_the_object() {
        let cluster = Arc::new(FakeCluster::default());
        let result: ControllerResult = Err(controller::Error::ReconcilerFailed(
            MissingSecret,
            ObjectRef::<Secret>::new("login-db").within("g8s").erase(),
        ));

        report_controller_reconciled(cluster.as_ref(), "login.api.g8s.io", &result).await;

        let events = cluster.take_events();
        assert_eq!(events.len(), 1);
        assert!(events[0].warning);
        assert_eq!(events[0].reason, "MissingSecret");
        assert_eq!(events[0].name.as_deref(), Some("login-db"));
    }

    #[tokio::test]
    async fn successes_publish_nothing() {
        let cluster = Arc::new(FakeCluster::default());
        let result: ControllerResult =
            Ok((ObjectRef::new("login-db").within("g8s"), Action::await_change()));

        report_controller_reconciled(cluster.as_ref(), "login.api.g8s.io", &result).await;

        assert!(cluster.take_events().is_empty());
    }
}
