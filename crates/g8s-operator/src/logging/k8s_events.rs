//! Utilities for publishing Kubernetes events
use std::error::Error;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::{
    controller,
    events::{Event, EventType},
};

use super::controller::ReconcilerError;
use crate::client::Cluster;

const MAX_NOTE_LENGTH: usize = 1024;

/// Converts an [`Error`] into a publishable Kubernetes [`Event`]
fn error_to_event<E: ReconcilerError>(err: &E) -> Event {
    // Walk the whole error chain, so that we get all the full reason for the error
    let mut full_msg = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        full_msg.push_str(": ");
        full_msg.push_str(&err.to_string());
        source = err.source();
    }
    message::truncate_with_ellipsis(&mut full_msg, MAX_NOTE_LENGTH);

    Event {
        type_: EventType::Warning,
        reason: err.category().to_owned(),
        note: Some(full_msg),
        action: "Reconcile".to_owned(),
        secondary: err.secondary_object(),
    }
}

/// Reports an error coming from a controller to Kubernetes
///
/// This is intended to be executed on the log entries returned by [`kube::runtime::Controller::run`]
#[tracing::instrument(skip_all)]
pub async fn publish_controller_error_as_k8s_event<ReconcileErr, QueueErr>(
    cluster: &dyn Cluster,
    controller_error: &controller::Error<ReconcileErr, QueueErr>,
) where
    ReconcileErr: ReconcilerError,
    QueueErr: Error,
{
    let (error, obj) = match controller_error {
        controller::Error::ReconcilerFailed(err, obj) => (err, obj),
        // Other error types are intended for the operator administrator, and aren't linked to a specific object
        _ => return,
    };
    let object = ObjectReference::from(obj.clone());
    cluster.publish_event(&object, &error_to_event(error)).await;
}

mod message {
    /// Ensures that `msg` is at most `max_len` _bytes_ long
    ///
    /// If `msg` is longer than `max_len` then the extra text is replaced with an ellipsis.
    pub fn truncate_with_ellipsis(msg: &mut String, max_len: usize) {
        const ELLIPSIS: char = '…';
        const ELLIPSIS_LEN: usize = ELLIPSIS.len_utf8();

        if msg.len() > max_len {
            let start_of_trunc_char = find_start_of_char(msg, max_len.saturating_sub(ELLIPSIS_LEN));
            msg.truncate(start_of_trunc_char);
            if ELLIPSIS_LEN <= max_len {
                msg.push(ELLIPSIS);
            }
        }
        debug_assert!(msg.len() <= max_len);
    }

    pub(super) fn find_start_of_char(s: &str, pos: usize) -> usize {
        (0..=pos)
            .rev()
            .find(|pos| s.is_char_boundary(*pos))
            .unwrap_or_default()
    }

}

#[cfg(test)]
mod tests {
    use snafu::Snafu;
    use strum::EnumDiscriminants;

    use super::*;

    #[derive(Snafu, Debug, EnumDiscriminants)]
    #[strum_discriminants(derive(strum::IntoStaticStr))]
    enum SyncError {
        #[snafu(display("failed to sync secret"))]
        WriteSecret { source: ApiError },
    }

    #[derive(Snafu, Debug)]
    enum ApiError {
        #[snafu(display("request rejected"))]
        Rejected { source: QuotaError },
    }

    #[derive(Snafu, Debug)]
    #[snafu(display("quota exceeded for {name}"))]
    struct QuotaError {
        name: String,
    }

    impl ReconcilerError for SyncError {
        fn category(&self) -> &'static str {
            SyncErrorDiscriminants::from(self).into()
        }

        fn secondary_object(&self) -> Option<ObjectReference> {
            Some(ObjectReference {
                kind: Some("Secret".to_owned()),
                name: Some("login-db".to_owned()),
                ..ObjectReference::default()
            })
        }
    }

    fn error() -> SyncError {
        SyncError::WriteSecret {
            source: ApiError::Rejected {
                source: QuotaError {
                    name: "secrets".to_owned(),
                },
            },
        }
    }

    #[test]
    fn event_reports_full_nested_message() {
        assert_eq!(
            error_to_event(&error()).note.as_deref(),
            Some("failed to sync secret: request rejected: quota exceeded for secrets")
        );
    }

    #[test]
    fn event_includes_reason_and_secondary_object() {
        let event = error_to_event(&error());

        assert_eq!(event.reason, "WriteSecret");
        assert!(matches!(event.type_, EventType::Warning));
        assert_eq!(event.secondary.unwrap().name.as_deref(), Some("login-db"));
    }
}
