//! Admission handlers served by the webhook role.
//!
//! * `POST /mutate` injects credentials into pods, driven by the
//!   `g8s-master` [`Allowlist`].
//! * `POST /validate` rejects Allowlists which target the controller's own
//!   namespace or carry malformed selectors.
use std::sync::Arc;

use g8s_webhook::{WebhookOptions, WebhookServer, servers::AdmissionWebhook};
use kube::runtime::reflector::Store;
use snafu::{ResultExt, Snafu};

use crate::{
    constants::{
        AUDIT_ERROR_KEY, AUDIT_MUTATION_ERROR, AUDIT_VALIDATION_ERROR, MUTATE_PATH, VALIDATE_PATH,
    },
    crd::Allowlist,
};

pub mod mutate;
pub mod validate;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create webhook server"))]
    CreateServer { source: g8s_webhook::WebhookError },

    #[snafu(display("failed to run webhook server"))]
    RunServer { source: g8s_webhook::WebhookError },
}

/// Read-only state shared by every admission request.
pub struct WebhookState {
    pub allowlists: Store<Allowlist>,

    /// Namespace no Allowlist may target.
    pub reserved_namespace: String,
}

/// Serves both admission routes until SIGINT or SIGTERM.
pub async fn serve(options: WebhookOptions, state: WebhookState) -> Result<(), Error> {
    let state = Arc::new(state);
    let mutate = AdmissionWebhook::new(MUTATE_PATH, mutate::mutate, state.clone())
        .with_error_annotation(AUDIT_ERROR_KEY, AUDIT_MUTATION_ERROR);
    let validate = AdmissionWebhook::new(VALIDATE_PATH, validate::validate, state)
        .with_error_annotation(AUDIT_ERROR_KEY, AUDIT_VALIDATION_ERROR);

    tracing::info!(address = %options.socket_addr, "starting admission webhooks");
    WebhookServer::new(options, vec![Box::new(mutate), Box::new(validate)])
        .context(CreateServerSnafu)?
        .run()
        .await
        .context(RunServerSnafu)
}

#[cfg(test)]
pub(crate) mod test_support {
    use kube::core::admission::{AdmissionRequest, AdmissionReview};
    use serde::de::DeserializeOwned;

    /// Wraps `object` into a CREATE admission request for `kind`.
    pub fn create_request<R>(
        kind: &str,
        resource: &str,
        object: &serde_json::Value,
    ) -> AdmissionRequest<R>
    where
        R: kube::Resource + DeserializeOwned + Clone,
    {
        let name = object["metadata"]["name"].clone();
        let review: AdmissionReview<R> = serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "0df28fbd-5f5f-4a1e-9c3b-6c5e4e0a6c7f",
                "kind": {"group": "", "version": "v1", "kind": kind},
                "resource": {"group": "", "version": "v1", "resource": resource},
                "name": name,
                "operation": "CREATE",
                "userInfo": {"username": "admin"},
                "object": object,
                "dryRun": false
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }
}
