use std::{fmt::Debug, marker::PhantomData, sync::Arc};

use axum::{Json, Router, body::Bytes, routing::post};
use kube::{
    Resource,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use serde::{Serialize, de::DeserializeOwned};

use super::Webhook;

/// An admission webhook (mutating or validating) serving a single route.
///
/// The webhook is typed with the resource type `R`, so it can only handle
/// requests for a single resource kind. Register multiple webhooks to handle
/// more kinds.
///
/// Request bodies which cannot be decoded into an [`AdmissionRequest<R>`]
/// are answered with an [`AdmissionResponse::invalid`] response, which
/// denies the request. The optional error annotation is attached to such
/// responses as an audit annotation.
///
/// ```
/// use std::sync::Arc;
///
/// use g8s_webhook::servers::AdmissionWebhook;
/// use k8s_openapi::api::core::v1::Pod;
/// use kube::core::admission::{AdmissionRequest, AdmissionResponse};
///
/// async fn allow_everything(_state: Arc<()>, request: AdmissionRequest<Pod>) -> AdmissionResponse {
///     AdmissionResponse::from(&request)
/// }
///
/// let webhook: AdmissionWebhook<_, (), Pod> = AdmissionWebhook::new("/mutate", allow_everything, Arc::new(()));
/// ```
pub struct AdmissionWebhook<H, S, R> {
    path: String,
    handler: H,
    handler_state: Arc<S>,
    error_annotation: Option<(String, String)>,
    _resource: PhantomData<fn() -> R>,
}

impl<H, S, R> AdmissionWebhook<H, S, R> {
    pub fn new(path: impl Into<String>, handler: H, handler_state: Arc<S>) -> Self {
        Self {
            path: path.into(),
            handler,
            handler_state,
            error_annotation: None,
            _resource: PhantomData,
        }
    }

    /// Sets the audit annotation attached to responses for requests which
    /// could not be decoded.
    pub fn with_error_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.error_annotation = Some((key.into(), value.into()));
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<H, S, R> Debug for AdmissionWebhook<H, S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionWebhook")
            .field("path", &self.path)
            .field("error_annotation", &self.error_annotation)
            .finish_non_exhaustive()
    }
}

impl<H, S, R, Fut> Webhook for AdmissionWebhook<H, S, R>
where
    H: Fn(Arc<S>, AdmissionRequest<R>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = AdmissionResponse> + Send + 'static,
    R: Resource + Send + Sync + DeserializeOwned + Serialize + Clone + 'static,
    S: Send + Sync + 'static,
{
    fn register_routes(&self, router: Router) -> Router {
        let handler_state = self.handler_state.clone();
        let handler = self.handler.clone();
        let error_annotation = self.error_annotation.clone();

        let handler_fn = |body: Bytes| async move {
            let request = match decode_request::<R>(&body) {
                Ok(request) => request,
                Err(message) => {
                    tracing::warn!(%message, "rejecting undecodable admission review");
                    let mut response = AdmissionResponse::invalid(message);
                    if let Some((key, value)) = error_annotation {
                        response.audit_annotations.insert(key, value);
                    }
                    return Json(response.into_review());
                }
            };

            tracing::debug!(
                uid = %request.uid,
                operation = ?request.operation,
                name = %request.name,
                namespace = ?request.namespace,
                "handling admission request"
            );
            let response = handler(handler_state, request).await;
            Json(response.into_review())
        };

        router.route(&self.path, post(handler_fn))
    }
}

fn decode_request<R>(body: &[u8]) -> Result<AdmissionRequest<R>, String>
where
    R: Resource + DeserializeOwned + Clone,
{
    let review: AdmissionReview<R> = serde_json::from_slice(body)
        .map_err(|err| format!("failed to decode admission review: {err}"))?;
    review
        .try_into()
        .map_err(|err| format!("failed to convert to request: {err}"))
}

