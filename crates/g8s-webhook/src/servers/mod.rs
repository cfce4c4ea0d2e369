//! Ready-to-use webhook implementations which can be registered with a
//! [`WebhookServer`][crate::WebhookServer].
use axum::Router;

pub use admission::AdmissionWebhook;

mod admission;

/// A webhook which contributes one or more routes to the HTTPS router of the
/// [`WebhookServer`][crate::WebhookServer].
pub trait Webhook: Send + Sync {
    fn register_routes(&self, router: Router) -> Router;
}
