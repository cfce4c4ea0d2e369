//! Utility types and functions to run the g8s admission webhooks over HTTPS.
//! The server terminates TLS itself, using a certificate chain and private key
//! mounted into the pod, and routes requests to registered [`Webhook`]s.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use g8s_webhook::{WebhookOptions, WebhookServer, servers::AdmissionWebhook};
//! use k8s_openapi::api::core::v1::Pod;
//! use kube::core::admission::{AdmissionRequest, AdmissionResponse};
//!
//! async fn mutate(_state: Arc<()>, request: AdmissionRequest<Pod>) -> AdmissionResponse {
//!     AdmissionResponse::from(&request)
//! }
//!
//! # async fn docs() {
//! let webhook = AdmissionWebhook::new("/mutate", mutate, Arc::new(()));
//! let server = WebhookServer::new(WebhookOptions::default(), vec![Box::new(webhook)]).unwrap();
//! server.run().await.unwrap();
//! # }
//! ```
use axum::{Router, http::StatusCode, routing::get};
use futures_util::{FutureExt as _, pin_mut, select};
use snafu::{ResultExt, Snafu};
use tokio::signal::unix::{SignalKind, signal};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::tls::TlsServer;

pub mod constants;
pub mod options;
pub mod servers;
pub mod tls;

// Selected re-exports
pub use crate::{options::WebhookOptions, servers::Webhook};

/// A result type alias with the [`WebhookError`] type as the default error type.
pub type Result<T, E = WebhookError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum WebhookError {
    #[snafu(display("failed to create TLS server"))]
    CreateTlsServer { source: tls::TlsServerError },

    #[snafu(display("failed to run TLS server"))]
    RunTlsServer { source: tls::TlsServerError },

    #[snafu(display("failed to register {signal} signal handler"))]
    RegisterSignalHandler {
        source: std::io::Error,
        signal: &'static str,
    },
}

/// A ready-to-use webhook server.
///
/// This server abstracts away lower-level details like TLS termination and
/// request tracing. The routes and their handlers are contributed by the
/// registered [`Webhook`]s.
pub struct WebhookServer {
    tls_server: TlsServer,
}

impl WebhookServer {
    /// Creates a new ready-to-use webhook server.
    ///
    /// The TLS certificate chain and key are read from the paths in
    /// [`WebhookOptions::tls`] right away, so a missing or broken mount fails
    /// here rather than on the first connection.
    pub fn new(options: WebhookOptions, webhooks: Vec<Box<dyn Webhook>>) -> Result<Self> {
        tracing::trace!("create new webhook server");

        let router = router(&webhooks);

        tracing::debug!("create TLS server");
        let tls_server = TlsServer::new(options.socket_addr, router, &options.tls)
            .context(CreateTlsServerSnafu)?;

        Ok(Self { tls_server })
    }

    /// Runs the webhook server until SIGINT or SIGTERM is received.
    ///
    /// This does not implement graceful shutdown of the underlying server.
    pub async fn run(self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt()).context(RegisterSignalHandlerSnafu {
            signal: "SIGINT",
        })?;
        let mut sigterm = signal(SignalKind::terminate()).context(RegisterSignalHandlerSnafu {
            signal: "SIGTERM",
        })?;
        tracing::debug!("created unix signal handlers");

        let future_server = self.run_server().fuse();
        let future_signal = async {
            select! {
                _ = sigint.recv().fuse() => tracing::info!("received SIGINT, shutting down"),
                _ = sigterm.recv().fuse() => tracing::info!("received SIGTERM, shutting down"),
            }
        }
        .fuse();

        pin_mut!(future_server);
        pin_mut!(future_signal);

        select! {
            result = future_server => result,
            () = future_signal => Ok(()),
        }
    }

    async fn run_server(self) -> Result<()> {
        tracing::debug!("run webhook server");

        self.tls_server.run().await.context(RunTlsServerSnafu)
    }
}

/// Builds the HTTP router: every webhook's routes behind a trace layer, the
/// uninstrumented `/health` route, and a 404 fallback for everything else.
fn router(webhooks: &[Box<dyn Webhook>]) -> Router {
    let router = webhooks
        .iter()
        .fold(Router::new(), |router, webhook| webhook.register_routes(router));

    let service_builder = ServiceBuilder::new().layer(TraceLayer::new_for_http());

    router
        .layer(service_builder)
        .route("/health", get(|| async { "ok" }))
        .fallback(|| async { StatusCode::NOT_FOUND })
}
