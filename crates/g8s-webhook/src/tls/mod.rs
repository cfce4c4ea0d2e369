//! This module contains structs and functions to easily create a TLS termination
//! server, which can be used in combination with an Axum [`Router`].
use std::{net::SocketAddr, sync::Arc};

use axum::{Router, extract::Request};
use futures_util::pin_mut;
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use snafu::{ResultExt, Snafu};
use tokio::net::TcpListener;
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        crypto::ring::default_provider,
        version::{TLS12, TLS13},
    },
};
use tower::{Service, ServiceExt};
use tracing::{Instrument, instrument};

use crate::options::TlsOptions;

mod certs;
pub use certs::*;

pub type Result<T, E = TlsServerError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum TlsServerError {
    #[snafu(display("failed to read TLS certificate chain"))]
    ReadCertificateChain { source: CertificateError },

    #[snafu(display("failed to set safe TLS protocol versions"))]
    SetSafeTlsProtocolVersions { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to construct TLS server config, bad certificate/key"))]
    InvalidTlsPrivateKey { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to create TCP listener by binding to socket address {socket_addr:?}"))]
    BindTcpListener {
        source: std::io::Error,
        socket_addr: SocketAddr,
    },
}

/// A server which terminates TLS connections and allows clients to communicate
/// via HTTPS with the underlying HTTP router.
pub struct TlsServer {
    config: Arc<ServerConfig>,
    socket_addr: SocketAddr,
    router: Router,
}

impl TlsServer {
    #[instrument(name = "create_tls_server", skip(router))]
    pub fn new(socket_addr: SocketAddr, router: Router, tls: &TlsOptions) -> Result<Self> {
        let (chain, private_key) =
            CertificateChain::from_files(&tls.certificate_path, &tls.private_key_path)
                .context(ReadCertificateChainSnafu)?
                .into_parts();

        let tls_provider = default_provider();
        let mut config = ServerConfig::builder_with_provider(tls_provider.into())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .context(SetSafeTlsProtocolVersionsSnafu)?
            .with_no_client_auth()
            .with_single_cert(chain, private_key)
            .context(InvalidTlsPrivateKeySnafu)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self {
            config: Arc::new(config),
            socket_addr,
            router,
        })
    }

    /// Runs the TLS server by listening for incoming TCP connections on the
    /// bound socket address. It only accepts TLS connections. Internally each
    /// TLS stream get handled by a Hyper service, which in turn is an Axum
    /// router.
    pub async fn run(self) -> Result<()> {
        let tls_acceptor = TlsAcceptor::from(self.config);
        let tcp_listener =
            TcpListener::bind(self.socket_addr)
                .await
                .context(BindTcpListenerSnafu {
                    socket_addr: self.socket_addr,
                })?;

        tracing::info!(socket_addr = %self.socket_addr, "webhook server listening");

        // Turning the router into a make-service with connect info lets
        // handlers extract the remote address of the connection.
        let mut router = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        pin_mut!(tcp_listener);
        loop {
            let tls_acceptor = tls_acceptor.clone();

            // Wait for new tcp connection
            let (tcp_stream, remote_addr) = match tcp_listener.accept().await {
                Ok((stream, addr)) => (stream, addr),
                Err(err) => {
                    tracing::trace!(%err, "failed to accept incoming TCP connection");
                    continue;
                }
            };

            let tower_service = router
                .call(remote_addr)
                .await
                .unwrap_or_else(|infallible| match infallible {});

            let span = tracing::debug_span!("accept tcp connection", %remote_addr);
            tokio::spawn(
                async move {
                    // Wait for tls handshake to happen
                    let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(err) => {
                            tracing::trace!(%err, "error during tls handshake connection");
                            return;
                        }
                    };

                    // Hyper has its own `AsyncRead` and `AsyncWrite` traits and doesn't use tokio.
                    // `TokioIo` converts between them.
                    let tls_stream = TokioIo::new(tls_stream);

                    // Hyper also has its own `Service` trait and doesn't use tower. We can use
                    // `hyper::service::service_fn` to create a hyper `Service` that calls our app through
                    // `tower::Service::call`.
                    let hyper_service = service_fn(move |request: Request<Incoming>| {
                        // We need to clone here, because oneshot consumes self
                        tower_service.clone().oneshot(request)
                    });

                    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(tls_stream, hyper_service)
                        .await
                        .unwrap_or_else(|err| {
                            tracing::warn!(%err, "failed to serve connection");
                        });
                }
                .instrument(span),
            );
        }
    }
}
