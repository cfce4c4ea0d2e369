//! Contains available options to configure the [WebhookServer][crate::WebhookServer].
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use crate::constants::{
    DEFAULT_CERTIFICATE_PATH, DEFAULT_PRIVATE_KEY_PATH, DEFAULT_SOCKET_ADDRESS,
};

/// Specifies available webhook server options.
///
/// The [`Default`] implementation for this struct contains the following values:
///
/// - The socket binds to 0.0.0.0 on port 8443 (HTTPS)
/// - The certificate chain and private key are read from
///   `/etc/g8s/tls/tls.crt` and `/etc/g8s/tls/tls.key`
///
/// ### Example with Custom HTTPS IP Address and Port
///
/// ```
/// use g8s_webhook::WebhookOptions;
///
/// // Set IP address and port at the same time
/// let options = WebhookOptions::builder()
///     .bind_address([0, 0, 0, 0], 12345)
///     .build();
///
/// // Set port only
/// let options = WebhookOptions::builder()
///     .bind_port(12345)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct WebhookOptions {
    /// The HTTPS socket address the [`TcpListener`][tokio::net::TcpListener]
    /// binds to.
    pub socket_addr: SocketAddr,

    /// Where the TLS material is mounted.
    pub tls: TlsOptions,
}

/// Paths of the provisioned certificate/key file pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// PEM file containing the certificate chain, leaf first.
    pub certificate_path: PathBuf,

    /// PEM file containing the private key (PKCS#8, SEC1 or PKCS#1).
    pub private_key_path: PathBuf,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            certificate_path: DEFAULT_CERTIFICATE_PATH.into(),
            private_key_path: DEFAULT_PRIVATE_KEY_PATH.into(),
        }
    }
}

impl Default for WebhookOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl WebhookOptions {
    /// Returns the default [`WebhookOptionsBuilder`] which allows to selectively
    /// customize the options. See the documentation for [`WebhookOptions`] for more
    /// information on available functions.
    pub fn builder() -> WebhookOptionsBuilder {
        WebhookOptionsBuilder::default()
    }
}

/// The [`WebhookOptionsBuilder`] which allows to selectively customize the webhook
/// server [`WebhookOptions`].
///
/// Usually, this struct is not constructed manually, but instead by calling
/// [`WebhookOptions::builder()`] or [`WebhookOptionsBuilder::default()`].
#[derive(Debug, Default)]
pub struct WebhookOptionsBuilder {
    socket_addr: Option<SocketAddr>,
    tls: Option<TlsOptions>,
}

impl WebhookOptionsBuilder {
    /// Sets the socket address the webhook server uses to bind for HTTPS.
    pub fn bind_address(mut self, bind_ip: impl Into<IpAddr>, bind_port: u16) -> Self {
        self.socket_addr = Some(SocketAddr::new(bind_ip.into(), bind_port));
        self
    }

    /// Sets the complete socket address at once.
    pub fn socket_addr(mut self, socket_addr: SocketAddr) -> Self {
        self.socket_addr = Some(socket_addr);
        self
    }

    /// Sets the port of the socket address the webhook server uses to bind
    /// for HTTPS.
    pub fn bind_port(mut self, bind_port: u16) -> Self {
        let addr = self.socket_addr.get_or_insert(DEFAULT_SOCKET_ADDRESS);
        addr.set_port(bind_port);
        self
    }

    /// Sets the paths of the mounted certificate chain and private key.
    pub fn tls_mount(
        mut self,
        certificate_path: impl Into<PathBuf>,
        private_key_path: impl Into<PathBuf>,
    ) -> Self {
        self.tls = Some(TlsOptions {
            certificate_path: certificate_path.into(),
            private_key_path: private_key_path.into(),
        });
        self
    }

    /// Builds the final [`WebhookOptions`] by using default values for any not
    /// explicitly set option.
    pub fn build(self) -> WebhookOptions {
        WebhookOptions {
            socket_addr: self.socket_addr.unwrap_or(DEFAULT_SOCKET_ADDRESS),
            tls: self.tls.unwrap_or_default(),
        }
    }
}
