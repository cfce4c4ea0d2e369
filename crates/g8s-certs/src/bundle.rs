//! Self-signed TLS bundles: a fresh CA plus a server certificate signed by
//! it, handed out as PEM documents.
use rand::Rng as _;
use snafu::{ResultExt, Snafu};
use tracing::instrument;

use crate::{
    CertificatePair, CertificatePairError, CreateCertificateError,
    ca::{CertificateAuthority, CreateCertificateAuthorityError, SUBJECT_ORGANIZATION},
    keys::ecdsa,
};

/// Largest serial number handed out, keeping `serial + 1` within a signed
/// 63-bit integer.
const MAX_SERIAL_NUMBER: u64 = i64::MAX.unsigned_abs() - 1;

pub type Result<T, E = BundleError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum BundleError {
    #[snafu(display("failed to create certificate authority for {app_name:?}"))]
    CreateCertificateAuthority {
        source: CreateCertificateAuthorityError<ecdsa::Error>,
        app_name: String,
    },

    #[snafu(display("failed to create leaf certificate for {app_name:?}"))]
    CreateLeafCertificate {
        source: CreateCertificateError<ecdsa::Error>,
        app_name: String,
    },

    #[snafu(display("failed to encode bundle as PEM"))]
    EncodePem {
        source: CertificatePairError<ecdsa::Error>,
    },
}

/// The PEM-encoded output of [`SelfSignedBundle::generate`].
#[derive(Clone, PartialEq, Eq)]
pub struct SelfSignedBundle {
    /// SEC1 `EC PRIVATE KEY` of the leaf certificate.
    pub key_pem: String,

    /// The leaf certificate.
    pub cert_pem: String,

    /// The self-signed CA certificate which signed the leaf.
    pub ca_cert_pem: String,
}

impl std::fmt::Debug for SelfSignedBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedBundle")
            .field("key_pem", &"<redacted>")
            .field("cert_pem", &self.cert_pem)
            .field("ca_cert_pem", &self.ca_cert_pem)
            .finish()
    }
}

impl SelfSignedBundle {
    /// Generates a fresh P-256 CA and a P-256 server certificate signed by it.
    ///
    /// Both certificates carry the subject `CN=<app_name>,O=g8s` and the given
    /// DNS names as subject alternative names, and share the same 365 day
    /// validity window. The leaf serial number is the CA serial number plus
    /// one.
    #[instrument(name = "generate_self_signed_bundle", skip(subject_alternative_dns_names))]
    pub fn generate(app_name: &str, subject_alternative_dns_names: &[String]) -> Result<Self> {
        let subject = subject_for(app_name);
        let ca_serial_number = random_serial_number();

        let ca = CertificateAuthority::builder_with_ecdsa()
            .subject(&subject)
            .subject_alternative_dns_names(subject_alternative_dns_names)
            .serial_number(ca_serial_number)
            .build()
            .context(CreateCertificateAuthoritySnafu { app_name })?;

        let leaf = CertificatePair::builder()
            .subject(&subject)
            .subject_alternative_dns_names(subject_alternative_dns_names)
            .validity_window(ca.ca_cert().tbs_certificate.validity)
            .serial_number(ca_serial_number + 1)
            .signed_by(&ca)
            .build()
            .context(CreateLeafCertificateSnafu { app_name })?;

        Ok(Self {
            key_pem: leaf.private_key_pem().context(EncodePemSnafu)?,
            cert_pem: leaf.certificate_pem().context(EncodePemSnafu)?,
            ca_cert_pem: ca.certificate_pair().certificate_pem().context(EncodePemSnafu)?,
        })
    }
}

/// Returns a random serial number in `[1, i64::MAX - 1]`.
pub fn random_serial_number() -> u64 {
    rand::rng().random_range(1..=MAX_SERIAL_NUMBER)
}

/// Builds the RFC 4514 subject for an application name, escaping the
/// characters that carry meaning in distinguished names.
fn subject_for(app_name: &str) -> String {
    if app_name.is_empty() {
        return format!("O={SUBJECT_ORGANIZATION}");
    }

    let mut escaped = String::with_capacity(app_name.len());
    for (index, c) in app_name.chars().enumerate() {
        let leading_special = index == 0 && (c == ' ' || c == '#');
        if leading_special || matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    format!("CN={escaped},O={SUBJECT_ORGANIZATION}")
}
