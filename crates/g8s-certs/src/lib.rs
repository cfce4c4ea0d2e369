//! This crate provides types, traits and functions to work with X.509 TLS
//! certificates. It is used by g8s to produce self-signed TLS bundles: a
//! certificate authority (CA) and a leaf certificate signed by that CA, both
//! bound to freshly generated ECDSA P-256 keys.
//!
//! Most users only need [`SelfSignedBundle::generate`], which returns the
//! PEM-encoded leaf key, leaf certificate and CA certificate. The lower-level
//! [`ca::CertificateAuthority`] and [`CertificateBuilder`] types are exposed
//! for callers which need more control.
//!
//! ## References
//!
//! - <https://datatracker.ietf.org/doc/html/rfc5280>
//! - <https://datatracker.ietf.org/doc/html/rfc5915>
use snafu::{ResultExt, Snafu};
use x509_cert::{
    Certificate,
    der::{EncodePem, pem::LineEnding},
    spki::EncodePublicKey,
};

use crate::keys::CertificateKeypair;

pub mod bundle;
pub mod ca;
pub mod keys;

mod cert_builder;

pub use bundle::{BundleError, SelfSignedBundle};
pub use cert_builder::{CertificateBuilder, CertificateBuilderBuilder, CreateCertificateError};

/// The line ending used for every PEM document this crate produces.
pub const PEM_LINE_ENDING: LineEnding = LineEnding::LF;

/// Error variants which can be encountered when encoding a
/// [`CertificatePair`].
#[derive(Debug, Snafu)]
pub enum CertificatePairError<E>
where
    E: std::error::Error + 'static,
{
    #[snafu(display("failed to serialize certificate as {key_encoding}"))]
    SerializeCertificate {
        source: x509_cert::der::Error,
        key_encoding: KeyEncoding,
    },

    #[snafu(display("failed to serialize private key as {key_encoding}"))]
    SerializePrivateKey { source: E, key_encoding: KeyEncoding },
}

/// Contains the certificate and the signing / embedded key pair.
///
/// A [`CertificateAuthority`](crate::ca::CertificateAuthority) uses this struct
/// internally to store the signing key pair which is used to sign the CA
/// itself (self-signed) and all child leaf certificates. Leaf certificates on
/// the other hand use this to store the bound keypair.
#[derive(Debug)]
pub struct CertificatePair<S>
where
    S: CertificateKeypair,
    <S::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    certificate: Certificate,
    key_pair: S,
}

impl<S> CertificatePair<S>
where
    S: CertificateKeypair,
    <S::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    /// Starts a [`CertificateBuilder`] for a leaf certificate.
    pub fn builder<'a>() -> CertificateBuilderBuilder<'a, S> {
        CertificateBuilder::start_builder()
    }

    /// Returns a reference to the [`Certificate`].
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Returns a reference to the (signing) key pair.
    pub fn key_pair(&self) -> &S {
        &self.key_pair
    }

    /// Encodes the certificate as a `CERTIFICATE` PEM document.
    pub fn certificate_pem(&self) -> Result<String, CertificatePairError<S::Error>> {
        self.certificate
            .to_pem(PEM_LINE_ENDING)
            .context(SerializeCertificateSnafu {
                key_encoding: KeyEncoding::Pem,
            })
    }

    /// Encodes the private key in the algorithm specific PEM format, see
    /// [`CertificateKeypair::to_private_key_pem`].
    pub fn private_key_pem(&self) -> Result<String, CertificatePairError<S::Error>> {
        self.key_pair
            .to_private_key_pem()
            .context(SerializePrivateKeySnafu {
                key_encoding: KeyEncoding::Pem,
            })
    }
}

/// Private and public key encoding, either DER or PEM.
#[derive(Debug, PartialEq, Eq)]
pub enum KeyEncoding {
    Pem,
    Der,
}

impl std::fmt::Display for KeyEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyEncoding::Pem => write!(f, "PEM"),
            KeyEncoding::Der => write!(f, "DER"),
        }
    }
}
