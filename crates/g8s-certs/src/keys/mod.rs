//! Contains primitives to create private keys, which are used to sign CAs
//! and bind to leaf certificates.
//!
//! This module currently provides the following algorithms:
//!
//! ## ECDSA
//!
//! In order to work with ECDSA keys, this crate requires two dependencies:
//! [`ecdsa`], which provides primitives and traits, and [`p256`] which
//! implements the NIST P-256 elliptic curve and supports ECDSA.
//!
//! ```no_run
//! use g8s_certs::keys::{ecdsa::SigningKey, CertificateKeypair};
//! let key = SigningKey::new().unwrap();
//! ```
use std::fmt::Debug;

use rand_core::CryptoRngCore;
use signature::{Keypair, Signer};
use x509_cert::spki::{EncodePublicKey, SignatureAlgorithmIdentifier, SignatureBitStringEncoding};

pub mod ecdsa;

pub trait CertificateKeypair
where
    <Self::SigningKey as Keypair>::VerifyingKey: EncodePublicKey,
    Self: Debug + Sized,
{
    type SigningKey: SignatureAlgorithmIdentifier + Keypair + Signer<Self::Signature>;
    type Signature: SignatureBitStringEncoding;
    type VerifyingKey: EncodePublicKey;

    type Error: std::error::Error + 'static;

    /// Generates a new key with the default random-number generator [`rand_core::OsRng`].
    fn new() -> Result<Self, Self::Error>;

    /// Generates a new key with a custom random-number generator.
    fn new_with_rng<Rng>(rng: &mut Rng) -> Result<Self, Self::Error>
    where
        Rng: CryptoRngCore + Sized;

    /// Returns the signing (private) key half of the keypair.
    fn signing_key(&self) -> &Self::SigningKey;

    /// Returns the verifying (public) half of the keypair.
    fn verifying_key(&self) -> Self::VerifyingKey;

    /// Encodes the private key as PEM, using the native format of the
    /// algorithm (SEC1 `EC PRIVATE KEY` for ECDSA).
    fn to_private_key_pem(&self) -> Result<String, Self::Error>;

    /// Creates a signing key pair from a PEM-encoded private key as produced
    /// by [`CertificateKeypair::to_private_key_pem`].
    fn from_private_key_pem(input: &str) -> Result<Self, Self::Error>;

    /// The name of the algorithm such as `ecdsa`.
    fn algorithm_name() -> &'static str;

    /// The key length in bits
    fn key_size() -> usize;
}
