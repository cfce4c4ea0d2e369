//! Credential generation and rotation.
//!
//! Every credential kind implements [`Credential`], which describes the field
//! group of one generation and how a fresh generation is produced. Past
//! generations are kept in a [`History`], newest first.
use std::collections::BTreeMap;

use snafu::Snafu;

use crate::crd::ResourceKind;

pub use history::History;

mod history;
mod login;
mod ssh;
mod tls;

/// Field name to value, as stored in a secret.
pub type Fields = BTreeMap<String, String>;

/// The values of one generation, keyed by the unsuffixed field names of
/// [`Credential::FIELDS`].
pub type Generation = BTreeMap<String, String>;

pub type Result<T, E = GenerateError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum GenerateError {
    #[snafu(display("failed to generate {key_type} SSH key"))]
    GenerateSshKey {
        source: ssh_key::Error,
        key_type: crate::crd::SshKeyType,
    },

    #[snafu(display("RSA keys need at least 2048 bits, got {bit_size}"))]
    RsaKeyTooSmall { bit_size: u32 },

    #[snafu(display("failed to encode SSH key in OpenSSH format"))]
    EncodeSshKey { source: ssh_key::Error },

    #[snafu(display("appName of a self-signed TLS bundle must not be empty"))]
    EmptyAppName,

    #[snafu(display("failed to generate self-signed TLS bundle"))]
    GenerateTlsBundle { source: g8s_certs::BundleError },
}

/// The capability shared by the three credential kinds.
pub trait Credential {
    /// The kind, which also determines the derived secret names.
    const KIND: ResourceKind;

    /// Ordered field group of one generation.
    const FIELDS: &'static [&'static str];

    /// `type` of the backend secret.
    const BACKEND_SECRET_TYPE: &'static str;

    /// Produces fresh credential material.
    fn generate(&self) -> Result<Generation>;

    /// Contents of the backend secret for the newest generation.
    fn backend_fields(&self, newest: &Generation) -> Fields {
        newest.clone()
    }

    /// Generates a new generation, prepends it to `history` and returns it.
    fn rotate(&self, history: &mut History) -> Result<Generation> {
        let generation = self.generate()?;
        history.rotate(generation.clone());
        Ok(generation)
    }
}
