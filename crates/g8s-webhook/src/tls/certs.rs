use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

#[derive(Debug, Snafu)]
pub enum CertificateError {
    #[snafu(display("failed to open certificate file {path:?}"))]
    OpenCertificateFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to read certificates from {path:?}"))]
    ReadCertificates {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("no certificate found in {path:?}"))]
    NoCertificate { path: PathBuf },

    #[snafu(display("failed to open private key file {path:?}"))]
    OpenPrivateKeyFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to read private key from {path:?}"))]
    ReadPrivateKey {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("no private key found in {path:?}"))]
    NoPrivateKey { path: PathBuf },
}

/// A certificate chain together with the private key of its leaf, as
/// provisioned on disk (usually a mounted `kubernetes.io/tls` secret).
#[derive(Debug)]
pub struct CertificateChain {
    chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
}

impl CertificateChain {
    pub fn from_files(
        certificate_path: impl AsRef<Path>,
        private_key_path: impl AsRef<Path>,
    ) -> Result<Self, CertificateError> {
        let certificate_path = certificate_path.as_ref();
        let private_key_path = private_key_path.as_ref();

        let cert_file = File::open(certificate_path).context(OpenCertificateFileSnafu {
            path: certificate_path,
        })?;
        let key_file = File::open(private_key_path).context(OpenPrivateKeyFileSnafu {
            path: private_key_path,
        })?;

        Self::from_readers(
            &mut BufReader::new(cert_file),
            certificate_path,
            &mut BufReader::new(key_file),
            private_key_path,
        )
    }

    fn from_readers(
        cert_reader: &mut dyn BufRead,
        certificate_path: &Path,
        key_reader: &mut dyn BufRead,
        private_key_path: &Path,
    ) -> Result<Self, CertificateError> {
        let chain = rustls_pemfile::certs(cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .context(ReadCertificatesSnafu {
                path: certificate_path,
            })?;
        ensure!(!chain.is_empty(), NoCertificateSnafu {
            path: certificate_path
        });

        // Accepts PKCS#8, SEC1 and PKCS#1 encoded keys, first one wins.
        let private_key = rustls_pemfile::private_key(key_reader)
            .context(ReadPrivateKeySnafu {
                path: private_key_path,
            })?
            .context(NoPrivateKeySnafu {
                path: private_key_path,
            })?;

        Ok(Self { chain, private_key })
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn into_parts(self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        (self.chain, self.private_key)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use g8s_certs::SelfSignedBundle;

    use super::*;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("failed to create temp file");
        file.write_all(contents.as_bytes())
            .expect("failed to write temp file");
        file
    }

    #[test]
    fn reads_generated_bundle() {
        let bundle = SelfSignedBundle::generate("g8s-webhook", &["g8s-webhook.g8s.svc".into()])
            .expect("failed to generate bundle");
        let certs = write_temp(&format!("{}{}", bundle.cert_pem, bundle.ca_cert_pem));
        let key = write_temp(&bundle.key_pem);

        let chain =
            CertificateChain::from_files(certs.path(), key.path()).expect("failed to read chain");

        assert_eq!(chain.chain().len(), 2);
        assert!(matches!(chain.into_parts().1, PrivateKeyDer::Sec1(_)));
    }

    #[test]
    fn missing_key_is_reported() {
        let bundle = SelfSignedBundle::generate("g8s-webhook", &[]).unwrap();
        let certs = write_temp(&bundle.cert_pem);
        let key = write_temp("");

        let err = CertificateChain::from_files(certs.path(), key.path()).unwrap_err();
        assert!(matches!(err, CertificateError::NoPrivateKey { .. }));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = CertificateChain::from_files("/does/not/exist.crt", "/does/not/exist.key")
            .unwrap_err();
        assert!(matches!(err, CertificateError::OpenCertificateFile { .. }));
    }
}
