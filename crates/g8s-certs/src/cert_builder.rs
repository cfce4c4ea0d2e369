use std::time::{Duration, SystemTime};

use const_oid::db::rfc5280::ID_KP_SERVER_AUTH;
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use x509_cert::{
    builder::{Builder, Profile},
    der::{DecodePem, asn1::Ia5String},
    ext::pkix::{ExtendedKeyUsage, SubjectAltName, name::GeneralName},
    name::Name,
    serial_number::SerialNumber,
    spki::{EncodePublicKey, SubjectPublicKeyInfoOwned},
    time::Validity,
};

use crate::{
    CertificatePair, PEM_LINE_ENDING,
    ca::{CertificateAuthority, DEFAULT_CERTIFICATE_VALIDITY},
    keys::CertificateKeypair,
};

/// Defines all error variants which can occur when creating a certificate
#[derive(Debug, Snafu)]
pub enum CreateCertificateError<E>
where
    E: std::error::Error + 'static,
{
    #[snafu(display("failed to parse validity"))]
    ParseValidity { source: x509_cert::der::Error },

    #[snafu(display("failed to parse {subject:?} as subject"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: String,
    },

    #[snafu(display("failed to create key pair"))]
    CreateKeyPair { source: E },

    #[snafu(display("failed to serialize public key as PEM"))]
    SerializePublicKey { source: x509_cert::spki::Error },

    #[snafu(display("failed to decode SPKI from PEM"))]
    DecodeSpkiFromPem { source: x509_cert::der::Error },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display(
        "failed to parse subject alternative DNS name {subject_alternative_dns_name:?} as a Ia5 string"
    ))]
    ParseSubjectAlternativeDnsName {
        subject_alternative_dns_name: String,
        source: x509_cert::der::Error,
    },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: x509_cert::builder::Error },

    #[snafu(display(
        "the generated certificate would outlive the CA, subject {subject:?}, \
        CA notAfter {ca_not_after:?}, cert notAfter {cert_not_after:?}"
    ))]
    CertOutlivesCa {
        subject: String,
        ca_not_after: SystemTime,
        cert_not_after: SystemTime,
    },
}

/// This builder builds leaf certificates of type [`CertificatePair`], signed
/// by the provided [`CertificateAuthority`].
///
/// The leaf certificates are meant for TLS servers: they carry
/// [`ID_KP_SERVER_AUTH`] in the extended key usage extension and have
/// KeyEncipherment enabled.
///
/// This builder has many default values, notably;
///
/// - A default validity of [`DEFAULT_CERTIFICATE_VALIDITY`], unless an
///   explicit `validity_window` is set
/// - A randomly generated serial number, unless one is provided
/// - In case no `key_pair` was provided, a fresh keypair will be created.
///
/// ```no_run
/// use g8s_certs::{ca::CertificateAuthority, CertificatePair};
///
/// let ca = CertificateAuthority::builder_with_ecdsa()
///     .build()
///     .expect("failed to build CA");
///
/// let certificate = CertificatePair::builder()
///     .subject("CN=my-app,O=g8s")
///     .signed_by(&ca)
///     .build()
///     .expect("failed to build certificate");
/// ```
#[derive(bon::Builder)]
#[builder(start_fn = start_builder, finish_fn = finish_builder)]
pub struct CertificateBuilder<'a, KP>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    /// Required subject of the certificate in RFC 4514 notation, e.g. `CN=my-app,O=g8s`.
    subject: &'a str,

    /// DNS names added to the subject alternative name extension.
    #[builder(default)]
    subject_alternative_dns_names: &'a [String],

    /// Validity/lifetime of the certificate, starting now.
    #[builder(default = DEFAULT_CERTIFICATE_VALIDITY)]
    validity: Duration,

    /// Explicit notBefore/notAfter window. Takes precedence over `validity`.
    validity_window: Option<Validity>,

    /// Fixed serial number. Without it, a random non-zero 63-bit serial is used.
    serial_number: Option<u64>,

    /// Cryptographic keypair bound to the certificate.
    ///
    /// If not specified a random keypair will be generated.
    key_pair: Option<KP>,

    /// Mandatorily sign the certificate using the provided [`CertificateAuthority`].
    signed_by: &'a CertificateAuthority<KP>,
}

impl<KP, S> CertificateBuilderBuilder<'_, KP, S>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
    S: certificate_builder_builder::IsComplete,
{
    /// Convenience function to avoid calling `builder().finish_builder().build()`
    pub fn build(self) -> Result<CertificatePair<KP>, CreateCertificateError<KP::Error>> {
        self.finish_builder().build()
    }
}

impl<KP> CertificateBuilder<'_, KP>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    #[instrument(
        name = "build_certificate",
        skip(self),
        fields(subject = self.subject),
    )]
    pub fn build(self) -> Result<CertificatePair<KP>, CreateCertificateError<KP::Error>> {
        let validity = match self.validity_window {
            Some(validity) => validity,
            None => Validity::from_now(self.validity).context(ParseValiditySnafu)?,
        };
        let subject: Name = self.subject.parse().context(ParseSubjectSnafu {
            subject: self.subject,
        })?;
        let key_pair = match self.key_pair {
            Some(key_pair) => key_pair,
            None => KP::new().context(CreateKeyPairSnafu)?,
        };

        let serial_number = SerialNumber::from(
            self.serial_number
                .unwrap_or_else(crate::bundle::random_serial_number),
        );

        let ca_not_after = self
            .signed_by
            .ca_cert()
            .tbs_certificate
            .validity
            .not_after
            .to_system_time();
        let cert_not_after = validity.not_after.to_system_time();

        ensure!(ca_not_after >= cert_not_after, CertOutlivesCaSnafu {
            subject: self.subject,
            ca_not_after,
            cert_not_after,
        });

        let spki_pem = key_pair
            .verifying_key()
            .to_public_key_pem(PEM_LINE_ENDING)
            .context(SerializePublicKeySnafu)?;

        let spki = SubjectPublicKeyInfoOwned::from_pem(spki_pem.as_bytes())
            .context(DecodeSpkiFromPemSnafu)?;

        debug!(
            certificate.subject = %subject,
            certificate.not_after = %validity.not_after,
            certificate.not_before = %validity.not_before,
            certificate.serial = ?serial_number,
            certificate.san.dns_names = ?self.subject_alternative_dns_names,
            certificate.signed_by.issuer = %self.signed_by.issuer_name(),
            certificate.public_key.algorithm = KP::algorithm_name(),
            certificate.public_key.size = KP::key_size(),
            "creating and signing certificate"
        );
        let signing_key = self.signed_by.signing_key();
        let mut builder = x509_cert::builder::CertificateBuilder::new(
            Profile::Leaf {
                issuer: self.signed_by.issuer_name().clone(),
                enable_key_agreement: false,
                enable_key_encipherment: true,
            },
            serial_number,
            validity,
            subject,
            spki,
            signing_key,
        )
        .context(CreateCertificateBuilderSnafu)?;

        builder
            .add_extension(&ExtendedKeyUsage(vec![ID_KP_SERVER_AUTH]))
            .context(AddCertificateExtensionSnafu)?;

        let sans = self
            .subject_alternative_dns_names
            .iter()
            .map(|dns_name| {
                Ok(GeneralName::DnsName(Ia5String::new(dns_name).context(
                    ParseSubjectAlternativeDnsNameSnafu {
                        subject_alternative_dns_name: dns_name.clone(),
                    },
                )?))
            })
            .collect::<Result<Vec<_>, CreateCertificateError<KP::Error>>>()?;

        if !sans.is_empty() {
            builder
                .add_extension(&SubjectAltName(sans))
                .context(AddCertificateExtensionSnafu)?;
        }

        let certificate = builder
            .build::<KP::Signature>()
            .context(BuildCertificateSnafu)?;

        Ok(CertificatePair {
            certificate,
            key_pair,
        })
    }
}
