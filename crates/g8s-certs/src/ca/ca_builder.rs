use std::time::Duration;

use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};
use x509_cert::{
    builder::{Builder, CertificateBuilder, Profile},
    der::{DecodePem, asn1::Ia5String, referenced::OwnedToRef},
    ext::pkix::{AuthorityKeyIdentifier, SubjectAltName, name::GeneralName},
    name::Name,
    serial_number::SerialNumber,
    spki::{EncodePublicKey, SubjectPublicKeyInfoOwned},
    time::Validity,
};

use super::CertificateAuthority;
use crate::{
    CertificatePair, PEM_LINE_ENDING,
    ca::{DEFAULT_CA_SUBJECT, DEFAULT_CA_VALIDITY},
    keys::CertificateKeypair,
};

/// Defines all error variants which can occur when creating a CA
#[derive(Debug, Snafu)]
pub enum CreateCertificateAuthorityError<E>
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

    #[snafu(display("failed to create signing key pair"))]
    CreateSigningKeyPair { source: E },

    #[snafu(display("failed to serialize public key as PEM"))]
    SerializePublicKey { source: x509_cert::spki::Error },

    #[snafu(display("failed to decode SPKI from PEM"))]
    DecodeSpkiFromPem { source: x509_cert::der::Error },

    #[snafu(display("failed to parse AuthorityKeyIdentifier"))]
    ParseAuthorityKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display(
        "failed to parse subject alternative DNS name {subject_alternative_dns_name:?} as a Ia5 string"
    ))]
    ParseSubjectAlternativeDnsName {
        subject_alternative_dns_name: String,
        source: x509_cert::der::Error,
    },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: x509_cert::builder::Error },
}

/// This builder builds certificate authorities of type [`CertificateAuthority`].
///
/// It has many default values, notably;
///
/// - A default validity of [`DEFAULT_CA_VALIDITY`]
/// - A default subject of [`DEFAULT_CA_SUBJECT`]
/// - A randomly generated serial number, unless one is provided
/// - In case no `signing_key_pair` was provided, a fresh keypair will be created. The algorithm
///   is chosen by the generic [`CertificateKeypair`] type of this struct.
///
/// The CA contains the public half of the provided `signing_key_pair` and is signed by the private
/// half of said key.
///
/// ```no_run
/// use g8s_certs::ca::CertificateAuthority;
///
/// let ca = CertificateAuthority::builder_with_ecdsa()
///     .subject("CN=my-app,O=g8s")
///     .build()
///     .expect("failed to build CA");
/// ```
#[derive(bon::Builder)]
#[builder(start_fn = start_builder, finish_fn = finish_builder)]
pub struct CertificateAuthorityBuilder<'a, SKP>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    /// Subject of the certificate authority in RFC 4514 notation, e.g. `CN=foo,O=g8s`.
    #[builder(default = DEFAULT_CA_SUBJECT)]
    subject: &'a str,

    /// DNS names added to the subject alternative name extension.
    #[builder(default)]
    subject_alternative_dns_names: &'a [String],

    /// Validity/lifetime of the certificate, starting now.
    ///
    /// If not specified the default of [`DEFAULT_CA_VALIDITY`] will be used.
    #[builder(default = DEFAULT_CA_VALIDITY)]
    validity: Duration,

    /// Fixed serial number. Without it, a random non-zero 63-bit serial is used.
    serial_number: Option<u64>,

    /// Cryptographic keypair used to sign the CA and its leaf certificates.
    ///
    /// If not specified a random keypair will be generated.
    signing_key_pair: Option<SKP>,
}

impl<SKP, S> CertificateAuthorityBuilderBuilder<'_, SKP, S>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
    S: certificate_authority_builder_builder::IsComplete,
{
    /// Convenience function to avoid calling `builder().finish_builder().build()`
    pub fn build(
        self,
    ) -> Result<CertificateAuthority<SKP>, CreateCertificateAuthorityError<SKP::Error>> {
        self.finish_builder().build()
    }
}

impl<SKP> CertificateAuthorityBuilder<'_, SKP>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    #[instrument(
        name = "build_certificate_authority",
        skip(self),
        fields(subject = self.subject),
    )]
    pub fn build(
        self,
    ) -> Result<CertificateAuthority<SKP>, CreateCertificateAuthorityError<SKP::Error>> {
        let validity = Validity::from_now(self.validity).context(ParseValiditySnafu)?;
        let subject: Name = self.subject.parse().context(ParseSubjectSnafu {
            subject: self.subject,
        })?;
        let signing_key_pair = match self.signing_key_pair {
            Some(signing_key_pair) => signing_key_pair,
            None => SKP::new().context(CreateSigningKeyPairSnafu)?,
        };

        let serial_number = SerialNumber::from(
            self.serial_number
                .unwrap_or_else(crate::bundle::random_serial_number),
        );

        let spki_pem = signing_key_pair
            .verifying_key()
            .to_public_key_pem(PEM_LINE_ENDING)
            .context(SerializePublicKeySnafu)?;

        let spki = SubjectPublicKeyInfoOwned::from_pem(spki_pem.as_bytes())
            .context(DecodeSpkiFromPemSnafu)?;

        // The root profile adds BasicConstraints (critical, CA = true), the
        // SubjectKeyIdentifier and KeyUsage with KeyCertSign and CRLSign set.
        // It doesn't add the AuthorityKeyIdentifier extension, so we add it
        // below using the 160-bit SHA-1 hash of the subject public key
        // (RFC 5280, section 4.2.1.2).
        let aki = AuthorityKeyIdentifier::try_from(spki.owned_to_ref())
            .context(ParseAuthorityKeyIdentifierSnafu)?;

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
            .collect::<Result<Vec<_>, CreateCertificateAuthorityError<SKP::Error>>>()?;

        debug!(
            ca.subject = %subject,
            ca.not_after = %validity.not_after,
            ca.not_before = %validity.not_before,
            ca.serial = ?serial_number,
            ca.san.dns_names = ?self.subject_alternative_dns_names,
            ca.public_key.algorithm = SKP::algorithm_name(),
            ca.public_key.size = SKP::key_size(),
            "creating certificate authority"
        );
        let signer = signing_key_pair.signing_key();
        let mut builder = CertificateBuilder::new(
            Profile::Root,
            serial_number,
            validity,
            subject,
            spki,
            signer,
        )
        .context(CreateCertificateBuilderSnafu)?;

        builder
            .add_extension(&aki)
            .context(AddCertificateExtensionSnafu)?;

        if !sans.is_empty() {
            builder
                .add_extension(&SubjectAltName(sans))
                .context(AddCertificateExtensionSnafu)?;
        }

        let certificate = builder
            .build::<SKP::Signature>()
            .context(BuildCertificateSnafu)?;

        Ok(CertificateAuthority {
            certificate_pair: CertificatePair {
                certificate,
                key_pair: signing_key_pair,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use x509_cert::{
        certificate::TbsCertificateInner,
        der::Decode,
        ext::pkix::{BasicConstraints, KeyUsage, KeyUsages},
    };

    use super::*;

    #[test]
    fn minimal_ca() {
        let ca = CertificateAuthority::builder_with_ecdsa()
            .build()
            .expect("failed to build CA");

        assert_ca_cert_attributes(
            &ca.ca_cert().tbs_certificate,
            DEFAULT_CA_SUBJECT,
            DEFAULT_CA_VALIDITY,
        );
    }

    #[test]
    fn customized_ca() {
        let sans = ["payments.default.svc".to_owned()];
        let ca = CertificateAuthority::builder_with_ecdsa()
            .subject("CN=payments,O=g8s")
            .subject_alternative_dns_names(&sans)
            .serial_number(41)
            .validity(Duration::from_secs(13 * 24 * 60 * 60))
            .build()
            .expect("failed to build CA");

        assert_ca_cert_attributes(
            &ca.ca_cert().tbs_certificate,
            "CN=payments,O=g8s",
            Duration::from_secs(13 * 24 * 60 * 60),
        );
        assert_eq!(ca.serial_number(), &SerialNumber::from(41u64));
    }

    fn assert_ca_cert_attributes(ca_cert: &TbsCertificateInner, subject: &str, validity: Duration) {
        assert_eq!(ca_cert.subject, subject.parse().unwrap());
        assert_eq!(ca_cert.issuer, ca_cert.subject);

        let not_before = ca_cert.validity.not_before.to_system_time();
        let not_after = ca_cert.validity.not_after.to_system_time();
        assert_eq!(
            not_after
                .duration_since(not_before)
                .expect("Failed to calculate duration between notBefore and notAfter"),
            validity
        );

        let extensions = ca_cert.extensions.as_ref().expect("CA had no extensions");
        let basic_constraints = extensions
            .iter()
            .find(|ext| ext.extn_id == const_oid::db::rfc5280::ID_CE_BASIC_CONSTRAINTS)
            .expect("CA had no BasicConstraints extension");
        let basic_constraints =
            BasicConstraints::from_der(basic_constraints.extn_value.as_bytes()).unwrap();
        assert!(basic_constraints.ca);

        let key_usage = extensions
            .iter()
            .find(|ext| ext.extn_id == const_oid::db::rfc5280::ID_CE_KEY_USAGE)
            .expect("CA had no KeyUsage extension");
        let key_usage = KeyUsage::from_der(key_usage.extn_value.as_bytes()).unwrap();
        assert!(key_usage.0.contains(KeyUsages::KeyCertSign));
        assert!(key_usage.0.contains(KeyUsages::CRLSign));
    }
}
