//! The four g8s custom resources: three credential kinds and the
//! [`Allowlist`] policy which mirrors and injects them.
use std::io::Write;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, CustomResourceExt as _};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize CRD {kind} as YAML"))]
    SerializeYaml {
        source: serde_yaml::Error,
        kind: ResourceKind,
    },

    #[snafu(display("failed to write YAML document separator"))]
    WriteDocumentSeparator { source: std::io::Error },
}

/// Every resource kind the controller reconciles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum ResourceKind {
    #[strum(serialize = "Login")]
    Login,

    #[strum(serialize = "SSHKeyPair")]
    SshKeyPair,

    #[strum(serialize = "SelfSignedTLSBundle")]
    SelfSignedTlsBundle,

    #[strum(serialize = "Allowlist")]
    Allowlist,
}

impl ResourceKind {
    /// Parses the `kind` of an owner reference.
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Login" => Some(Self::Login),
            "SSHKeyPair" => Some(Self::SshKeyPair),
            "SelfSignedTLSBundle" => Some(Self::SelfSignedTlsBundle),
            "Allowlist" => Some(Self::Allowlist),
            _ => None,
        }
    }

    /// Lowercase kind, used as prefix of every derived object name.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::SshKeyPair => "sshkeypair",
            Self::SelfSignedTlsBundle => "selfsignedtlsbundle",
            Self::Allowlist => "allowlist",
        }
    }

    pub fn is_namespaced(self) -> bool {
        !matches!(self, Self::Allowlist)
    }
}

/// Status shared by all g8s resources.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ReadyStatus {
    /// Set once the resource was reconciled successfully.
    #[serde(default)]
    pub ready: bool,
}

/// A rotating username/password credential.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "api.g8s.io",
    version = "v1alpha1",
    kind = "Login",
    namespaced,
    status = "ReadyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct LoginSpec {
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<PasswordSpec>,
}

/// How passwords are generated. Both fields are optional.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSpec {
    /// Password length, 27 when unset or zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u8>,

    /// Characters to draw from, alphanumeric when unset or empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_set: Option<String>,
}

/// A rotating SSH key pair.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "api.g8s.io",
    version = "v1alpha1",
    kind = "SSHKeyPair",
    root = "SshKeyPair",
    namespaced,
    status = "ReadyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SshKeyPairSpec {
    #[serde(default)]
    pub key_type: SshKeyType,

    /// RSA modulus size, 4096 when unset. Ignored for ed25519.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_size: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SshKeyType {
    Rsa,
    #[default]
    Ed25519,
}

/// A rotating self-signed CA plus server certificate.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "api.g8s.io",
    version = "v1alpha1",
    kind = "SelfSignedTLSBundle",
    root = "SelfSignedTlsBundle",
    namespaced,
    status = "ReadyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SelfSignedTlsBundleSpec {
    /// Common name of both certificates. Must not be empty.
    pub app_name: String,

    /// DNS subject alternative names of both certificates.
    #[serde(default)]
    pub sans: Vec<String>,
}

/// Policy selecting which credentials are mirrored into which namespaces and
/// injected into which pods.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "api.g8s.io",
    version = "v1alpha1",
    kind = "Allowlist",
    status = "ReadyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistSpec {
    #[serde(default)]
    pub logins: Vec<AllowlistEntry>,

    #[serde(default, rename = "selfSignedTLSBundles")]
    pub self_signed_tls_bundles: Vec<AllowlistEntry>,

    #[serde(default)]
    pub ssh_key_pairs: Vec<AllowlistEntry>,
}

/// Grants one credential to a set of targets.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AllowlistEntry {
    /// Name of the Login, SSHKeyPair or SelfSignedTLSBundle.
    pub name: String,

    #[serde(default)]
    pub targets: Vec<Target>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Target {
    /// Namespace the backend secret is mirrored into.
    pub namespace: String,

    /// Pods matching this selector get the credential injected.
    #[serde(default)]
    pub selector: LabelSelector,

    /// Restricts injection to these containers. All containers when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<Vec<String>>,
}

/// One target of an Allowlist, with its position in the spec.
#[derive(Clone, Copy, Debug)]
pub struct TargetRef<'a> {
    pub kind: ResourceKind,
    pub entry_index: usize,
    pub entry: &'a AllowlistEntry,
    pub target_index: usize,
    pub target: &'a Target,
}

impl TargetRef<'_> {
    /// Name of the backend secret this target grants.
    pub fn secret_name(&self) -> String {
        crate::resources::backend_secret_name(self.kind, &self.entry.name)
    }

    /// JSON path of the target, for example `.spec.logins[0].targets[1]`.
    pub fn path(&self) -> String {
        format!(
            ".spec.{field}[{entry}].targets[{target}]",
            field = AllowlistSpec::field_name(self.kind),
            entry = self.entry_index,
            target = self.target_index,
        )
    }
}

impl AllowlistSpec {
    /// The entries of each credential kind, in a fixed order.
    pub fn entries(&self) -> [(ResourceKind, &[AllowlistEntry]); 3] {
        [
            (ResourceKind::Login, self.logins.as_slice()),
            (
                ResourceKind::SelfSignedTlsBundle,
                self.self_signed_tls_bundles.as_slice(),
            ),
            (ResourceKind::SshKeyPair, self.ssh_key_pairs.as_slice()),
        ]
    }

    /// Every target across all kinds and entries.
    pub fn targets(&self) -> impl Iterator<Item = TargetRef<'_>> {
        self.entries().into_iter().flat_map(|(kind, entries)| {
            entries.iter().enumerate().flat_map(move |(entry_index, entry)| {
                entry
                    .targets
                    .iter()
                    .enumerate()
                    .map(move |(target_index, target)| TargetRef {
                        kind,
                        entry_index,
                        entry,
                        target_index,
                        target,
                    })
            })
        })
    }

    fn field_name(kind: ResourceKind) -> &'static str {
        match kind {
            ResourceKind::Login => "logins",
            ResourceKind::SelfSignedTlsBundle => "selfSignedTLSBundles",
            ResourceKind::SshKeyPair => "sshKeyPairs",
            ResourceKind::Allowlist => "allowlists",
        }
    }
}

/// Writes all CustomResourceDefinitions as a stream of explicit YAML
/// documents.
pub fn write_crds<W: Write>(mut writer: W) -> Result<()> {
    let crds = [
        (ResourceKind::Login, Login::crd()),
        (ResourceKind::SshKeyPair, SshKeyPair::crd()),
        (ResourceKind::SelfSignedTlsBundle, SelfSignedTlsBundle::crd()),
        (ResourceKind::Allowlist, Allowlist::crd()),
    ];

    for (kind, crd) in crds {
        writer
            .write_all(b"---\n")
            .context(WriteDocumentSeparatorSnafu)?;
        serde_yaml::to_writer(&mut writer, &crd).context(SerializeYamlSnafu { kind })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use kube::{CustomResourceExt, Resource};

    use super::*;

    #[test]
    fn crd_names() {
        assert_eq!(Login::crd_name(), "logins.api.g8s.io");
        assert_eq!(SshKeyPair::crd_name(), "sshkeypairs.api.g8s.io");
        assert_eq!(
            SelfSignedTlsBundle::crd_name(),
            "selfsignedtlsbundles.api.g8s.io"
        );
        assert_eq!(Allowlist::crd_name(), "allowlists.api.g8s.io");
        assert_eq!(SshKeyPair::kind(&()), "SSHKeyPair");
        assert_eq!(ResourceKind::SshKeyPair.to_string(), "SSHKeyPair");
    }

    #[test]
    fn allowlist_is_cluster_scoped() {
        let crd = Allowlist::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(Login::crd().spec.scope, "Namespaced");
    }

    #[test]
    fn written_crds_are_four_documents() {
        let mut buffer = Vec::new();
        write_crds(&mut buffer).unwrap();
        let yaml = String::from_utf8(buffer).unwrap();

        assert_eq!(yaml.matches("---\n").count(), 4);
        assert!(yaml.contains("kind: CustomResourceDefinition"));
    }

    #[test]
    fn allowlist_targets_are_enumerated_with_paths() {
        let spec: AllowlistSpec = serde_yaml::from_str(indoc! {"
            logins:
              - name: db
                targets:
                  - namespace: payments
                    selector:
                      matchLabels:
                        app: payments
                  - namespace: billing
            sshKeyPairs:
              - name: deploy
                targets:
                  - namespace: ci
                    containers: [runner]
        "})
        .unwrap();

        let targets: Vec<_> = spec
            .targets()
            .map(|target| (target.path(), target.secret_name()))
            .collect();
        assert_eq!(targets, vec![
            (".spec.logins[0].targets[0]".to_owned(), "login-db".to_owned()),
            (".spec.logins[0].targets[1]".to_owned(), "login-db".to_owned()),
            (
                ".spec.sshKeyPairs[0].targets[0]".to_owned(),
                "sshkeypair-deploy".to_owned()
            ),
        ]);
    }

    #[test]
    fn login_spec_field_names() {
        let login: LoginSpec = serde_yaml::from_str(indoc! {"
            username: admin
            password:
              length: 12
              characterSet: abc
        "})
        .unwrap();

        assert_eq!(login.password.unwrap().character_set.as_deref(), Some("abc"));
    }
}
