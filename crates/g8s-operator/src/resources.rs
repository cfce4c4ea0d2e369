//! Builders for the objects the controller derives from declared resources:
//! backend and history secrets, mirrored secrets and backing ClusterRoles.
use std::collections::BTreeMap;

use k8s_openapi::{
    ByteString,
    api::{
        core::v1::Secret,
        rbac::v1::{ClusterRole, PolicyRule},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{Resource, ResourceExt as _, core::ObjectMeta};
use snafu::{OptionExt, Snafu};

use crate::{
    constants::{
        CONTROLLER_ANNOTATION_KEY, CONTROLLER_ANNOTATION_VALUE, HISTORY_SECRET_SUFFIX,
        HISTORY_SECRET_TYPE, MIRROR_OWNER_LABEL_KEY, MIRROR_OWNER_LABEL_VALUE,
    },
    credentials::{Credential, Fields, History},
    crd::{Allowlist, ResourceKind},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{kind} {name:?} has no uid, cannot reference it as owner"))]
    ObjectMissingMetadataForOwnerRef { kind: String, name: String },
}

/// `<kind>-<name>`, shared by the backend secret and the ClusterRole.
pub fn backend_secret_name(kind: ResourceKind, name: &str) -> String {
    format!("{prefix}-{name}", prefix = kind.prefix())
}

pub fn history_secret_name(kind: ResourceKind, name: &str) -> String {
    format!("{}{HISTORY_SECRET_SUFFIX}", backend_secret_name(kind, name))
}

/// Controller owner reference pointing at `owner`.
pub fn owner_reference<K>(owner: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner
        .controller_owner_ref(&())
        .context(ObjectMissingMetadataForOwnerRefSnafu {
            kind: K::kind(&()).into_owned(),
            name: owner.name_any(),
        })
}

/// Returns `true` if `child` names the object with `owner_uid` as controller.
pub fn is_controlled_by(child: &ObjectMeta, owner_uid: &str) -> bool {
    child
        .owner_references
        .iter()
        .flatten()
        .any(|reference| reference.controller == Some(true) && reference.uid == owner_uid)
}

/// Metadata shared by every object derived from a declared resource.
fn derived_metadata<K>(owner: &K, name: String, namespace: Option<String>) -> Result<ObjectMeta>
where
    K: Resource<DynamicType = ()>,
{
    Ok(ObjectMeta {
        name: Some(name),
        namespace,
        labels: owner.meta().labels.clone(),
        annotations: Some(BTreeMap::from([(
            CONTROLLER_ANNOTATION_KEY.to_owned(),
            CONTROLLER_ANNOTATION_VALUE.to_owned(),
        )])),
        owner_references: Some(vec![owner_reference(owner)?]),
        ..ObjectMeta::default()
    })
}

fn immutable_secret(metadata: ObjectMeta, type_: &str, fields: &Fields) -> Secret {
    Secret {
        metadata,
        immutable: Some(true),
        type_: Some(type_.to_owned()),
        data: Some(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), ByteString(value.as_bytes().to_vec())))
                .collect(),
        ),
        ..Secret::default()
    }
}

pub fn backend_secret<C>(owner: &C, fields: &Fields) -> Result<Secret>
where
    C: Credential + Resource<DynamicType = ()>,
{
    let metadata = derived_metadata(
        owner,
        backend_secret_name(C::KIND, &owner.name_any()),
        owner.namespace(),
    )?;
    Ok(immutable_secret(metadata, C::BACKEND_SECRET_TYPE, fields))
}

pub fn history_secret<C>(owner: &C, history: &History) -> Result<Secret>
where
    C: Credential + Resource<DynamicType = ()>,
{
    let metadata = derived_metadata(
        owner,
        history_secret_name(C::KIND, &owner.name_any()),
        owner.namespace(),
    )?;
    Ok(immutable_secret(
        metadata,
        HISTORY_SECRET_TYPE,
        &history.to_fields(),
    ))
}

/// Read-only access to exactly the backend secret of `owner`.
pub fn cluster_role<C>(owner: &C) -> Result<ClusterRole>
where
    C: Credential + Resource<DynamicType = ()>,
{
    let name = backend_secret_name(C::KIND, &owner.name_any());
    Ok(ClusterRole {
        metadata: derived_metadata(owner, name.clone(), None)?,
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_owned()]),
            resource_names: Some(vec![name]),
            verbs: vec!["get".to_owned(), "list".to_owned(), "watch".to_owned()],
            ..PolicyRule::default()
        }]),
        ..ClusterRole::default()
    })
}

/// Copies `backend` into `namespace`, owned by `allowlist`.
///
/// Only the payload and type survive; every other piece of metadata is
/// replaced.
pub fn mirrored_secret(backend: &Secret, namespace: &str, allowlist: &Allowlist) -> Result<Secret> {
    Ok(Secret {
        metadata: ObjectMeta {
            name: backend.metadata.name.clone(),
            namespace: Some(namespace.to_owned()),
            labels: Some(BTreeMap::from([(
                MIRROR_OWNER_LABEL_KEY.to_owned(),
                MIRROR_OWNER_LABEL_VALUE.to_owned(),
            )])),
            owner_references: Some(vec![owner_reference(allowlist)?]),
            ..ObjectMeta::default()
        },
        immutable: backend.immutable,
        type_: backend.type_.clone(),
        data: backend.data.clone(),
        string_data: backend.string_data.clone(),
    })
}

/// Decodes the payload of `secret`, preferring `data` over `stringData`.
pub fn secret_fields(secret: &Secret) -> Fields {
    match &secret.data {
        Some(data) => data
            .iter()
            .map(|(key, value)| (key.clone(), String::from_utf8_lossy(&value.0).into_owned()))
            .collect(),
        None => secret.string_data.clone().unwrap_or_default(),
    }
}
