//! Credential injection into pods.
//!
//! For every Allowlist target whose selector matches the pod, the granted
//! credential is injected into the target's containers as environment
//! variables plus a read-only volume mount of the mirrored secret.
//!
//! Two rules narrow what a plain "replace `env` and `volumeMounts`" would do:
//!
//! - A target only applies to pods in its own namespace. Mirrors exist only
//!   there, so a pod elsewhere would reference a secret it cannot read.
//! - Injected env vars and mounts replace container entries of the same name
//!   (or, for mounts, the same mount path). Every other entry the container
//!   declares is kept in front of the injected ones.
use std::{collections::BTreeMap, sync::Arc};

use json_patch::{AddOperation, Patch, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, Pod, SecretKeySelector, SecretVolumeSource, Volume,
    VolumeMount,
};
use kube::{
    ResourceExt as _,
    core::admission::{AdmissionRequest, AdmissionResponse, SerializePatchError},
};
use snafu::{OptionExt, ResultExt, Snafu};

use super::WebhookState;
use crate::{
    cache,
    constants::{
        AUDIT_ALLOWLIST_KEY, AUDIT_ERROR_KEY, AUDIT_INJECTION_KEY, AUDIT_INJECTION_NONE,
        AUDIT_MUTATION_ERROR, MASTER_ALLOWLIST, SECRET_MOUNT_DIRECTORY,
    },
    crd::{AllowlistSpec, ResourceKind},
    selector::LabelSelectorExt as _,
};

#[derive(Debug, Snafu)]
pub enum MutateError {
    #[snafu(display("Allowlist {name:?} does not exist"))]
    MissingAllowlist { name: String },

    #[snafu(display("admission request carries no pod"))]
    MissingPod,

    #[snafu(display("failed to serialize JSON patch"))]
    SerializePatch { source: SerializePatchError },

    #[snafu(display("failed to serialize patch value for {path}"))]
    SerializeValue {
        source: serde_json::Error,
        path: String,
    },
}

/// One credential granted to a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    pub kind: ResourceKind,
    pub secret_name: String,
}

impl Grant {
    /// Environment variables exposing the secret keys, named after the
    /// secret: `login-db` yields `LOGIN_DB_USERNAME` and `LOGIN_DB_PASSWORD`.
    fn env_vars(&self) -> Vec<EnvVar> {
        let keys: &[(&str, &str)] = match self.kind {
            ResourceKind::Login => &[("USERNAME", "username"), ("PASSWORD", "password")],
            ResourceKind::SelfSignedTlsBundle => &[
                ("KEY", "key.pem"),
                ("CERT", "cert.pem"),
                ("CACERT", "cacert.pem"),
            ],
            ResourceKind::SshKeyPair => &[("KEY", "ssh.key"), ("PUB", "ssh.pub")],
            ResourceKind::Allowlist => &[],
        };
        let prefix = self.secret_name.replace('-', "_").to_uppercase();

        keys.iter()
            .map(|(suffix, key)| EnvVar {
                name: format!("{prefix}_{suffix}"),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: self.secret_name.clone(),
                        key: (*key).to_owned(),
                        optional: None,
                    }),
                    ..EnvVarSource::default()
                }),
                ..EnvVar::default()
            })
            .collect()
    }

    fn volume_mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.secret_name.clone(),
            mount_path: format!("{SECRET_MOUNT_DIRECTORY}/{}", self.secret_name),
            read_only: Some(true),
            ..VolumeMount::default()
        }
    }

    fn volume(&self) -> Volume {
        Volume {
            name: self.secret_name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(self.secret_name.clone()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        }
    }
}

/// Credentials granted to each container, keyed by container index.
pub type InjectionPlan = BTreeMap<usize, Vec<Grant>>;

/// Resolves which containers of `pod` receive which credentials.
///
/// A target applies when it names the pod's namespace and its selector
/// matches the pod labels. It grants to the listed containers that exist in
/// the pod, or to every container when no list is given.
pub fn plan_injection(allowlist: &AllowlistSpec, namespace: &str, pod: &Pod) -> InjectionPlan {
    let containers = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or_default();
    let labels = pod.labels();
    let mut plan = InjectionPlan::new();

    for target in allowlist.targets() {
        if target.target.namespace != namespace || !target.target.selector.matches(labels) {
            continue;
        }
        let grant = Grant {
            kind: target.kind,
            secret_name: target.secret_name(),
        };

        for (index, container) in containers.iter().enumerate() {
            let selected = target
                .target
                .containers
                .as_ref()
                .is_none_or(|names| names.contains(&container.name));
            if !selected {
                continue;
            }

            let grants = plan.entry(index).or_default();
            if !grants.contains(&grant) {
                grants.push(grant.clone());
            }
        }
    }

    plan
}

fn add(path: PointerBuf, value: &impl serde::Serialize) -> Result<PatchOperation, MutateError> {
    let value = serde_json::to_value(value).context(SerializeValueSnafu {
        path: path.to_string(),
    })?;
    Ok(PatchOperation::Add(AddOperation { path, value }))
}

fn container_path(index: usize, field: &str) -> PointerBuf {
    PointerBuf::from_tokens(["spec", "containers", &index.to_string(), field])
}

/// Keeps the entries of `existing` that `injected` does not supersede,
/// followed by `injected`.
fn merge<T: Clone>(
    existing: Option<&Vec<T>>,
    injected: Vec<T>,
    supersedes: impl Fn(&T, &T) -> bool,
) -> Vec<T> {
    let mut merged: Vec<T> = existing
        .into_iter()
        .flatten()
        .filter(|entry| !injected.iter().any(|new| supersedes(new, entry)))
        .cloned()
        .collect();
    merged.extend(injected);
    merged
}

/// Builds the JSON patch carrying out `plan`.
///
/// Each container gets its env and volumeMounts merged with the injected
/// ones, in container order. The volumes op comes last and carries the
/// existing volumes followed by one volume per distinct secret.
pub fn build_patch(pod: &Pod, plan: &InjectionPlan) -> Result<Patch, MutateError> {
    let spec = pod.spec.clone().unwrap_or_default();
    let mut ops = Vec::new();
    let mut volumes = spec.volumes.clone().unwrap_or_default();
    let existing_volumes = volumes.len();

    for (index, grants) in plan {
        let Some(Container {
            env, volume_mounts, ..
        }) = spec.containers.get(*index)
        else {
            continue;
        };

        let env = merge(
            env.as_ref(),
            grants.iter().flat_map(Grant::env_vars).collect(),
            |new, old| new.name == old.name,
        );
        ops.push(add(container_path(*index, "env"), &env)?);

        let mounts = merge(
            volume_mounts.as_ref(),
            grants.iter().map(Grant::volume_mount).collect(),
            |new, old| new.name == old.name || new.mount_path == old.mount_path,
        );
        ops.push(add(container_path(*index, "volumeMounts"), &mounts)?);

        for grant in grants {
            if !volumes[existing_volumes..]
                .iter()
                .any(|volume| volume.name == grant.secret_name)
            {
                volumes.push(grant.volume());
            }
        }
    }

    ops.push(add(PointerBuf::from_tokens(["spec", "volumes"]), &volumes)?);
    Ok(Patch(ops))
}

fn try_mutate(
    state: &WebhookState,
    request: &AdmissionRequest<Pod>,
) -> Result<AdmissionResponse, MutateError> {
    let allowlist = cache::get(&state.allowlists, None, MASTER_ALLOWLIST).context(
        MissingAllowlistSnafu {
            name: MASTER_ALLOWLIST,
        },
    )?;
    let pod = request.object.as_ref().context(MissingPodSnafu)?;
    let namespace = request
        .namespace
        .as_deref()
        .or(pod.metadata.namespace.as_deref())
        .unwrap_or_default();

    let plan = plan_injection(&allowlist.spec, namespace, pod);
    let mut response = AdmissionResponse::from(request);
    if plan.is_empty() {
        tracing::info!("no Allowlist target matches, admitting pod unchanged");
        response
            .audit_annotations
            .insert(AUDIT_INJECTION_KEY.to_owned(), AUDIT_INJECTION_NONE.to_owned());
        return Ok(response);
    }

    tracing::info!(containers = plan.len(), "injecting credentials into pod");
    let mut response = response
        .with_patch(build_patch(pod, &plan)?)
        .context(SerializePatchSnafu)?;
    response
        .audit_annotations
        .insert(AUDIT_ALLOWLIST_KEY.to_owned(), MASTER_ALLOWLIST.to_owned());
    Ok(response)
}

/// Handler of `POST /mutate`. Any failure denies the pod, since admitting
/// it without its credentials is not an option.
#[tracing::instrument(skip_all, fields(uid = %request.uid, pod = %request.name))]
pub async fn mutate(state: Arc<WebhookState>, request: AdmissionRequest<Pod>) -> AdmissionResponse {
    match try_mutate(&state, &request) {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = &err as &dyn std::error::Error, "denying pod");
            let mut response = AdmissionResponse::from(&request).deny(err.to_string());
            response
                .audit_annotations
                .insert(AUDIT_ERROR_KEY.to_owned(), AUDIT_MUTATION_ERROR.to_owned());
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use kube::{core::ObjectMeta, runtime::reflector};
    use serde_json::json;

    use super::*;
    use crate::{cache::seed, crd::Allowlist, webhook::test_support::create_request};

    const ALLOWLIST: &str = indoc! {"
        logins:
          - name: db
            targets:
              - namespace: payments
                selector:
                  matchLabels:
                    app: api
          - name: cache
            targets:
              - namespace: payments
                selector:
                  matchExpressions:
                    - {key: tier, operator: In, values: [backend]}
                containers: [worker, missing]
        sshKeyPairs:
          - name: deploy
            targets:
              - namespace: payments
                selector: {}
    "};

    fn allowlist_spec() -> AllowlistSpec {
        serde_yaml::from_str(ALLOWLIST).unwrap()
    }

    fn pod_json() -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "api-0",
                "namespace": "payments",
                "labels": {"app": "api", "tier": "backend"}
            },
            "spec": {
                "containers": [
                    {"name": "api", "image": "api", "env": [{"name": "MODE", "value": "prod"}]},
                    {"name": "worker", "image": "worker"}
                ],
                "volumes": [{"name": "kube-api-access", "emptyDir": {}}]
            }
        })
    }

    fn pod() -> Pod {
        serde_json::from_value(pod_json()).unwrap()
    }

    fn state(allowlist: Option<AllowlistSpec>) -> Arc<WebhookState> {
        let (allowlists, mut writer) = reflector::store();
        if let Some(spec) = allowlist {
            seed(&mut writer, Allowlist {
                metadata: ObjectMeta {
                    name: Some(MASTER_ALLOWLIST.to_owned()),
                    ..ObjectMeta::default()
                },
                spec,
                status: None,
            });
        }
        Arc::new(WebhookState {
            allowlists,
            reserved_namespace: "g8s".to_owned(),
        })
    }

    fn names(plan: &InjectionPlan, index: usize) -> Vec<&str> {
        plan[&index]
            .iter()
            .map(|grant| grant.secret_name.as_str())
            .collect()
    }

    #[test]
    fn plan_honours_selectors_and_container_lists() {
        let plan = plan_injection(&allowlist_spec(), "payments", &pod());

        assert_eq!(names(&plan, 0), ["login-db"]);
        assert_eq!(names(&plan, 1), ["login-db", "login-cache"]);
    }

    #[test]
    fn targets_of_other_namespaces_do_not_apply() {
        assert!(plan_injection(&allowlist_spec(), "billing", &pod()).is_empty());
    }

    #[test]
    fn nothing_matches_unlabelled_pod() {
        let mut pod = pod();
        pod.metadata.labels = None;

        assert!(plan_injection(&allowlist_spec(), "payments", &pod).is_empty());
    }

    #[test]
    fn patch_preserves_existing_entries_and_ends_with_volumes() {
        let pod = pod();
        let patch =
            build_patch(&pod, &plan_injection(&allowlist_spec(), "payments", &pod)).unwrap();
        let ops = serde_json::to_value(&patch).unwrap();

        let paths: Vec<_> = ops
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, [
            "/spec/containers/0/env",
            "/spec/containers/0/volumeMounts",
            "/spec/containers/1/env",
            "/spec/containers/1/volumeMounts",
            "/spec/volumes",
        ]);
        assert!(ops.as_array().unwrap().iter().all(|op| op["op"] == "add"));

        let env = &ops[0]["value"];
        assert_eq!(env[0]["name"], "MODE");
        assert_eq!(env[1]["name"], "LOGIN_DB_USERNAME");
        assert_eq!(env[2]["name"], "LOGIN_DB_PASSWORD");
        assert_eq!(
            env[2]["valueFrom"]["secretKeyRef"],
            json!({"name": "login-db", "key": "password"})
        );

        assert_eq!(ops[3]["value"][1], json!({
            "name": "login-cache",
            "mountPath": "/var/run/secrets/g8s/login-cache",
            "readOnly": true
        }));

        let volumes: Vec<_> = ops[4]["value"]
            .as_array()
            .unwrap()
            .iter()
            .map(|volume| volume["name"].as_str().unwrap())
            .collect();
        assert_eq!(volumes, ["kube-api-access", "login-db", "login-cache"]);
    }

    #[test]
    fn injected_entries_replace_same_named_ones() {
        let mut pod = pod_json();
        pod["spec"]["containers"][0]["env"] = json!([
            {"name": "LOGIN_DB_PASSWORD", "value": "hunter2"},
            {"name": "MODE", "value": "prod"}
        ]);
        pod["spec"]["containers"][0]["volumeMounts"] = json!([
            {"name": "scratch", "mountPath": "/var/run/secrets/g8s/login-db"},
            {"name": "cache", "mountPath": "/cache"}
        ]);
        let pod: Pod = serde_json::from_value(pod).unwrap();
        let patch =
            build_patch(&pod, &plan_injection(&allowlist_spec(), "payments", &pod)).unwrap();
        let ops = serde_json::to_value(&patch).unwrap();

        let env: Vec<_> = ops[0]["value"]
            .as_array()
            .unwrap()
            .iter()
            .map(|env| env["name"].as_str().unwrap())
            .collect();
        assert_eq!(env, ["MODE", "LOGIN_DB_USERNAME", "LOGIN_DB_PASSWORD"]);
        assert!(ops[0]["value"][2].get("value").is_none());

        let mounts: Vec<_> = ops[1]["value"]
            .as_array()
            .unwrap()
            .iter()
            .map(|mount| mount["name"].as_str().unwrap())
            .collect();
        assert_eq!(mounts, ["cache", "login-db"]);
    }

    #[test]
    fn ssh_and_tls_env_names() {
        let ssh = Grant {
            kind: ResourceKind::SshKeyPair,
            secret_name: "sshkeypair-deploy".to_owned(),
        };
        let tls = Grant {
            kind: ResourceKind::SelfSignedTlsBundle,
            secret_name: "selfsignedtlsbundle-web".to_owned(),
        };

        let names = |grant: &Grant| -> Vec<String> {
            grant.env_vars().into_iter().map(|env| env.name).collect()
        };
        assert_eq!(names(&ssh), ["SSHKEYPAIR_DEPLOY_KEY", "SSHKEYPAIR_DEPLOY_PUB"]);
        assert_eq!(names(&tls), [
            "SELFSIGNEDTLSBUNDLE_WEB_KEY",
            "SELFSIGNEDTLSBUNDLE_WEB_CERT",
            "SELFSIGNEDTLSBUNDLE_WEB_CACERT"
        ]);
    }

    #[tokio::test]
    async fn matching_pod_is_patched() {
        let response = mutate(
            state(Some(allowlist_spec())),
            create_request("Pod", "pods", &pod_json()),
        )
        .await;

        assert!(response.allowed);
        assert!(response.patch.is_some());
        assert_eq!(response.audit_annotations[AUDIT_ALLOWLIST_KEY], MASTER_ALLOWLIST);
    }

    #[tokio::test]
    async fn unmatched_pod_is_admitted_unchanged() {
        let mut pod = pod_json();
        pod["metadata"]["labels"] = json!({"app": "other"});

        let response =
            mutate(state(Some(allowlist_spec())), create_request("Pod", "pods", &pod)).await;

        assert!(response.allowed);
        assert!(response.patch.is_none());
        assert_eq!(response.audit_annotations[AUDIT_INJECTION_KEY], AUDIT_INJECTION_NONE);
    }

    #[tokio::test]
    async fn missing_allowlist_denies() {
        let response = mutate(state(None), create_request("Pod", "pods", &pod_json())).await;

        assert!(!response.allowed);
        assert_eq!(response.audit_annotations[AUDIT_ERROR_KEY], AUDIT_MUTATION_ERROR);
    }
}
