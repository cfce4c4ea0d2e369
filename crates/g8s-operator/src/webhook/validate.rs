use std::sync::Arc;

use kube::core::admission::{AdmissionRequest, AdmissionResponse};

use super::WebhookState;
use crate::{
    constants::{AUDIT_ERROR_KEY, AUDIT_VALIDATION_ERROR},
    crd::{Allowlist, AllowlistSpec},
    selector::LabelSelectorExt as _,
};

/// Every offense of `spec`, in target order. A target may contribute
/// several.
pub fn offenses(spec: &AllowlistSpec, reserved_namespace: &str) -> Vec<String> {
    let mut offenses = Vec::new();
    for target in spec.targets() {
        if target.target.namespace == reserved_namespace {
            offenses.push(format!(
                "Cannot target {reserved_namespace} namespace: {}",
                target.path()
            ));
        }
        if target.target.selector.validate().is_err() {
            offenses.push(format!("Invalid Selector: {}", target.path()));
        }
    }
    offenses
}

/// Handler of `POST /validate`.
#[tracing::instrument(skip_all, fields(uid = %request.uid, allowlist = %request.name))]
pub async fn validate(
    state: Arc<WebhookState>,
    request: AdmissionRequest<Allowlist>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(&request);
    let Some(allowlist) = &request.object else {
        return response;
    };

    let offenses = offenses(&allowlist.spec, &state.reserved_namespace);
    if offenses.is_empty() {
        return response;
    }

    let message = offenses.join("; ");
    tracing::info!(%message, "rejecting Allowlist");
    let mut response = response.deny(message);
    response
        .audit_annotations
        .insert(AUDIT_ERROR_KEY.to_owned(), AUDIT_VALIDATION_ERROR.to_owned());
    response
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use kube::runtime::reflector;
    use serde_json::json;

    use super::*;
    use crate::webhook::test_support::create_request;

    fn spec(yaml: &str) -> AllowlistSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn valid_allowlist_has_no_offenses() {
        let spec = spec(indoc! {"
            logins:
              - name: db
                targets:
                  - namespace: payments
                    selector:
                      matchExpressions:
                        - {key: app, operator: Exists}
        "});

        assert!(offenses(&spec, "g8s").is_empty());
    }

    #[test]
    fn every_offense_is_reported() {
        let spec = spec(indoc! {"
            logins:
              - name: db
                targets:
                  - namespace: payments
                  - namespace: g8s
            sshKeyPairs:
              - name: deploy
                targets:
                  - namespace: g8s
                    selector:
                      matchExpressions:
                        - {key: app, operator: Near, values: [x]}
        "});

        assert_eq!(offenses(&spec, "g8s"), [
            "Cannot target g8s namespace: .spec.logins[0].targets[1]",
            "Cannot target g8s namespace: .spec.sshKeyPairs[0].targets[0]",
            "Invalid Selector: .spec.sshKeyPairs[0].targets[0]",
        ]);
    }

    #[test]
    fn malformed_match_labels_are_an_offense() {
        let spec = spec(indoc! {r#"
            logins:
              - name: db
                targets:
                  - namespace: payments
                    selector:
                      matchLabels:
                        "bad key!": "not a valid value?"
        "#});

        assert_eq!(offenses(&spec, "g8s"), ["Invalid Selector: .spec.logins[0].targets[0]"]);
    }

    #[tokio::test]
    async fn reserved_namespace_is_denied() {
        let (allowlists, _writer) = reflector::store();
        let state = Arc::new(WebhookState {
            allowlists,
            reserved_namespace: "g8s".to_owned(),
        });
        let allowlist = json!({
            "apiVersion": "api.g8s.io/v1alpha1",
            "kind": "Allowlist",
            "metadata": {"name": "g8s-master"},
            "spec": {
                "selfSignedTLSBundles": [
                    {"name": "web", "targets": [{"namespace": "g8s"}]}
                ]
            }
        });

        let response = validate(state, create_request("Allowlist", "allowlists", &allowlist)).await;

        assert!(!response.allowed);
        assert_eq!(
            response.result.message,
            "Cannot target g8s namespace: .spec.selfSignedTLSBundles[0].targets[0]"
        );
        assert_eq!(response.audit_annotations[AUDIT_ERROR_KEY], AUDIT_VALIDATION_ERROR);
    }
}
