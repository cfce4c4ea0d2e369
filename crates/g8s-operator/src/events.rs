//! Kubernetes events emitted on declared resources.
use kube::runtime::events::{Event, EventType};

use crate::crd::ResourceKind;

const RECONCILE_ACTION: &str = "Reconcile";

/// Reason of every event the controller emits, mapped to its message.
#[derive(Clone, Debug, PartialEq, Eq, strum::IntoStaticStr)]
pub enum EventReason {
    Synced,
    Deleted,
    ErrResourceExists { resource: String, kind: ResourceKind },
}

impl EventReason {
    pub fn reason(&self) -> &'static str {
        self.into()
    }

    pub fn message(&self) -> String {
        match self {
            Self::Synced => "Resource synced successfully".to_owned(),
            Self::Deleted => "Resource and all dependent objects deleted successfully".to_owned(),
            Self::ErrResourceExists { resource, kind } => {
                format!("Resource {resource:?} already exists and is not managed by {kind}")
            }
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Self::Synced | Self::Deleted => EventType::Normal,
            Self::ErrResourceExists { .. } => EventType::Warning,
        }
    }

    pub fn to_event(&self) -> Event {
        Event {
            type_: self.event_type(),
            reason: self.reason().to_owned(),
            note: Some(self.message()),
            action: RECONCILE_ACTION.to_owned(),
            secondary: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_variant_names() {
        assert_eq!(EventReason::Synced.reason(), "Synced");
        assert_eq!(
            EventReason::ErrResourceExists {
                resource: "login-db".to_owned(),
                kind: ResourceKind::Login,
            }
            .reason(),
            "ErrResourceExists"
        );
    }

    #[test]
    fn conflict_message_names_resource_and_manager() {
        let reason = EventReason::ErrResourceExists {
            resource: "sshkeypair-deploy".to_owned(),
            kind: ResourceKind::SshKeyPair,
        };

        assert_eq!(
            reason.message(),
            "Resource \"sshkeypair-deploy\" already exists and is not managed by SSHKeyPair"
        );
        assert!(matches!(reason.to_event().type_, EventType::Warning));
    }
}
