//! Names, labels and annotations shared between the controller and the
//! webhooks.

/// API group of the g8s custom resources.
pub const API_GROUP: &str = "api.g8s.io";

/// Name used as field manager, event reporter and log file prefix.
pub const APP_NAME: &str = "g8s";

/// Namespace the controller runs in and keeps backend secrets in.
pub const DEFAULT_NAMESPACE: &str = "g8s";

/// The only Allowlist consulted by the mutating webhook.
pub const MASTER_ALLOWLIST: &str = "g8s-master";

/// Annotation put on every object the controller creates.
pub const CONTROLLER_ANNOTATION_KEY: &str = "controller";
pub const CONTROLLER_ANNOTATION_VALUE: &str = "g8s";

/// Label put on every mirrored secret.
pub const MIRROR_OWNER_LABEL_KEY: &str = "owner";
pub const MIRROR_OWNER_LABEL_VALUE: &str = MASTER_ALLOWLIST;

/// Label marking namespaces which opted into mirroring and injection.
pub const INJECTION_LABEL_KEY: &str = "g8s-injection";
pub const INJECTION_LABEL_VALUE: &str = "enabled";

/// Secret type of history secrets.
pub const HISTORY_SECRET_TYPE: &str = "g8s.io/history";

/// Suffix of history secret names.
pub const HISTORY_SECRET_SUFFIX: &str = "-history";

/// Directory injected secrets are mounted below.
pub const SECRET_MOUNT_DIRECTORY: &str = "/var/run/secrets/g8s";

/// Audit annotation keys and values set by the webhooks.
pub const AUDIT_ALLOWLIST_KEY: &str = "g8s-webhook/allowlist";
pub const AUDIT_INJECTION_KEY: &str = "g8s-webhook/injection";
pub const AUDIT_INJECTION_NONE: &str = "none";
pub const AUDIT_ERROR_KEY: &str = "g8s-webhook/error";
pub const AUDIT_MUTATION_ERROR: &str = "mutation-error";
pub const AUDIT_VALIDATION_ERROR: &str = "validation-error";

/// Routes served by the webhook role.
pub const MUTATE_PATH: &str = "/mutate";
pub const VALIDATE_PATH: &str = "/validate";

/// Environment variable holding the log filter. `G8S_LOG_DIRECTORY` enables
/// file logging.
pub const LOG_ENV: &str = "G8S_LOG";
