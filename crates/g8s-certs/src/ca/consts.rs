use std::time::Duration;

/// The default CA validity time span of 365 days.
pub const DEFAULT_CA_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// The default leaf certificate validity time span of 365 days.
pub const DEFAULT_CERTIFICATE_VALIDITY: Duration = DEFAULT_CA_VALIDITY;

/// The organization every generated subject carries.
pub const SUBJECT_ORGANIZATION: &str = "g8s";

/// The root CA subject name used when no subject is provided.
pub const DEFAULT_CA_SUBJECT: &str = "O=g8s";
