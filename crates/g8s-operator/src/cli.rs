//! Command line of the `g8s` binary.
//!
//! ```
//! use clap::Parser;
//! use g8s_operator::cli::{Command, Role, RunArguments};
//!
//! let command =
//!     Command::<RunArguments>::parse_from(["g8s", "run", "--role", "webhook", "--workers", "4"]);
//! let Command::Run(run) = command else { unreachable!() };
//! assert_eq!(run.role, Role::Webhook);
//! assert_eq!(run.workers, 4);
//! ```
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, ValueEnum};
use g8s_webhook::{
    WebhookOptions,
    constants::{DEFAULT_CERTIFICATE_PATH, DEFAULT_PRIVATE_KEY_PATH},
};

use crate::constants::DEFAULT_NAMESPACE;

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(
    name = "g8s",
    author,
    version,
    about = "Kubernetes credential controller and admission webhooks"
)]
pub enum Command<Run: Args = RunArguments> {
    /// Print CRD objects.
    Crd,

    /// Run the controller or the webhook server.
    Run(Run),
}

/// Which half of g8s this process runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    /// Reconcile credentials and mirror them into namespaces.
    #[default]
    Controller,

    /// Serve the mutating and validating admission webhooks.
    Webhook,
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RunArguments {
    #[arg(long, value_enum, env = "G8S_ROLE", default_value_t)]
    pub role: Role,

    /// Namespace holding the backend secrets. Allowlists may not target it.
    #[arg(long, env = "G8S_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Worker tasks per resource kind.
    #[arg(
        long,
        env = "G8S_WORKERS",
        default_value_t = 2,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub workers: u16,

    #[arg(long, env = "G8S_WEBHOOK_BIND_ADDRESS", default_value = "0.0.0.0:8443")]
    pub webhook_bind_address: SocketAddr,

    /// PEM certificate chain served by the webhook.
    #[arg(long, env = "G8S_TLS_CERT", default_value = DEFAULT_CERTIFICATE_PATH)]
    pub tls_cert: PathBuf,

    /// PEM private key matching `--tls-cert`.
    #[arg(long, env = "G8S_TLS_KEY", default_value = DEFAULT_PRIVATE_KEY_PATH)]
    pub tls_key: PathBuf,

    /// How long to wait for the initial list of every cache, e.g. `90s`.
    #[arg(
        long,
        env = "G8S_CACHE_SYNC_TIMEOUT",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub cache_sync_timeout: Duration,
}

impl RunArguments {
    pub fn webhook_options(&self) -> WebhookOptions {
        WebhookOptions::builder()
            .socket_addr(self.webhook_bind_address)
            .tls_mount(&self.tls_cert, &self.tls_key)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Command::<RunArguments>::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let Command::Run(run) = Command::<RunArguments>::parse_from(["g8s", "run"]) else {
            panic!("expected run");
        };

        assert_eq!(run.role, Role::Controller);
        assert_eq!(run.namespace, "g8s");
        assert_eq!(run.workers, 2);
        assert_eq!(run.cache_sync_timeout, Duration::from_secs(60));
        assert_eq!(run.webhook_options().socket_addr.port(), 8443);
    }

    #[test]
    fn zero_workers_are_rejected() {
        assert!(Command::<RunArguments>::try_parse_from(["g8s", "run", "--workers", "0"]).is_err());
    }

    #[test]
    fn crd_subcommand() {
        assert_eq!(Command::<RunArguments>::parse_from(["g8s", "crd"]), Command::Crd);
    }
}
