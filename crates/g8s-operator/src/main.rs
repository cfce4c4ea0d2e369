use clap::Parser as _;
use g8s_operator::{
    cli::{Command, Role, RunArguments},
    constants::{APP_NAME, LOG_ENV},
    controller, crd,
    logging::{self, initialize_logging},
};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::LoggingError },

    #[snafu(display("failed to print CRDs"))]
    PrintCrds { source: crd::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to run {role}"))]
    Run {
        source: controller::Error,
        role: Role,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    match Command::<RunArguments>::parse() {
        Command::Crd => crd::write_crds(std::io::stdout().lock()).context(PrintCrdsSnafu),
        Command::Run(args) => {
            initialize_logging(LOG_ENV, APP_NAME).context(InitializeLoggingSnafu)?;
            tracing::info!(
                role = %args.role,
                namespace = %args.namespace,
                version = env!("CARGO_PKG_VERSION"),
                "starting {APP_NAME}"
            );

            let client = kube::Client::try_default()
                .await
                .context(CreateClientSnafu)?;
            match args.role {
                Role::Controller => controller::run_controller(client, &args).await,
                Role::Webhook => controller::run_webhook(client, &args).await,
            }
            .context(RunSnafu { role: args.role })
        }
    }
}
