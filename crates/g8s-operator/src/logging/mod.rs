use std::{
    io::{Sink, sink},
    path::PathBuf,
};

use snafu::{ResultExt, Snafu};
use tracing_appender::rolling::{InitError, RollingFileAppender};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{
        MakeWriter,
        writer::{EitherWriter, MakeWriterExt as _},
    },
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

pub mod controller;
pub mod k8s_events;

const MAX_LOG_FILES: usize = 6;

#[derive(Debug, Snafu)]
pub enum LoggingError {
    #[snafu(display("failed to initialize rolling file appender in {}", directory.display()))]
    InitRollingFileAppender {
        source: InitError,
        directory: PathBuf,
    },

    #[snafu(display("failed to install the global tracing subscriber"))]
    InstallSubscriber { source: TryInitError },
}

/// Initializes `tracing` logging with options from the environment variable
/// given in the `env` parameter.
///
/// If the variable is unset or invalid, the maximum log level is INFO.
///
/// Log output can be copied to a file by setting `{env}_DIRECTORY` (e.g. `G8S_LOG_DIRECTORY`)
/// to a directory path. This file will be rotated regularly.
pub fn initialize_logging(env: &str, app_name: &str) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_env(env)
        .unwrap_or_else(|_| EnvFilter::new(tracing::Level::INFO.to_string()));

    let file_appender_directory = std::env::var_os(format!("{env}_DIRECTORY")).map(PathBuf::from);
    let file_appender = file_appender_directory
        .as_deref()
        .map(|log_dir| {
            RollingFileAppender::builder()
                .filename_suffix(format!("{app_name}.log"))
                .max_log_files(MAX_LOG_FILES)
                .build(log_dir)
                .context(InitRollingFileAppenderSnafu {
                    directory: log_dir.to_path_buf(),
                })
        })
        .transpose()?;

    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout.and(OptionalMakeWriter::from(file_appender)));
    Registry::default()
        .with(filter)
        .with(fmt)
        .try_init()
        .context(InstallSubscriberSnafu)?;

    // need to delay logging until after tracing is initialized
    match file_appender_directory {
        Some(dir) => tracing::info!(directory = %dir.display(), "file logging enabled"),
        None => tracing::debug!("file logging disabled, because no log directory set"),
    }
    Ok(())
}

/// Like [`EitherWriter`] but implements [`MakeWriter`] instead of [`std::io::Write`].
/// For selecting writers depending on dynamic configuration.
enum EitherMakeWriter<A, B> {
    A(A),
    B(B),
}

impl<'a, A, B> MakeWriter<'a> for EitherMakeWriter<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = EitherWriter<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        match self {
            Self::A(a) => EitherWriter::A(a.make_writer()),
            Self::B(b) => EitherWriter::B(b.make_writer()),
        }
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        match self {
            Self::A(a) => EitherWriter::A(a.make_writer_for(meta)),
            Self::B(b) => EitherWriter::B(b.make_writer_for(meta)),
        }
    }
}

type OptionalMakeWriter<T> = EitherMakeWriter<T, fn() -> Sink>;

impl<T> From<Option<T>> for OptionalMakeWriter<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(t) => Self::A(t),
            None => Self::B(sink),
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing::{debug, error, info};

    // Sanity check only. Run with `--nocapture` to see the ERROR and INFO
    // messages, and with `G8S_LOG_TEST=debug` to see all of them.
    #[test]
    fn default_tracing_level_is_set_to_info() {
        super::initialize_logging("G8S_LOG_TEST", "test").unwrap();

        error!("ERROR level messages should be seen.");
        info!("INFO level messages should also be seen by default.");
        debug!("DEBUG level messages should be seen only if you set the G8S_LOG_TEST env var.");
    }
}
