use anyhow::Context;
use configuration::LogSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber: human-readable lines on stdout plus JSON
/// lines in a file under `settings.dir` that rolls over every day.
///
/// `RUST_LOG` wins over the configured level. The returned guard flushes the
/// file writer when dropped, so keep it alive until the process exits.
pub fn init(settings: &LogSettings) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&settings.dir)
        .with_context(|| format!("failed to create log dir {}", settings.dir.display()))?;

    let appender = tracing_appender::rolling::daily(&settings.dir, &settings.file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let default_level = if settings.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(settings.debug))
        .with(fmt::layer().json().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("failed to install the tracing subscriber")?;

    Ok(guard)
}
