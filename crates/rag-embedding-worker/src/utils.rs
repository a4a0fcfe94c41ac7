use anyhow::Result;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes a stdout + rolling-file subscriber. Level comes from
/// `RUST_LOG` (default `info,rag_embedding_worker=debug`), format from
/// `LOG_FORMAT` (`pretty` or `json`, default `pretty`).
pub fn init_logger() -> Result<()> {
    let log_level =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,rag_embedding_worker=debug".to_string());
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("ingest")
        .filename_suffix("log")
        .build("logs")?;

    let filter = EnvFilter::try_new(&log_level)?;

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stdout))
                .with(fmt::layer().json().with_writer(file_appender).with_ansi(false))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty().with_writer(std::io::stdout))
                .with(fmt::layer().with_writer(file_appender).with_ansi(false))
                .init();
        }
    }

    Ok(())
}
