use std::fs;
use std::path::PathBuf;
use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{OrchestratorError, Result};

static INIT: Once = Once::new();

/// Where and how verbosely to log.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Fallback filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit daily-rotated JSON logs into this directory as well
    pub log_dir: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            ansi: true,
        }
    }
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. Only the first call has an effect.
pub fn init(options: LogOptions) -> Result<()> {
    if let Some(dir) = &options.log_dir {
        fs::create_dir_all(dir)?;
    }

    let mut outcome = Ok(());
    INIT.call_once(|| {
        let console = fmt::Layer::new()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(options.ansi)
            .with_filter(filter(&options.level));

        let file = match &options.log_dir {
            Some(dir) => match tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("nexa-orchestrator")
                .filename_suffix("log")
                .build(dir)
            {
                Ok(appender) => Some(
                    fmt::Layer::new()
                        .json()
                        .with_writer(appender)
                        .with_file(true)
                        .with_line_number(true)
                        .with_target(true)
                        .with_ansi(false)
                        .with_filter(filter(&options.level)),
                ),
                Err(e) => {
                    outcome = Err(OrchestratorError::Io(e.to_string()));
                    None
                }
            },
            None => None,
        };

        let subscriber = tracing_subscriber::registry().with(console).with(file);
        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            outcome = Err(OrchestratorError::config(format!(
                "Failed to set tracing subscriber: {}",
                e
            )));
        }
    });
    outcome
}
