pub mod config;
pub mod index;
pub mod provider;
pub mod qr;
pub mod service;
pub mod storage;
pub mod txlog;

use crate::config::LoggingConfig;
use tracing_subscriber::{prelude::*, EnvFilter};

pub use provider::NodeProvider;
pub use qr::QrClient;
pub use service::{ServiceManager, ServiceState};

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(logging: &LoggingConfig) -> std::io::Result<()> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let result = if logging.log_to_file {
        let path = std::path::Path::new(&logging.log_file_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let file_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file));
        let stdout_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(filter())
            .with(file_appender)
            .with(stdout_appender)
            .try_init()
    } else {
        let stdout_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(filter())
            .with(stdout_appender)
            .try_init()
    };

    if let Err(e) = result {
        // a subscriber installed earlier (tests, embedding) keeps working
        eprintln!("Logging already initialised: {}", e);
    }
    Ok(())
}
