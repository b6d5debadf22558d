//! Tracing setup: console plus an optional per-session log file.

use tracing_subscriber::{fmt, layer::SubscriberExt};

struct Guard {}

impl Drop for Guard {
    fn drop(&mut self) {}
}

/// Start logging to console and, if a path is given, to a file in the
/// session directory.
pub fn initiate_logging<P: AsRef<std::path::Path>>(
    path: Option<P>,
) -> Result<impl Drop, Box<dyn std::error::Error + Send + Sync + 'static>> {
    let file_layer = if let Some(path) = &path {
        let file = std::fs::File::create(path)?;
        let file_writer = std::sync::Mutex::new(file);
        Some(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    let console_layer = fmt::layer().with_ansi(!cfg!(windows));

    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new("info"));

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(filter);
    tracing::subscriber::set_global_default(collector)?;

    if let Some(path) = &path {
        tracing::debug!("logging to file \"{}\"", path.as_ref().display());
    }

    Ok(Guard {})
}
