//! Error types for the relay engine binary.
//!
//! [`EngineError`] is the top-level error type that wraps all possible
//! failure modes during startup. Anything that reaches `main` is fatal.

/// Top-level error for the relay engine binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: relay_core::config::ConfigError,
    },

    /// The snapshot source cannot serve the configured scenario.
    #[error("snapshot source error: {source}")]
    Source {
        /// The underlying source error.
        #[from]
        source: relay_core::source::SourceError,
    },

    /// The relay server failed to bind or start.
    #[error("server error: {source}")]
    Server {
        /// The underlying startup error.
        #[from]
        source: relay_server::StartupError,
    },

    /// Logging could not be initialized.
    #[error("logging error: {message}")]
    Logging {
        /// Description of the failure.
        message: String,
    },
}
