//! Crate-wide error type.
//!
//! Only startup and configuration problems surface as [`Error`]. Failures
//! inside a background job (a missing file, an undecodable image) are
//! absorbed by the job and become a not-found reply.

use std::io;

/// Errors returned by fallible setup and I/O paths.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An underlying I/O operation failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file is not valid TOML for [`Config`](crate::config::Config).
    #[error("failed to parse config: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// A named thread could not be started.
    #[error("failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        /// Name the thread would have had.
        name: String,
        /// Error from the OS.
        source: io::Error,
    },

    /// A listen address could not be parsed.
    #[error("invalid address: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// Decoding or encoding an image failed.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// A zoom request could not be turned into an image.
    #[error("zoom failed: {0}")]
    Zoom(String),

    /// The global tracing subscriber was already installed.
    #[error("failed to install logger: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),

    /// A long-running thread stopped while the server was still up.
    #[error("thread {0} exited unexpectedly")]
    ThreadExited(String),

    /// The signal handler could not be installed.
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

/// Shorthand for results carrying [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::Config("workers must be > 0".to_string());
        assert_eq!(err.to_string(), "invalid configuration: workers must be > 0");

        let err = Error::ThreadSpawn {
            name: "ccache-bio-0".to_string(),
            source: io::Error::new(io::ErrorKind::Other, "no threads left"),
        };
        assert_eq!(
            err.to_string(),
            "failed to spawn thread ccache-bio-0: no threads left"
        );
    }

    #[test]
    fn test_from_io() {
        let err: Error = io::Error::from(io::ErrorKind::NotFound).into();
        assert!(matches!(err, Error::Io(_)));
    }
}
