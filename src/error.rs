//! Fatal startup errors and their exit codes.
//!
//! Everything after startup is handled in place (numeric reply, SQUIT,
//! connection exit); only the errors here terminate the process, each
//! with a distinct exit code so init scripts can tell them apart.

use thiserror::Error;

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum FatalError {
    /// The PID file exists and its recorded process is still alive, or
    /// it could not be created.
    #[error("pid file {path}: {detail}")]
    PidFile { path: String, detail: String },

    /// The configuration file could not be read.
    #[error("cannot read configuration {path}: {source}")]
    ConfigUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file did not parse or validate.
    #[error("configuration error: {0}")]
    ConfigParse(#[from] crate::config::ConfigError),

    /// Listen or connection limits cannot be satisfied.
    #[error("connection limits: {0}")]
    Limits(String),
}

impl FatalError {
    /// Exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::PidFile { .. } => 2,
            FatalError::ConfigUnreadable { .. } => 5,
            FatalError::ConfigParse(_) => 7,
            FatalError::Limits(_) => 9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errs = [
            FatalError::PidFile {
                path: "x".into(),
                detail: "y".into(),
            }
            .exit_code(),
            FatalError::ConfigUnreadable {
                path: "x".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            }
            .exit_code(),
            FatalError::Limits("too low".into()).exit_code(),
        ];
        let mut dedup = errs.to_vec();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), errs.len());
    }
}
