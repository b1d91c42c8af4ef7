//! Error types for the reconciliation engine.
//!
//! Every failure carries a [`ErrorKind`] from a closed set and a *site*, the
//! logical component that produced it. Multi-cause failures (parallel context
//! fan-out, cold-mode recovery, non-strict prune) are reported through
//! [`Error::Aggregate`], which preserves each cause in order and takes the
//! kind of its most severe cause.

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// API misuse, e.g. an operation that requires a daemon client ran without one
    Precondition,
    /// Manifest-level problem detected at runtime, e.g. an unsafe target path
    InvalidInput,
    /// Failure of an outside system: daemon call, secret decryption, filesystem
    External,
    /// Self-inconsistency, e.g. failing to encode a value we just built
    Internal,
    /// A requested entity is absent; used for soft-warning cases
    NotFound,
}

impl ErrorKind {
    /// Severity rank used when an aggregate promotes the kind of its worst cause.
    fn severity(self) -> u8 {
        match self {
            Self::External => 4,
            Self::Internal => 3,
            Self::Precondition => 2,
            Self::InvalidInput => 1,
            Self::NotFound => 0,
        }
    }

    /// Short lowercase tag, as rendered in error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Precondition => "precondition",
            Self::InvalidInput => "invalid input",
            Self::External => "external",
            Self::Internal => "internal",
            Self::NotFound => "not found",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for all engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// API misuse detected before any side effect
    #[error("{site}: {message}")]
    Precondition {
        /// Logical source of the error
        site: &'static str,
        /// What was violated
        message: String,
    },

    /// Manifest-level problem detected at runtime
    #[error("{site}: {message}")]
    InvalidInput {
        /// Logical source of the error
        site: &'static str,
        /// What was invalid
        message: String,
    },

    /// An outside system failed: daemon call, decryption, filesystem
    #[error("{site}: {message}")]
    External {
        /// Logical source of the error
        site: &'static str,
        /// What failed
        message: String,
        /// Underlying cause, when one exists
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The engine contradicted itself
    #[error("{site}: {message}")]
    Internal {
        /// Logical source of the error
        site: &'static str,
        /// What went wrong
        message: String,
    },

    /// A requested entity is absent
    #[error("{site}: {message}")]
    NotFound {
        /// Logical source of the error
        site: &'static str,
        /// What was missing
        message: String,
    },

    /// Multiple causes reported as one failure
    #[error("{0}")]
    Aggregate(AggregateError),
}

impl Error {
    /// Create a precondition error
    pub fn precondition(site: &'static str, message: impl Into<String>) -> Self {
        Self::Precondition {
            site,
            message: message.into(),
        }
    }

    /// Create an invalid-input error
    pub fn invalid_input(site: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            site,
            message: message.into(),
        }
    }

    /// Create an external error without an underlying source
    pub fn external(site: &'static str, message: impl Into<String>) -> Self {
        Self::External {
            site,
            message: message.into(),
            source: None,
        }
    }

    /// Create an external error wrapping an underlying cause
    pub fn external_with(
        site: &'static str,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            site,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error
    pub fn internal(site: &'static str, message: impl Into<String>) -> Self {
        Self::Internal {
            site,
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(site: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            site,
            message: message.into(),
        }
    }

    /// Build an aggregate from an ordered list of `(operation, cause)` pairs.
    ///
    /// Returns the single cause unchanged when the list has exactly one entry,
    /// so call sites never produce one-element aggregates.
    #[must_use]
    pub fn aggregate(mut causes: Vec<(String, Error)>) -> Self {
        debug_assert!(!causes.is_empty());
        if causes.len() == 1 {
            let (_, err) = causes.remove(0);
            return err;
        }
        Self::Aggregate(AggregateError { causes })
    }

    /// The kind of this error. Aggregates report their most severe cause.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Precondition { .. } => ErrorKind::Precondition,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::External { .. } => ErrorKind::External,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Aggregate(agg) => agg.kind(),
        }
    }

    /// The logical site that produced this error (first cause for aggregates).
    #[must_use]
    pub fn site(&self) -> &str {
        match self {
            Self::Precondition { site, .. }
            | Self::InvalidInput { site, .. }
            | Self::External { site, .. }
            | Self::Internal { site, .. }
            | Self::NotFound { site, .. } => site,
            Self::Aggregate(agg) => agg.causes.first().map_or("aggregate", |(_, e)| e.site()),
        }
    }
}

/// A multi-cause failure preserving each cause and the operation it came from.
#[derive(Debug)]
pub struct AggregateError {
    /// Ordered `(operation, cause)` pairs
    pub causes: Vec<(String, Error)>,
}

impl AggregateError {
    /// Kind of the most severe cause.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.causes
            .iter()
            .map(|(_, e)| e.kind())
            .max_by_key(|k| k.severity())
            .unwrap_or(ErrorKind::Internal)
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} errors:", self.causes.len())?;
        for (op, err) in &self.causes {
            write!(f, " [{op}: {err}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::External {
            site: "io",
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(Error::precondition("x", "m").kind(), ErrorKind::Precondition);
        assert_eq!(Error::invalid_input("x", "m").kind(), ErrorKind::InvalidInput);
        assert_eq!(Error::external("x", "m").kind(), ErrorKind::External);
        assert_eq!(Error::internal("x", "m").kind(), ErrorKind::Internal);
        assert_eq!(Error::not_found("x", "m").kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_aggregate_takes_most_severe_kind() {
        let agg = Error::aggregate(vec![
            (
                "restart".to_string(),
                Error::not_found("applier", "no container"),
            ),
            ("sync".to_string(), Error::external("fileset", "tar failed")),
            ("encode".to_string(), Error::internal("index", "json")),
        ]);
        assert_eq!(agg.kind(), ErrorKind::External);
    }

    #[test]
    fn test_single_cause_collapses() {
        let err = Error::aggregate(vec![(
            "sync".to_string(),
            Error::external("fileset", "boom"),
        )]);
        assert!(matches!(err, Error::External { .. }));
    }

    #[test]
    fn test_aggregate_display_preserves_operations() {
        let err = Error::aggregate(vec![
            ("sync".to_string(), Error::external("fileset", "tar failed")),
            (
                "restart".to_string(),
                Error::external("fileset", "start failed"),
            ),
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("sync"));
        assert!(rendered.contains("restart"));
        assert!(rendered.contains("tar failed"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert_eq!(err.kind(), ErrorKind::External);
        assert!(err.to_string().contains("file not found"));
    }
}
