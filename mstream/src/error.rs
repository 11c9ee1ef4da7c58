use std::error;
use std::fmt;

/// Result type used across the replication engine.
pub type MstreamResult<T> = Result<T, MstreamError>;

/// Main error type of the replication engine.
///
/// An error is either a single failure, described by an [`ErrorKind`] and a static description
/// with optional dynamic detail, or an aggregate of several failures collected while operating on
/// multiple collections.
#[derive(Debug, Clone)]
pub struct MstreamError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    Many(Vec<MstreamError>),
}

/// Categories of failures, used to pick a recovery strategy.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connection Errors
    SourceConnectionFailed,
    DestinationConnectionFailed,

    // Query & Execution Errors
    SourceQueryFailed,
    DestinationQueryFailed,

    // Change Stream Errors
    ResumePositionNotFound,
    ResumeHistoryLost,

    // Mapping & Transformation Errors
    MissingMapping,
    TransformationFailed,
    ConversionError,
    InvalidData,

    // Configuration Errors
    ConfigError,

    // IO & Serialization Errors
    IoError,
    DestinationIoError,
    SerializationError,
    DeserializationError,

    // Security & Authentication Errors
    AuthenticationError,

    // State & Workflow Errors
    InvalidState,
    WorkerPanic,

    // Unknown / Uncategorized
    Unknown,
}

impl MstreamError {
    /// Creates an [`MstreamError`] aggregating multiple errors.
    pub fn many(errors: Vec<MstreamError>) -> MstreamError {
        MstreamError {
            repr: ErrorRepr::Many(errors),
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`] when
    /// the list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::Many(ref errors) => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => vec![kind],
            ErrorRepr::Many(ref errors) => errors
                .iter()
                .flat_map(|err| err.kinds())
                .collect::<Vec<_>>(),
        }
    }

    /// Returns the dynamic detail of this error, or of the first aggregated error having one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail) => Some(detail.as_str()),
            ErrorRepr::Many(ref errors) => errors.iter().find_map(|e| e.detail()),
            _ => None,
        }
    }

    /// Returns `true` when a change stream cannot be resumed from its stored position.
    ///
    /// The only way forward after such an error is a full resync of the collection.
    pub fn is_resume_position_lost(&self) -> bool {
        self.kinds().iter().any(|kind| {
            matches!(
                kind,
                ErrorKind::ResumePositionNotFound | ErrorKind::ResumeHistoryLost
            )
        })
    }
}

impl PartialEq for MstreamError {
    fn eq(&self, other: &MstreamError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::WithDescription(kind_a, _), ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::Many(errors_a), ErrorRepr::Many(errors_b)) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for MstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)?;
                f.write_str(" -> ")?;
                detail.fmt(f)
            }
            ErrorRepr::Many(ref errors) => {
                if errors.is_empty() {
                    write!(f, "Multiple errors occurred (empty)")?;
                } else if errors.len() == 1 {
                    errors[0].fmt(f)?;
                } else {
                    write!(f, "Multiple errors occurred ({} total):", errors.len())?;
                    for (i, error) in errors.iter().enumerate() {
                        write!(f, "\n  {}: {}", i + 1, error)?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl error::Error for MstreamError {}

impl From<(ErrorKind, &'static str)> for MstreamError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> MstreamError {
        MstreamError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for MstreamError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> MstreamError {
        MstreamError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl<E> From<Vec<E>> for MstreamError
where
    E: Into<MstreamError>,
{
    fn from(errors: Vec<E>) -> MstreamError {
        MstreamError {
            repr: ErrorRepr::Many(errors.into_iter().map(Into::into).collect()),
        }
    }
}

impl From<std::io::Error> for MstreamError {
    fn from(err: std::io::Error) -> MstreamError {
        MstreamError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::IoError,
                "I/O error occurred",
                err.to_string(),
            ),
        }
    }
}

/// Converts [`serde_json::Error`], classifying syntax and data errors as deserialization failures.
impl From<serde_json::Error> for MstreamError {
    fn from(err: serde_json::Error) -> MstreamError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        MstreamError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}

impl From<json_patch::PatchError> for MstreamError {
    fn from(err: json_patch::PatchError) -> MstreamError {
        MstreamError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::TransformationFailed,
                "JSON patch could not be applied",
                err.to_string(),
            ),
        }
    }
}

impl From<chrono::ParseError> for MstreamError {
    fn from(err: chrono::ParseError) -> MstreamError {
        MstreamError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::ConversionError,
                "Date parsing failed",
                err.to_string(),
            ),
        }
    }
}

impl From<tokio::task::JoinError> for MstreamError {
    fn from(err: tokio::task::JoinError) -> MstreamError {
        let (kind, description) = if err.is_panic() {
            (ErrorKind::WorkerPanic, "A background task panicked")
        } else {
            (ErrorKind::InvalidState, "A background task was cancelled")
        };

        MstreamError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}

/// Change stream error codes after which the stored resume token is unusable.
#[cfg(feature = "mongodb")]
mod mongo_codes {
    pub const CHANGE_STREAM_FATAL_ERROR: i32 = 280;
    pub const CHANGE_STREAM_HISTORY_LOST: i32 = 286;
    pub const RESUME_TOKEN_NOT_FOUND: i32 = 40585;
    pub const RESUME_TOKEN_MISMATCH: i32 = 40615;
}

/// Converts [`mongodb::error::Error`], classifying change stream resume failures.
///
/// Resume token failures map to [`ErrorKind::ResumePositionNotFound`] and
/// [`ErrorKind::ResumeHistoryLost`]; every other server error is a query failure.
#[cfg(feature = "mongodb")]
impl From<mongodb::error::Error> for MstreamError {
    fn from(err: mongodb::error::Error) -> MstreamError {
        use mongodb::error::ErrorKind as MongoErrorKind;

        let (kind, description) = match err.kind.as_ref() {
            MongoErrorKind::Command(command) => match command.code {
                mongo_codes::RESUME_TOKEN_NOT_FOUND | mongo_codes::RESUME_TOKEN_MISMATCH => (
                    ErrorKind::ResumePositionNotFound,
                    "Change stream resume token not found",
                ),
                mongo_codes::CHANGE_STREAM_HISTORY_LOST
                | mongo_codes::CHANGE_STREAM_FATAL_ERROR => (
                    ErrorKind::ResumeHistoryLost,
                    "Change stream history no longer available",
                ),
                _ => (ErrorKind::SourceQueryFailed, "MongoDB command failed"),
            },
            MongoErrorKind::Authentication { .. } => (
                ErrorKind::AuthenticationError,
                "MongoDB authentication failed",
            ),
            MongoErrorKind::ServerSelection { .. }
            | MongoErrorKind::Io(_)
            | MongoErrorKind::ConnectionPoolCleared { .. } => (
                ErrorKind::SourceConnectionFailed,
                "MongoDB connection error",
            ),
            MongoErrorKind::InvalidArgument { .. } => {
                (ErrorKind::ConfigError, "Invalid MongoDB driver argument")
            }
            MongoErrorKind::BsonDeserialization(_) => (
                ErrorKind::DeserializationError,
                "MongoDB response deserialization failed",
            ),
            MongoErrorKind::BsonSerialization(_) => (
                ErrorKind::SerializationError,
                "MongoDB request serialization failed",
            ),
            _ => (ErrorKind::SourceQueryFailed, "MongoDB operation failed"),
        };

        MstreamError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}

#[cfg(feature = "mongodb")]
impl From<bson::de::Error> for MstreamError {
    fn from(err: bson::de::Error) -> MstreamError {
        MstreamError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::DeserializationError,
                "BSON deserialization failed",
                err.to_string(),
            ),
        }
    }
}

#[cfg(feature = "mongodb")]
impl From<bson::ser::Error> for MstreamError {
    fn from(err: bson::ser::Error) -> MstreamError {
        MstreamError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::SerializationError,
                "BSON serialization failed",
                err.to_string(),
            ),
        }
    }
}

/// Converts [`reqwest::Error`], separating transport failures from failed requests.
#[cfg(feature = "elasticsearch")]
impl From<reqwest::Error> for MstreamError {
    fn from(err: reqwest::Error) -> MstreamError {
        let (kind, description) = if err.is_connect() || err.is_timeout() {
            (
                ErrorKind::DestinationConnectionFailed,
                "Elasticsearch connection error",
            )
        } else if err.is_decode() {
            (
                ErrorKind::DeserializationError,
                "Elasticsearch response could not be decoded",
            )
        } else if err.is_body() || err.is_request() {
            (ErrorKind::DestinationIoError, "Elasticsearch request failed")
        } else {
            (
                ErrorKind::DestinationQueryFailed,
                "Elasticsearch request returned an error",
            )
        };

        MstreamError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, mstream_error};

    #[test]
    fn test_error_with_detail() {
        let err = MstreamError::from((
            ErrorKind::SourceQueryFailed,
            "Count failed",
            "collection `users` is a view".to_string(),
        ));

        assert_eq!(err.kind(), ErrorKind::SourceQueryFailed);
        assert_eq!(err.detail(), Some("collection `users` is a view"));
        assert_eq!(err.kinds(), vec![ErrorKind::SourceQueryFailed]);
    }

    #[test]
    fn test_multiple_errors_keep_all_kinds() {
        let err: MstreamError = vec![
            mstream_error!(ErrorKind::SourceConnectionFailed, "Lost connection"),
            mstream_error!(ErrorKind::ResumeHistoryLost, "History gone", "oplog rolled over"),
        ]
        .into();

        assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::SourceConnectionFailed, ErrorKind::ResumeHistoryLost]
        );
        assert_eq!(err.detail(), Some("oplog rolled over"));
        assert!(err.is_resume_position_lost());
    }

    #[test]
    fn test_display_of_many() {
        let err = MstreamError::many(vec![
            mstream_error!(ErrorKind::IoError, "Disk full"),
            mstream_error!(ErrorKind::InvalidData, "Bad key", "NaN"),
        ]);

        assert_eq!(
            err.to_string(),
            "Multiple errors occurred (2 total):\n  1: IoError: Disk full\n  2: InvalidData: Bad key -> NaN"
        );
    }

    #[test]
    fn test_resume_position_lost_detection() {
        let not_found = mstream_error!(ErrorKind::ResumePositionNotFound, "Token not found");
        let transient = mstream_error!(ErrorKind::SourceConnectionFailed, "Socket closed");

        assert!(not_found.is_resume_position_lost());
        assert!(!transient.is_resume_position_lost());
    }

    #[test]
    fn test_bail_macro() {
        fn fails() -> MstreamResult<()> {
            bail!(ErrorKind::InvalidState, "Replicator retired", "users");
        }

        let err = fails().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.detail(), Some("users"));
    }

    #[test]
    fn test_json_error_conversion() {
        let err: MstreamError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();

        assert_eq!(err.kind(), ErrorKind::DeserializationError);
    }
}
