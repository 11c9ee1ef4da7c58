use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("`batch.bulk_size` cannot be zero")]
    BulkSizeZero,
    #[error("`batch.idle_flush_ms` cannot be zero")]
    IdleFlushIntervalZero,
    #[error("`resume_marker_interval_ms` cannot be zero")]
    ResumeMarkerIntervalZero,
    #[error("`source.database` cannot be empty")]
    MissingDatabase,
    #[error("`source.url` cannot be empty")]
    MissingSourceUrl,
    #[error("invalid Elasticsearch api version `{0}`, expected `<major>[.<minor>]`")]
    InvalidApiVersion(String),
    #[error("collection `{0}` is listed more than once")]
    DuplicateCollection(String),
    #[error("mapping for `{0}` declares `parent_type` without `parent_field`")]
    ParentTypeWithoutField(String),
    #[error("mapping for `{0}` declares `version_type` without `version_field`")]
    VersionTypeWithoutField(String),
    #[error("mapping for `{0}` has transformations that are not a JSON patch array")]
    InvalidTransformations(String),
}
