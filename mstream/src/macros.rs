//! Macros for constructing and returning [`crate::error::MstreamError`] values.

/// Creates an [`crate::error::MstreamError`] from a kind, a static description and an optional
/// detail.
#[macro_export]
macro_rules! mstream_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::MstreamError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::MstreamError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Returns early with an [`crate::error::MstreamError`].
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::mstream_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::mstream_error!($kind, $desc, $detail))
    };
}
