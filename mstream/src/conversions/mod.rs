//! Conversions between source representations and the engine's JSON documents.

#[cfg(feature = "mongodb")]
pub mod bson;
pub mod version;
