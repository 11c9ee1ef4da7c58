//! Source side: ordered per-collection change streams and key-ordered dump cursors.

mod base;
pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongodb;

pub use base::*;
