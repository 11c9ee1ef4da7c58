//! Destination side: bulk writes and enumeration of indexed documents.

mod base;
#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;
pub mod memory;

pub use base::*;
