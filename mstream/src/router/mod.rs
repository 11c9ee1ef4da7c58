//! Translation of mutation records into bulk operations.

mod index;
mod mapping;

pub use index::*;
pub use mapping::*;
