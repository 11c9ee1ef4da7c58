mod file;
mod memory;
#[cfg(feature = "mongodb")]
mod mongodb;

pub use file::*;
pub use memory::*;
#[cfg(feature = "mongodb")]
pub use mongodb::*;
