mod base;
mod batch;
mod destination;
mod mapping;
mod replication;
mod replicator;
mod retry;
mod source;
mod store;

pub use base::*;
pub use batch::*;
pub use destination::*;
pub use mapping::*;
pub use replication::*;
pub use replicator::*;
pub use retry::*;
pub use source::*;
pub use store::*;
