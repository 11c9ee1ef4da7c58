//! Durable per-collection replication state: change stream resume markers and dump progress.

pub mod both;
pub mod progress;
pub mod resume;
