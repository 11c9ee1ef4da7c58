//! Replication of document collections into a search index.
//!
//! Each collection is dumped in key order, then tailed through its change stream. Changes are
//! turned into bulk operations by the [`router::IndexRouter`] and sent by a per-collection
//! [`dispatcher::BatchDispatcher`]. Resume markers and dump progress are persisted so that a
//! restart continues where the previous run stopped.

pub mod concurrency;
pub mod context;
pub mod conversions;
pub mod destination;
pub mod dispatcher;
pub mod error;
mod macros;
pub mod replication;
pub mod router;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod types;
