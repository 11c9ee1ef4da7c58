//! Coordination primitives shared by replicators and the supervisor.

pub mod pause;
pub mod shutdown;
pub mod signal;
