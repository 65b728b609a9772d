//! Device resources shared by every model caller.

pub mod manager;

pub use manager::{AcquireMode, LeaseFuture, ModelLease, ResourceError, ResourceManager};
