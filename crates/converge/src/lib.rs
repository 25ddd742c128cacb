//! Desired-state reconciliation with ownership-based pruning.
//!
//! A pass takes the complete set of objects an owner should have, applies each
//! of them idempotently, and deletes whatever the owner still owns but no
//! longer wants. Ownership is established by labels plus a controller owner
//! reference, so the engine never needs to remember anything between passes.
//!
//! The engine is written against [`backend::ResourceBackend`]; [`k8s`] binds
//! it to a Kubernetes API server.

pub mod apply;
pub mod backend;
pub mod config;
pub mod index;
pub mod k8s;
pub mod kind;
pub mod merge;
pub mod object;
mod pool;
pub mod preflight;
pub mod prune;
pub mod reconcile;
pub mod scope;
pub mod single_flight;
pub mod status;

#[cfg(test)]
pub mod test_utils;

pub use backend::{BackendError, Deadline, ResourceBackend};
pub use kind::{ResourceKind, ResourceScope};
pub use object::{DesiredObject, ObjectKey};
pub use reconcile::{Pass, ReconcileError, ReconcileOptions, Reconciler};
pub use scope::OwnershipScope;
pub use status::ReconcileResult;
