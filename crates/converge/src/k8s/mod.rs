//! Kubernetes binding of the engine.
//!
//! [`KubeBackend`] implements [`ResourceBackend`](crate::backend::ResourceBackend)
//! with dynamic `kube` APIs; [`ApiCatalog`] resolves manifest kinds and
//! installed integrations from API discovery.

mod backend;
pub mod client;
pub mod discovery;

pub use backend::KubeBackend;
pub use client::{ClusterConnection, ConnectionError};
pub use discovery::{ApiCatalog, CatalogError};
