//! Kubernetes API resource discovery.
//!
//! The catalog is built once by querying the cluster's discovery API and
//! answers two questions: which [`ResourceKind`] (with scope) a manifest
//! denotes, and which optional integrations the cluster actually serves.

use std::collections::HashMap;

use kube::{core::GroupVersionKind, Client, Discovery};
use thiserror::Error;
use tracing::instrument;

use crate::{
	index::{Capabilities, OwnedKinds},
	kind::{ResourceKind, ResourceScope},
	object::{DesiredObject, ObjectError},
};

/// Errors that can occur during API resource discovery.
#[derive(Debug, Error)]
pub enum CatalogError {
	#[error("full API discovery failed")]
	FullDiscovery(#[source] kube::Error),

	#[error("manifest missing apiVersion or kind")]
	MissingApiVersionOrKind,

	#[error("unknown resource type: {api_version}/{kind}")]
	UnknownResourceType { api_version: String, kind: String },

	#[error("building desired object")]
	Object(#[source] ObjectError),
}

/// Create a GroupVersionKind from an apiVersion string and kind.
fn gvk_from_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
	let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
	GroupVersionKind::gvk(group, version, kind)
}

/// Resource kinds served by a cluster.
#[derive(Debug, Clone, Default)]
pub struct ApiCatalog {
	kinds: HashMap<GroupVersionKind, ResourceKind>,
}

impl ApiCatalog {
	/// Build the catalog from the cluster's discovery API.
	///
	/// Uses aggregated discovery (two API calls) and falls back to full
	/// discovery for clusters that do not support it.
	#[instrument(skip_all)]
	pub async fn discover(client: &Client) -> Result<Self, CatalogError> {
		match Discovery::new(client.clone()).run_aggregated().await {
			Ok(discovery) => {
				tracing::debug!("using aggregated discovery");
				Ok(Self::from_discovery(&discovery))
			}
			Err(e) => {
				tracing::debug!(error = %e, "aggregated discovery not available, using full discovery");
				let discovery = Discovery::new(client.clone())
					.run()
					.await
					.map_err(CatalogError::FullDiscovery)?;
				Ok(Self::from_discovery(&discovery))
			}
		}
	}

	fn from_discovery(discovery: &Discovery) -> Self {
		let mut kinds = HashMap::new();
		for group in discovery.groups() {
			// All versions, not just the recommended one, so manifests may
			// use any served version.
			for version in group.versions() {
				for (ar, caps) in group.versioned_resources(version) {
					let kind = ResourceKind::from_api_resource(&ar, ResourceScope::from(&caps.scope));
					kinds.insert(kind.gvk(), kind);
				}
			}
		}
		tracing::debug!(kinds = kinds.len(), "discovered API resources");
		Self { kinds }
	}

	/// Catalog serving exactly `kinds`.
	pub fn from_kinds(kinds: impl IntoIterator<Item = ResourceKind>) -> Self {
		Self {
			kinds: kinds.into_iter().map(|k| (k.gvk(), k)).collect(),
		}
	}

	pub fn len(&self) -> usize {
		self.kinds.len()
	}

	pub fn is_empty(&self) -> bool {
		self.kinds.is_empty()
	}

	pub fn resolve(&self, api_version: &str, kind: &str) -> Result<ResourceKind, CatalogError> {
		self.kinds
			.get(&gvk_from_api_version(api_version, kind))
			.cloned()
			.ok_or_else(|| CatalogError::UnknownResourceType {
				api_version: api_version.to_string(),
				kind: kind.to_string(),
			})
	}

	/// Turn a raw manifest into a desired object of the kind it declares.
	pub fn resolve_manifest(&self, manifest: serde_json::Value) -> Result<DesiredObject, CatalogError> {
		let api_version = manifest.get("apiVersion").and_then(serde_json::Value::as_str);
		let kind = manifest.get("kind").and_then(serde_json::Value::as_str);
		let (Some(api_version), Some(kind)) = (api_version, kind) else {
			return Err(CatalogError::MissingApiVersionOrKind);
		};
		let kind = self.resolve(api_version, kind)?;
		DesiredObject::from_manifest(kind, manifest).map_err(CatalogError::Object)
	}

	pub fn serves(&self, kind: &ResourceKind) -> bool {
		self.kinds.contains_key(&kind.gvk())
	}

	/// Requested capabilities whose gated kinds are all served.
	pub fn available_capabilities(&self, requested: &Capabilities, kinds: &OwnedKinds) -> Capabilities {
		requested
			.iter()
			.filter(|capability| {
				let missing: Vec<_> = kinds
					.iter()
					.filter(|k| k.requires == Some(*capability) && !self.serves(&k.kind))
					.map(|k| k.kind.to_string())
					.collect();
				if !missing.is_empty() {
					tracing::warn!(?capability, missing = ?missing, "capability enabled but not served by the cluster");
				}
				missing.is_empty()
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use serde_json::json;

	use super::*;
	use crate::index::Capability;

	fn catalog() -> ApiCatalog {
		ApiCatalog::from_kinds([
			ResourceKind::config_map(),
			ResourceKind::ingress(),
			ResourceKind::cluster_role(),
			ResourceKind::service_monitor(),
		])
	}

	#[test]
	fn test_resolve_carries_scope() {
		let catalog = catalog();
		assert!(catalog.resolve("v1", "ConfigMap").unwrap().is_namespaced());
		assert!(!catalog
			.resolve("rbac.authorization.k8s.io/v1", "ClusterRole")
			.unwrap()
			.is_namespaced());
		assert_matches!(
			catalog.resolve("apps/v1", "Deployment"),
			Err(CatalogError::UnknownResourceType { kind, .. }) if kind == "Deployment"
		);
	}

	#[test]
	fn test_resolve_manifest() {
		let desired = catalog()
			.resolve_manifest(json!({
				"apiVersion": "networking.k8s.io/v1",
				"kind": "Ingress",
				"metadata": { "name": "query" },
				"spec": {}
			}))
			.unwrap();
		assert_eq!(desired.kind(), &ResourceKind::ingress());

		assert_matches!(
			catalog().resolve_manifest(json!({ "kind": "Ingress" })),
			Err(CatalogError::MissingApiVersionOrKind)
		);
	}

	#[test]
	fn test_capability_needs_every_gated_kind() {
		let requested = Capabilities::none()
			.with(Capability::Monitoring)
			.with(Capability::Routing);

		// PrometheusRule and Route are not served.
		let available = catalog().available_capabilities(&requested, &OwnedKinds::default());
		assert_eq!(available, Capabilities::none());

		let full = ApiCatalog::from_kinds([
			ResourceKind::service_monitor(),
			ResourceKind::prometheus_rule(),
			ResourceKind::route(),
		]);
		assert_eq!(full.available_capabilities(&requested, &OwnedKinds::default()), requested);
		assert_eq!(
			full.available_capabilities(&Capabilities::none(), &OwnedKinds::default()),
			Capabilities::none()
		);
	}
}
