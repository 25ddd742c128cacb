//! Mock Kubernetes API discovery types.

use std::collections::BTreeMap;

/// Discovery mode for the mock server.
#[derive(Debug, Clone, Copy, Default)]
pub enum DiscoveryMode {
	/// Support aggregated discovery (APIGroupDiscoveryList).
	#[default]
	Aggregated,
	/// Return 406 for aggregated discovery, forcing fallback to legacy endpoints.
	Legacy,
}

/// Pre-configured discovery responses.
#[derive(Debug, Clone)]
pub struct MockDiscovery {
	pub core_resources: Vec<MockApiResource>,
	/// Resources of named groups, keyed by group version (`apps/v1`).
	pub group_resources: BTreeMap<String, Vec<MockApiResource>>,
}

impl Default for MockDiscovery {
	/// The kinds an operator-managed observability stack touches, including the
	/// Prometheus operator and OpenShift integrations.
	fn default() -> Self {
		Self {
			core_resources: vec![
				MockApiResource::namespaced("configmaps", "ConfigMap"),
				MockApiResource::namespaced("secrets", "Secret"),
				MockApiResource::namespaced("services", "Service"),
				MockApiResource::namespaced("serviceaccounts", "ServiceAccount"),
				MockApiResource::cluster_scoped("namespaces", "Namespace"),
			],
			group_resources: BTreeMap::from([
				(
					"apps/v1".to_string(),
					vec![
						MockApiResource::namespaced("deployments", "Deployment"),
						MockApiResource::namespaced("statefulsets", "StatefulSet"),
					],
				),
				(
					"networking.k8s.io/v1".to_string(),
					vec![MockApiResource::namespaced("ingresses", "Ingress")],
				),
				(
					"rbac.authorization.k8s.io/v1".to_string(),
					vec![
						MockApiResource::cluster_scoped("clusterroles", "ClusterRole"),
						MockApiResource::cluster_scoped("clusterrolebindings", "ClusterRoleBinding"),
					],
				),
				(
					"monitoring.coreos.com/v1".to_string(),
					vec![
						MockApiResource::namespaced("servicemonitors", "ServiceMonitor"),
						MockApiResource::namespaced("prometheusrules", "PrometheusRule"),
					],
				),
				(
					"route.openshift.io/v1".to_string(),
					vec![MockApiResource::namespaced("routes", "Route")],
				),
				(
					"config.openshift.io/v1".to_string(),
					vec![MockApiResource::cluster_scoped("dnses", "DNS")],
				),
			]),
		}
	}
}

impl MockDiscovery {
	/// Stop serving a group version, as on a cluster without that integration.
	#[must_use]
	pub fn without(mut self, group_version: &str) -> Self {
		self.group_resources.remove(group_version);
		self
	}

	/// Find a resource by apiVersion and kind.
	pub fn by_kind(&self, api_version: &str, kind: &str) -> Option<&MockApiResource> {
		self.resources(api_version)?.iter().find(|r| r.kind == kind)
	}

	/// Find a resource by group version and plural name.
	pub fn by_plural(&self, group_version: &str, plural: &str) -> Option<&MockApiResource> {
		self.resources(group_version)?.iter().find(|r| r.name == plural)
	}

	fn resources(&self, group_version: &str) -> Option<&[MockApiResource]> {
		if group_version.contains('/') {
			self.group_resources.get(group_version).map(Vec::as_slice)
		} else if group_version == "v1" {
			Some(&self.core_resources)
		} else {
			None
		}
	}
}

/// A mock API resource definition.
#[derive(Debug, Clone)]
pub struct MockApiResource {
	pub name: String,
	pub kind: String,
	pub namespaced: bool,
	pub verbs: Vec<String>,
}

impl MockApiResource {
	fn new(name: &str, kind: &str, namespaced: bool) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced,
			verbs: ["create", "delete", "get", "list", "patch", "update", "watch"]
				.into_iter()
				.map(String::from)
				.collect(),
		}
	}

	pub fn namespaced(name: &str, kind: &str) -> Self {
		Self::new(name, kind, true)
	}

	pub fn cluster_scoped(name: &str, kind: &str) -> Self {
		Self::new(name, kind, false)
	}

	pub(crate) fn scope(&self) -> &'static str {
		if self.namespaced {
			"Namespaced"
		} else {
			"Cluster"
		}
	}
}
