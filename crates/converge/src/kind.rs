//! Resource kinds and their scope.
//!
//! Every kind the engine touches carries its [`ResourceScope`] from the moment
//! it is constructed, so the applier never has to inspect a payload to decide
//! whether an object gets a namespace and an owner reference.

use std::fmt;

use kube::{
	core::GroupVersionKind,
	discovery::{ApiResource, Scope},
};

/// Kubernetes API resource scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceScope {
	/// Resource is namespaced (e.g., Deployment, ConfigMap).
	Namespaced,

	/// Resource is cluster-wide (e.g., Namespace, ClusterRole).
	ClusterWide,
}

impl From<&Scope> for ResourceScope {
	fn from(scope: &Scope) -> Self {
		match scope {
			Scope::Namespaced => ResourceScope::Namespaced,
			Scope::Cluster => ResourceScope::ClusterWide,
		}
	}
}

/// A resource kind together with everything needed to address it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKind {
	pub group: String,
	pub version: String,
	pub kind: String,
	/// Plural resource name used in API paths (e.g. `ingresses`).
	pub plural: String,
	pub scope: ResourceScope,
}

impl ResourceKind {
	pub fn new(
		group: impl Into<String>,
		version: impl Into<String>,
		kind: impl Into<String>,
		plural: impl Into<String>,
		scope: ResourceScope,
	) -> Self {
		Self {
			group: group.into(),
			version: version.into(),
			kind: kind.into(),
			plural: plural.into(),
			scope,
		}
	}

	/// Build a kind from a discovered API resource.
	pub fn from_api_resource(ar: &ApiResource, scope: ResourceScope) -> Self {
		Self::new(&ar.group, &ar.version, &ar.kind, &ar.plural, scope)
	}

	pub fn api_version(&self) -> String {
		if self.group.is_empty() {
			self.version.clone()
		} else {
			format!("{}/{}", self.group, self.version)
		}
	}

	pub fn gvk(&self) -> GroupVersionKind {
		GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
	}

	pub fn api_resource(&self) -> ApiResource {
		ApiResource::from_gvk_with_plural(&self.gvk(), &self.plural)
	}

	pub fn is_namespaced(&self) -> bool {
		self.scope == ResourceScope::Namespaced
	}

	/// Whether `api_version`/`kind` taken from a manifest denote this kind.
	pub fn matches(&self, api_version: &str, kind: &str) -> bool {
		self.kind == kind && self.api_version() == api_version
	}

	pub fn ingress() -> Self {
		Self::new(
			"networking.k8s.io",
			"v1",
			"Ingress",
			"ingresses",
			ResourceScope::Namespaced,
		)
	}

	pub fn route() -> Self {
		Self::new(
			"route.openshift.io",
			"v1",
			"Route",
			"routes",
			ResourceScope::Namespaced,
		)
	}

	pub fn service_monitor() -> Self {
		Self::new(
			"monitoring.coreos.com",
			"v1",
			"ServiceMonitor",
			"servicemonitors",
			ResourceScope::Namespaced,
		)
	}

	pub fn prometheus_rule() -> Self {
		Self::new(
			"monitoring.coreos.com",
			"v1",
			"PrometheusRule",
			"prometheusrules",
			ResourceScope::Namespaced,
		)
	}

	pub fn config_map() -> Self {
		Self::new("", "v1", "ConfigMap", "configmaps", ResourceScope::Namespaced)
	}

	pub fn secret() -> Self {
		Self::new("", "v1", "Secret", "secrets", ResourceScope::Namespaced)
	}

	pub fn service() -> Self {
		Self::new("", "v1", "Service", "services", ResourceScope::Namespaced)
	}

	pub fn deployment() -> Self {
		Self::new(
			"apps",
			"v1",
			"Deployment",
			"deployments",
			ResourceScope::Namespaced,
		)
	}

	pub fn cluster_role() -> Self {
		Self::new(
			"rbac.authorization.k8s.io",
			"v1",
			"ClusterRole",
			"clusterroles",
			ResourceScope::ClusterWide,
		)
	}

	pub fn cluster_role_binding() -> Self {
		Self::new(
			"rbac.authorization.k8s.io",
			"v1",
			"ClusterRoleBinding",
			"clusterrolebindings",
			ResourceScope::ClusterWide,
		)
	}

	/// OpenShift cluster DNS configuration, holds the cluster base domain.
	pub fn openshift_dns() -> Self {
		Self::new(
			"config.openshift.io",
			"v1",
			"DNS",
			"dnses",
			ResourceScope::ClusterWide,
		)
	}
}

impl fmt::Display for ResourceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.group.is_empty() {
			write!(f, "{}", self.kind)
		} else {
			write!(f, "{}.{}", self.kind, self.group)
		}
	}
}
