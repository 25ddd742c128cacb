//! Engine configuration.
//!
//! Loaded once from a YAML file. Feature gates and topology values are frozen
//! into an immutable [`ConfigSnapshot`] per pass; anything a pass discovers is
//! carried into the next snapshot with [`ConfigSnapshot::advance`].

use std::{
	fs,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::{
	apply::ConflictRetry,
	index::{Capabilities, Capability},
	reconcile::ReconcileOptions,
	status::{RequeuePolicy, SnapshotUpdate},
};

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file: {}", .path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config file: {}", .path.display())]
	Parse {
		path: PathBuf,
		#[source]
		source: serde_yaml::Error,
	},

	#[error("parsing config")]
	Invalid(#[source] serde_yaml::Error),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergeConfig {
	#[serde(default)]
	pub feature_gates: FeatureGates,

	#[serde(default)]
	pub reconcile: ReconcileSettings,

	#[serde(default)]
	pub requeue: RequeueSettings,
}

/// Optional integrations installed in the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGates {
	/// Manage `ServiceMonitor` and `PrometheusRule` objects.
	#[serde(default)]
	pub prometheus_operator: bool,

	#[serde(default)]
	pub openshift: OpenShiftGates,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenShiftGates {
	/// Manage `Route` objects.
	#[serde(default)]
	pub openshift_route: bool,

	/// Cluster base domain; looked up from the cluster when empty.
	#[serde(default)]
	pub base_domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcileSettings {
	pub max_concurrency: usize,
	pub conflict_retries: u32,
	/// Deadline of a whole pass, `0` disables it.
	pub deadline_seconds: u64,
	pub prune_after_apply_failure: bool,
}

impl Default for ReconcileSettings {
	fn default() -> Self {
		Self {
			max_concurrency: 8,
			conflict_retries: 5,
			deadline_seconds: 120,
			prune_after_apply_failure: true,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequeueSettings {
	pub base_seconds: u64,
	pub max_seconds: u64,
}

impl Default for RequeueSettings {
	fn default() -> Self {
		Self {
			base_seconds: 5,
			max_seconds: 300,
		}
	}
}

impl ConvergeConfig {
	/// Load config from a specific file path
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})
	}

	pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
		serde_yaml::from_str(content).map_err(ConfigError::Invalid)
	}

	pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
		let gates = &self.feature_gates;
		Arc::new(ConfigSnapshot {
			prometheus_operator: gates.prometheus_operator,
			openshift_route: gates.openshift.openshift_route,
			base_domain: Some(gates.openshift.base_domain.clone()).filter(|d| !d.is_empty()),
		})
	}

	pub fn options(&self) -> ReconcileOptions {
		let settings = &self.reconcile;
		ReconcileOptions::builder()
			.max_concurrency(settings.max_concurrency.max(1))
			.conflict_retry(ConflictRetry {
				retries: settings.conflict_retries,
				..ConflictRetry::default()
			})
			.maybe_deadline(
				Some(Duration::from_secs(settings.deadline_seconds))
					.filter(|d| !d.is_zero()),
			)
			.prune_after_apply_failure(settings.prune_after_apply_failure)
			.build()
	}

	pub fn requeue_policy(&self) -> RequeuePolicy {
		RequeuePolicy {
			base: Duration::from_secs(self.requeue.base_seconds),
			max: Duration::from_secs(self.requeue.max_seconds),
		}
	}
}

/// Immutable view of the configuration for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
	prometheus_operator: bool,
	openshift_route: bool,
	base_domain: Option<String>,
}

impl ConfigSnapshot {
	/// Capabilities switched on by feature gates.
	///
	/// Whether the cluster actually serves the gated kinds is checked
	/// separately, see `ApiCatalog::available_capabilities`.
	pub fn requested_capabilities(&self) -> Capabilities {
		let mut capabilities = Capabilities::none();
		if self.prometheus_operator {
			capabilities = capabilities.with(Capability::Monitoring);
		}
		if self.openshift_route {
			capabilities = capabilities.with(Capability::Routing);
		}
		capabilities
	}

	pub fn base_domain(&self) -> Option<&str> {
		self.base_domain.as_deref()
	}

	/// Snapshot for the next pass with discovered values folded in.
	pub fn advance(&self, update: &SnapshotUpdate) -> Arc<Self> {
		let mut next = self.clone();
		if let Some(domain) = &update.base_domain {
			next.base_domain = Some(domain.clone());
		}
		Arc::new(next)
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use indoc::indoc;
	use tempfile::TempDir;

	use super::*;

	#[test]
	fn test_defaults() {
		let config = ConvergeConfig::from_yaml("{}").unwrap();
		assert_eq!(config, ConvergeConfig::default());

		let options = config.options();
		assert_eq!(options.max_concurrency, 8);
		assert_eq!(options.conflict_retry.retries, 5);
		assert_eq!(options.deadline, Some(Duration::from_secs(120)));
		assert!(options.prune_after_apply_failure);
		assert_eq!(config.requeue_policy(), RequeuePolicy::default());
	}

	#[test]
	fn test_full_config() {
		let config = ConvergeConfig::from_yaml(indoc! {"
			featureGates:
			  prometheusOperator: true
			  openshift:
			    openshiftRoute: true
			    baseDomain: apps.example.com
			reconcile:
			  maxConcurrency: 2
			  deadlineSeconds: 0
			  pruneAfterApplyFailure: false
			requeue:
			  baseSeconds: 1
		"})
		.unwrap();

		let snapshot = config.snapshot();
		let caps = snapshot.requested_capabilities();
		assert!(caps.contains(Capability::Monitoring));
		assert!(caps.contains(Capability::Routing));
		assert_eq!(snapshot.base_domain(), Some("apps.example.com"));

		let options = config.options();
		assert_eq!(options.max_concurrency, 2);
		assert_eq!(options.conflict_retry.retries, 5);
		assert_eq!(options.deadline, None);
		assert!(!options.prune_after_apply_failure);

		let policy = config.requeue_policy();
		assert_eq!(policy.base, Duration::from_secs(1));
		assert_eq!(policy.max, Duration::from_secs(300));
	}

	#[test]
	fn test_advance_keeps_original_snapshot() {
		let snapshot = ConvergeConfig::default().snapshot();
		assert_eq!(snapshot.base_domain(), None);
		assert_eq!(snapshot.requested_capabilities(), Capabilities::none());

		let next = snapshot.advance(&SnapshotUpdate {
			base_domain: Some("apps.example.com".to_string()),
		});

		assert_eq!(snapshot.base_domain(), None);
		assert_eq!(next.base_domain(), Some("apps.example.com"));
		assert_eq!(next.advance(&SnapshotUpdate::default()), next);
	}

	#[test]
	fn test_load_from_file() {
		let temp = TempDir::new().unwrap();
		let path = temp.path().join("converge.yaml");
		fs::write(&path, "featureGates:\n  prometheusOperator: true\n").unwrap();

		let config = ConvergeConfig::load(&path).unwrap();
		assert!(config.feature_gates.prometheus_operator);

		assert_matches!(
			ConvergeConfig::load(&temp.path().join("missing.yaml")),
			Err(ConfigError::Read { .. })
		);

		fs::write(&path, "reconcile: [").unwrap();
		assert_matches!(ConvergeConfig::load(&path), Err(ConfigError::Parse { .. }));
	}
}
