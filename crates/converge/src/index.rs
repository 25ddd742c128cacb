//! Ownership index.
//!
//! Finds every object that belongs to one owner instance by listing a fixed
//! set of kinds with the owner's label selector. Some kinds only exist when an
//! optional integration is installed; those are gated by a [`Capability`] and
//! are not queried at all when the capability is off.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::instrument;

use crate::{
	backend::{BackendError, Deadline, ResourceBackend},
	kind::ResourceKind,
	object::ObjectKey,
	scope::OwnershipScope,
};

/// Optional integration that gates some owned kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
	/// Prometheus operator (`ServiceMonitor`, `PrometheusRule`).
	Monitoring,
	/// OpenShift routes (`Route`).
	Routing,
}

/// Set of enabled capabilities, resolved before the pass starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
	pub fn none() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with(mut self, capability: Capability) -> Self {
		self.0.insert(capability);
		self
	}

	pub fn contains(&self, capability: Capability) -> bool {
		self.0.contains(&capability)
	}

	pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
		self.0.iter().copied()
	}
}

impl FromIterator<Capability> for Capabilities {
	fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
		Self(iter.into_iter().collect())
	}
}

/// A kind that may hold owned objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedKind {
	pub kind: ResourceKind,
	/// Capability that must be enabled for this kind to be queried.
	pub requires: Option<Capability>,
}

/// Enumeration of kinds the ownership index queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedKinds(Vec<OwnedKind>);

impl Default for OwnedKinds {
	/// Kinds that can be switched on and off by the owner's spec and therefore
	/// need pruning: ingresses always, monitoring objects and routes when their
	/// integrations are installed.
	fn default() -> Self {
		Self::empty()
			.always(ResourceKind::ingress())
			.gated(ResourceKind::service_monitor(), Capability::Monitoring)
			.gated(ResourceKind::prometheus_rule(), Capability::Monitoring)
			.gated(ResourceKind::route(), Capability::Routing)
	}
}

impl OwnedKinds {
	pub fn empty() -> Self {
		Self(Vec::new())
	}

	#[must_use]
	pub fn always(mut self, kind: ResourceKind) -> Self {
		self.0.push(OwnedKind {
			kind,
			requires: None,
		});
		self
	}

	#[must_use]
	pub fn gated(mut self, kind: ResourceKind, capability: Capability) -> Self {
		self.0.push(OwnedKind {
			kind,
			requires: Some(capability),
		});
		self
	}

	pub fn iter(&self) -> impl Iterator<Item = &OwnedKind> {
		self.0.iter()
	}

	/// Kinds to query given the enabled capabilities.
	pub fn eligible<'a>(
		&'a self,
		capabilities: &'a Capabilities,
	) -> impl Iterator<Item = &'a ResourceKind> + 'a {
		self.0
			.iter()
			.filter(|k| k.requires.is_none_or(|c| capabilities.contains(c)))
			.map(|k| &k.kind)
	}
}

/// An object found in the backend that belongs to the current owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedObjectRecord {
	pub uid: String,
	pub key: ObjectKey,
}

/// Owned objects keyed by uid. Rebuilt at the start of every pass.
#[derive(Debug, Clone, Default)]
pub struct OwnedIndex {
	records: BTreeMap<String, OwnedObjectRecord>,
}

impl OwnedIndex {
	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	pub fn get(&self, uid: &str) -> Option<&OwnedObjectRecord> {
		self.records.get(uid)
	}

	pub fn iter(&self) -> impl Iterator<Item = &OwnedObjectRecord> {
		self.records.values()
	}

	fn insert(&mut self, record: OwnedObjectRecord) {
		self.records.insert(record.uid.clone(), record);
	}
}

impl FromIterator<OwnedObjectRecord> for OwnedIndex {
	fn from_iter<T: IntoIterator<Item = OwnedObjectRecord>>(iter: T) -> Self {
		let mut index = Self::default();
		for record in iter {
			index.insert(record);
		}
		index
	}
}

/// Listing one of the owned kinds failed; the whole index is unusable.
#[derive(Debug, Error)]
#[error("listing {kind} owned by {owner}")]
pub struct DiscoveryError {
	pub kind: String,
	pub owner: String,
	#[source]
	pub source: BackendError,
}

/// Build the ownership index for `scope`.
///
/// Any failed list aborts discovery: deletion decisions must never be based on
/// a partial index.
#[instrument(skip_all, fields(owner = %scope))]
pub async fn discover<B: ResourceBackend>(
	backend: &B,
	scope: &OwnershipScope,
	kinds: &OwnedKinds,
	capabilities: &Capabilities,
	deadline: Deadline,
) -> Result<OwnedIndex, DiscoveryError> {
	let mut index = OwnedIndex::default();
	if scope.labels().is_empty() {
		tracing::warn!("owner has no ownership labels, nothing is considered owned");
		return Ok(index);
	}
	let selector = scope.selector();

	for kind in kinds.eligible(capabilities) {
		let objects = deadline
			.run(backend.list(kind, scope.namespace(), &selector))
			.await
			.map_err(|source| DiscoveryError {
				kind: kind.to_string(),
				owner: scope.to_string(),
				source,
			})?;

		tracing::debug!(kind = %kind, count = objects.len(), "listed owned objects");

		for object in objects {
			let meta = &object.metadata;
			let name = meta.name.clone().unwrap_or_default();

			let Some(uid) = meta.uid.clone().filter(|uid| !uid.is_empty()) else {
				tracing::warn!(kind = %kind, name = %name, "ignoring object without uid");
				continue;
			};

			if !scope.carries_marker(meta.labels.as_ref()) {
				tracing::debug!(kind = %kind, name = %name, "ignoring object without ownership labels");
				continue;
			}

			if let Some(other) = scope.foreign_controller(meta) {
				tracing::warn!(
					kind = %kind,
					name = %name,
					controller = %other.name,
					"ignoring object controlled by another owner"
				);
				continue;
			}

			let namespace = kind.is_namespaced().then(|| {
				meta.namespace
					.clone()
					.unwrap_or_else(|| scope.namespace().to_string())
			});
			index.insert(OwnedObjectRecord {
				uid,
				key: ObjectKey::new(kind.clone(), namespace, name),
			});
		}
	}

	Ok(index)
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use rstest::rstest;

	use super::*;
	use crate::test_utils::{owned, scope_for, Call, MemoryBackend};

	#[rstest]
	#[case(Capabilities::none(), &["Ingress"])]
	#[case(Capabilities::none().with(Capability::Monitoring), &["Ingress", "ServiceMonitor", "PrometheusRule"])]
	#[case(Capabilities::none().with(Capability::Routing), &["Ingress", "Route"])]
	#[case(
		Capabilities::none().with(Capability::Monitoring).with(Capability::Routing),
		&["Ingress", "ServiceMonitor", "PrometheusRule", "Route"]
	)]
	fn test_eligible_kinds(#[case] caps: Capabilities, #[case] expected: &[&str]) {
		let kinds = OwnedKinds::default();
		let eligible: Vec<_> = kinds.eligible(&caps).map(|k| k.kind.as_str()).collect();
		assert_eq!(eligible, expected);
	}

	#[tokio::test]
	async fn test_gated_kinds_are_not_queried() {
		let backend = MemoryBackend::new();
		let scope = scope_for("simplest", "uid-a");

		discover(
			&backend,
			&scope,
			&OwnedKinds::default(),
			&Capabilities::none(),
			Deadline::none(),
		)
		.await
		.unwrap();

		let listed: Vec<_> = backend
			.calls()
			.into_iter()
			.filter_map(|c| match c {
				Call::List { kind, .. } => Some(kind),
				_ => None,
			})
			.collect();
		assert_eq!(listed, vec!["Ingress".to_string()]);
	}

	#[tokio::test]
	async fn test_scope_without_labels_owns_nothing() {
		let labelled = scope_for("simplest", "uid-a");
		let mut stray = owned(&labelled, ResourceKind::ingress(), "hand-made");
		stray.metadata.labels = None;
		stray.metadata.owner_references = None;
		let backend = MemoryBackend::new().with_object(stray);
		let scope = OwnershipScope::new(labelled.owner().clone(), "observability", BTreeMap::new());

		let index = discover(
			&backend,
			&scope,
			&OwnedKinds::default(),
			&Capabilities::none(),
			Deadline::none(),
		)
		.await
		.unwrap();

		assert!(index.is_empty());
		assert!(backend.calls().is_empty());
	}

	#[tokio::test]
	async fn test_discovers_only_own_objects() {
		let scope_a = scope_for("a", "uid-a");
		let scope_b = scope_for("b", "uid-b");
		let backend = MemoryBackend::new()
			.with_object(owned(&scope_a, ResourceKind::ingress(), "a-query"))
			.with_object(owned(&scope_b, ResourceKind::ingress(), "b-query"))
			.with_object(owned(&scope_a, ResourceKind::route(), "a-route"));

		let index = discover(
			&backend,
			&scope_a,
			&OwnedKinds::default(),
			&Capabilities::none().with(Capability::Routing),
			Deadline::none(),
		)
		.await
		.unwrap();

		let mut names: Vec<_> = index.iter().map(|r| r.key.name.as_str()).collect();
		names.sort_unstable();
		assert_eq!(names, vec!["a-query", "a-route"]);
		assert!(index
			.iter()
			.all(|r| r.key.namespace.as_deref() == Some("observability")));
	}

	#[tokio::test]
	async fn test_skips_objects_controlled_by_someone_else() {
		let scope = scope_for("simplest", "uid-a");
		let mut hijacked = owned(&scope, ResourceKind::ingress(), "hijacked");
		if let Some(refs) = hijacked.metadata.owner_references.as_mut() {
			refs[0].uid = "uid-other".to_string();
		}
		let backend = MemoryBackend::new()
			.with_object(hijacked)
			.with_object(owned(&scope, ResourceKind::ingress(), "query"));

		let index = discover(
			&backend,
			&scope,
			&OwnedKinds::default(),
			&Capabilities::none(),
			Deadline::none(),
		)
		.await
		.unwrap();

		assert_eq!(index.len(), 1);
		assert_eq!(index.iter().next().unwrap().key.name, "query");
	}

	#[tokio::test]
	async fn test_single_list_failure_is_fatal() {
		let scope = scope_for("simplest", "uid-a");
		let backend = MemoryBackend::new()
			.with_object(owned(&scope, ResourceKind::ingress(), "query"))
			.fail_list("Route");

		let result = discover(
			&backend,
			&scope,
			&OwnedKinds::default(),
			&Capabilities::none().with(Capability::Routing),
			Deadline::none(),
		)
		.await;

		assert_matches!(result, Err(DiscoveryError { kind, .. }) if kind == "Route.route.openshift.io");
	}
}
