//! Pruner: deletes owned objects that were not applied in this pass.

use std::{collections::HashSet, sync::Arc};

use thiserror::Error;
use tracing::instrument;

use crate::{
	apply::ApplyReport,
	backend::{BackendError, Deadline, ResourceBackend},
	index::{OwnedIndex, OwnedObjectRecord},
	object::{DesiredObject, ObjectKey},
	pool::BoundedPool,
	scope::OwnershipScope,
	status::{error_chain, ObjectFailure},
};

/// Errors that can occur while deleting a single object.
#[derive(Debug, Error)]
pub enum PruneError {
	#[error("refusing to delete outside owner namespace `{owner_namespace}`")]
	OutsideScope { owner_namespace: String },

	#[error("delete failed")]
	Delete(#[source] BackendError),

	#[error("prune task panicked: {0}")]
	TaskPanicked(String),
}

/// Identities that must survive the prune.
#[derive(Debug, Clone, Default)]
pub struct AppliedSet {
	uids: HashSet<String>,
	keys: HashSet<ObjectKey>,
}

impl AppliedSet {
	/// Build from the desired set and its apply reports.
	///
	/// Every desired key is protected, whether or not its apply succeeded.
	pub fn new<'a>(
		scope: &OwnershipScope,
		desired: impl IntoIterator<Item = &'a DesiredObject>,
		reports: &[ApplyReport],
	) -> Self {
		Self {
			uids: reports
				.iter()
				.filter_map(|r| r.outcome.uid())
				.map(str::to_string)
				.collect(),
			keys: desired
				.into_iter()
				.map(|d| d.key_in(scope.namespace()))
				.collect(),
		}
	}

	pub fn from_parts(
		uids: impl IntoIterator<Item = String>,
		keys: impl IntoIterator<Item = ObjectKey>,
	) -> Self {
		Self {
			uids: uids.into_iter().collect(),
			keys: keys.into_iter().collect(),
		}
	}

	pub fn protects(&self, record: &OwnedObjectRecord) -> bool {
		self.uids.contains(&record.uid) || self.keys.contains(&record.key)
	}
}

/// Result of deleting one owned object.
#[derive(Debug)]
pub enum PruneOutcome {
	Deleted,
	/// The object was removed (or replaced) by someone else first.
	AlreadyGone,
	Failed(PruneError),
}

/// Summary of a prune run.
#[derive(Debug, Default)]
pub struct PruneReport {
	pub deleted: Vec<ObjectKey>,
	pub failures: Vec<ObjectFailure>,
}

/// Deletes stale owned objects.
pub struct Pruner<B> {
	backend: Arc<B>,
}

impl<B> Clone for Pruner<B> {
	fn clone(&self) -> Self {
		Self {
			backend: self.backend.clone(),
		}
	}
}

impl<B: ResourceBackend + 'static> Pruner<B> {
	pub fn new(backend: Arc<B>) -> Self {
		Self { backend }
	}

	/// Delete every record of `index` not protected by `applied`.
	#[instrument(skip_all, fields(owner = %scope, owned = index.len()))]
	pub async fn prune(
		&self,
		scope: Arc<OwnershipScope>,
		index: &OwnedIndex,
		applied: &AppliedSet,
		concurrency: usize,
		deadline: Deadline,
	) -> PruneReport {
		let mut pool = BoundedPool::new(concurrency);

		for record in index.iter().filter(|r| !applied.protects(r)) {
			let pruner = self.clone();
			let scope = scope.clone();
			let record = record.clone();
			pool.spawn(record.key.clone(), async move {
				let outcome = pruner.delete(&scope, &record, deadline).await;
				(record.key, outcome)
			});
		}

		let mut report = PruneReport::default();
		for joined in pool.join().await {
			let (key, outcome) = joined.unwrap_or_else(|panicked| {
				let outcome = PruneOutcome::Failed(PruneError::TaskPanicked(panicked.message));
				(panicked.key, outcome)
			});
			match outcome {
				PruneOutcome::Deleted | PruneOutcome::AlreadyGone => report.deleted.push(key),
				PruneOutcome::Failed(error) => report.failures.push(ObjectFailure::new(key, &error)),
			}
		}
		report
	}

	/// Delete a single owned object.
	#[instrument(skip_all, fields(
		kind = %record.key.kind,
		name = %record.key.name,
		namespace = %record.key.namespace(),
		uid = %record.uid,
	))]
	pub async fn delete(
		&self,
		scope: &OwnershipScope,
		record: &OwnedObjectRecord,
		deadline: Deadline,
	) -> PruneOutcome {
		let key = &record.key;
		if key.kind.is_namespaced() && key.namespace.as_deref() != Some(scope.namespace()) {
			tracing::error!(owner_namespace = scope.namespace(), "refusing to prune object outside owner namespace");
			return PruneOutcome::Failed(PruneError::OutsideScope {
				owner_namespace: scope.namespace().to_string(),
			});
		}

		let result = deadline
			.run(self.backend.delete(
				&key.kind,
				key.namespace.as_deref(),
				&key.name,
				Some(&record.uid),
			))
			.await;

		match result {
			Ok(()) => {
				tracing::info!("pruned");
				PruneOutcome::Deleted
			}
			// A uid precondition conflict means the indexed object no longer exists.
			Err(BackendError::NotFound | BackendError::Conflict { .. }) => {
				tracing::debug!("already gone");
				PruneOutcome::AlreadyGone
			}
			Err(source) => {
				let error = PruneError::Delete(source);
				tracing::error!(error = %error_chain(&error), "prune failed");
				PruneOutcome::Failed(error)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use serde_json::json;

	use super::*;
	use crate::{
		kind::ResourceKind,
		test_utils::{desired, owned, scope_for, Call, MemoryBackend},
	};

	fn record(kind: ResourceKind, namespace: &str, name: &str, uid: &str) -> OwnedObjectRecord {
		OwnedObjectRecord {
			uid: uid.to_string(),
			key: ObjectKey::new(kind, Some(namespace.to_string()), name),
		}
	}

	#[tokio::test]
	async fn test_deletes_only_unapplied() {
		let scope = Arc::new(scope_for("simplest", "uid-owner"));
		let backend = Arc::new(
			MemoryBackend::new()
				.with_object(owned(&scope, ResourceKind::ingress(), "keep"))
				.with_object(owned(&scope, ResourceKind::ingress(), "stale")),
		);
		let index: OwnedIndex = [
			record(ResourceKind::ingress(), "observability", "keep", "uid-1"),
			record(ResourceKind::ingress(), "observability", "stale", "uid-2"),
		]
		.into_iter()
		.collect();
		let applied = AppliedSet::from_parts(["uid-1".to_string()], []);

		let report = Pruner::new(backend.clone())
			.prune(scope, &index, &applied, 4, Deadline::none())
			.await;

		assert_eq!(report.deleted.len(), 1);
		assert_eq!(report.deleted[0].name, "stale");
		assert!(report.failures.is_empty());
		assert_eq!(backend.names(), vec!["keep".to_string()]);
	}

	#[tokio::test]
	async fn test_desired_key_protects_failed_apply() {
		let scope = Arc::new(scope_for("simplest", "uid-owner"));
		let backend = Arc::new(
			MemoryBackend::new().with_object(owned(&scope, ResourceKind::ingress(), "query")),
		);
		let index: OwnedIndex = [record(ResourceKind::ingress(), "observability", "query", "uid-1")]
			.into_iter()
			.collect();
		let wanted = [desired(ResourceKind::ingress(), "query", json!({}))];
		let applied = AppliedSet::new(&scope, &wanted, &[]);

		let report = Pruner::new(backend.clone())
			.prune(scope, &index, &applied, 4, Deadline::none())
			.await;

		assert!(report.deleted.is_empty());
		assert!(backend.mutating_calls().is_empty());
	}

	#[tokio::test]
	async fn test_already_deleted_is_success() {
		let scope = Arc::new(scope_for("simplest", "uid-owner"));
		let backend = Arc::new(MemoryBackend::new());
		let index: OwnedIndex = [record(ResourceKind::route(), "observability", "gone", "uid-9")]
			.into_iter()
			.collect();

		let report = Pruner::new(backend)
			.prune(scope, &index, &AppliedSet::default(), 4, Deadline::none())
			.await;

		assert_eq!(report.deleted.len(), 1);
		assert!(report.failures.is_empty());
	}

	#[tokio::test]
	async fn test_recreated_object_is_not_deleted() {
		let scope = scope_for("simplest", "uid-owner");
		let backend = Arc::new(
			MemoryBackend::new().with_object(owned(&scope, ResourceKind::ingress(), "query")),
		);
		// Index still points at the uid of a previous incarnation.
		let stale = record(ResourceKind::ingress(), "observability", "query", "uid-old");

		let outcome = Pruner::new(backend.clone())
			.delete(&scope, &stale, Deadline::none())
			.await;

		assert_matches!(outcome, PruneOutcome::AlreadyGone);
		assert_eq!(backend.names(), vec!["query".to_string()]);
	}

	#[tokio::test]
	async fn test_refuses_other_namespace() {
		let scope = scope_for("simplest", "uid-owner");
		let backend = Arc::new(MemoryBackend::new());
		let foreign = record(ResourceKind::ingress(), "kube-system", "query", "uid-1");

		let outcome = Pruner::new(backend.clone())
			.delete(&scope, &foreign, Deadline::none())
			.await;

		assert_matches!(outcome, PruneOutcome::Failed(PruneError::OutsideScope { .. }));
		assert!(backend.calls().is_empty());
	}

	#[tokio::test]
	async fn test_failures_do_not_block_other_deletes() {
		let scope = Arc::new(scope_for("simplest", "uid-owner"));
		let backend = Arc::new(
			MemoryBackend::new()
				.with_object(owned(&scope, ResourceKind::ingress(), "a"))
				.with_object(owned(&scope, ResourceKind::ingress(), "b"))
				.with_object(owned(&scope, ResourceKind::ingress(), "c"))
				.fail_delete("b"),
		);
		let index: OwnedIndex = [
			record(ResourceKind::ingress(), "observability", "a", "uid-1"),
			record(ResourceKind::ingress(), "observability", "b", "uid-2"),
			record(ResourceKind::ingress(), "observability", "c", "uid-3"),
		]
		.into_iter()
		.collect();

		let report = Pruner::new(backend.clone())
			.prune(scope, &index, &AppliedSet::default(), 1, Deadline::none())
			.await;

		assert_eq!(report.deleted.len(), 2);
		assert_eq!(report.failures.len(), 1);
		assert_eq!(report.failures[0].key.name, "b");
		let deletes = backend
			.calls()
			.into_iter()
			.filter(|c| matches!(c, Call::Delete { .. }))
			.count();
		assert_eq!(deletes, 3);
	}
}
