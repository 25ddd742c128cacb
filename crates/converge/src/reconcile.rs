//! Reconcile pass driver.
//!
//! One pass for one owner: precondition check, ownership discovery, apply of
//! every desired object, prune of the remainder, projection into a
//! [`ReconcileResult`]. The driver keeps no state between passes.

use std::{sync::Arc, time::Duration};

use bon::Builder;
use thiserror::Error;
use tracing::instrument;

use crate::{
	apply::{Applier, ConflictRetry},
	backend::{Deadline, ResourceBackend},
	index::{discover, Capabilities, DiscoveryError, OwnedKinds},
	merge::MergePolicies,
	object::DesiredObject,
	prune::{AppliedSet, PruneReport, Pruner},
	scope::OwnershipScope,
	status::{project, ApplyTally, Degraded, ReconcileResult, SnapshotUpdate},
};

/// Tuning of a pass.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct ReconcileOptions {
	/// Objects applied or pruned concurrently.
	#[builder(default = 8)]
	pub max_concurrency: usize,

	#[builder(default)]
	pub conflict_retry: ConflictRetry,

	/// Overall deadline of a pass; `None` for no deadline.
	pub deadline: Option<Duration>,

	/// Still prune when some objects failed to apply.
	#[builder(default = true)]
	pub prune_after_apply_failure: bool,
}

impl Default for ReconcileOptions {
	fn default() -> Self {
		Self::builder().build()
	}
}

/// Inputs of a single pass.
#[derive(Debug, Builder)]
pub struct Pass {
	pub scope: OwnershipScope,

	#[builder(default)]
	pub desired: Vec<DesiredObject>,

	/// Capabilities gating which owned kinds are discovered.
	#[builder(default)]
	pub capabilities: Capabilities,

	/// Degraded condition found before the pass; skips all work.
	pub precondition: Option<Degraded>,

	/// Values discovered while preparing the pass, handed back in the result.
	#[builder(default)]
	pub snapshot_update: SnapshotUpdate,
}

/// Errors that abort a pass before any object is touched.
#[derive(Debug, Error)]
pub enum ReconcileError {
	#[error("discovering owned objects")]
	Discovery(#[source] DiscoveryError),
}

impl ReconcileError {
	/// Whether running the pass again may succeed without a config change.
	pub fn is_transient(&self) -> bool {
		match self {
			ReconcileError::Discovery(_) => true,
		}
	}
}

/// Converges a backend to the desired objects of one owner per pass.
pub struct Reconciler<B> {
	backend: Arc<B>,
	applier: Applier<B>,
	pruner: Pruner<B>,
	kinds: OwnedKinds,
	options: ReconcileOptions,
}

impl<B: ResourceBackend + 'static> Reconciler<B> {
	pub fn new(backend: Arc<B>, policies: Arc<MergePolicies>, options: ReconcileOptions) -> Self {
		let applier =
			Applier::new(backend.clone(), policies).with_conflict_retry(options.conflict_retry);
		Self {
			pruner: Pruner::new(backend.clone()),
			backend,
			applier,
			kinds: OwnedKinds::default(),
			options,
		}
	}

	/// Replace the kinds searched for owned objects.
	#[must_use]
	pub fn with_owned_kinds(mut self, kinds: OwnedKinds) -> Self {
		self.kinds = kinds;
		self
	}

	pub fn options(&self) -> &ReconcileOptions {
		&self.options
	}

	/// Run one pass.
	///
	/// Per-object failures are reported in the result; only a failed discovery
	/// aborts the pass, and it does so before anything is mutated.
	#[instrument(skip_all, fields(owner = %pass.scope, desired = pass.desired.len()))]
	pub async fn reconcile(&self, pass: Pass) -> Result<ReconcileResult, ReconcileError> {
		if let Some(degraded) = pass.precondition {
			tracing::warn!(reason = %degraded.reason, message = %degraded.message, "owner degraded, skipping pass");
			let mut result = project(Vec::new(), Vec::new(), Some(degraded));
			result.snapshot_update = pass.snapshot_update;
			return Ok(result);
		}

		let deadline = self
			.options
			.deadline
			.map_or_else(Deadline::none, Deadline::after);
		let scope = Arc::new(pass.scope);
		let concurrency = self.options.max_concurrency;

		let index = discover(
			self.backend.as_ref(),
			&scope,
			&self.kinds,
			&pass.capabilities,
			deadline,
		)
		.await
		.map_err(ReconcileError::Discovery)?;
		tracing::debug!(owned = index.len(), "discovered owned objects");

		let reports = self
			.applier
			.apply_all(scope.clone(), pass.desired.clone(), concurrency, deadline)
			.await;
		let (applied, apply_failures) = ApplyTally::from_reports(&reports);

		let prune = if apply_failures.is_empty() || self.options.prune_after_apply_failure {
			let protected = AppliedSet::new(&scope, &pass.desired, &reports);
			self.pruner
				.prune(scope.clone(), &index, &protected, concurrency, deadline)
				.await
		} else {
			tracing::warn!(failures = apply_failures.len(), "apply failed, skipping prune");
			PruneReport::default()
		};

		let mut result = project(apply_failures, prune.failures, None);
		result.applied = applied;
		result.pruned = prune.deleted.len();
		result.snapshot_update = pass.snapshot_update;

		tracing::info!(
			created = result.applied.created,
			updated = result.applied.updated,
			unchanged = result.applied.unchanged,
			pruned = result.pruned,
			apply_failures = result.apply_failure_count(),
			prune_failures = result.prune_failure_count(),
			"pass finished"
		);
		Ok(result)
	}
}
