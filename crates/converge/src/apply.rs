//! Idempotent applier.
//!
//! Each desired object is stamped with ownership metadata and upserted:
//! created when absent, merged and replaced when the merge changes anything,
//! left alone otherwise. Outcomes are classified per object; one object's
//! failure never aborts the batch.

use std::{sync::Arc, time::Duration};

use kube::api::DynamicObject;
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use crate::{
	backend::{BackendError, Deadline, ResourceBackend},
	kind::ResourceKind,
	merge::{MergeError, MergePolicies},
	object::{DesiredObject, ObjectKey},
	pool::BoundedPool,
	scope::{OwnershipScope, StampError},
	status::error_chain,
};

/// Errors that can occur while applying a single object.
#[derive(Debug, Error)]
pub enum ApplyError {
	#[error("stamping ownership")]
	Stamp(#[source] StampError),

	#[error("live object is controlled by {kind} {name}")]
	OwnedByOther { kind: String, name: String },

	#[error("merging live object")]
	Merge(#[source] MergeError),

	#[error("converting object")]
	Serialization(#[source] serde_json::Error),

	#[error("{operation} failed")]
	Backend {
		operation: &'static str,
		#[source]
		source: BackendError,
	},

	#[error("still conflicting after {attempts} attempts")]
	ConflictRetriesExhausted {
		attempts: u32,
		#[source]
		source: BackendError,
	},

	#[error("apply task panicked: {0}")]
	TaskPanicked(String),
}

/// Result of applying one desired object.
#[derive(Debug)]
pub enum ApplyOutcome {
	Created { uid: String },
	Updated { uid: String },
	Unchanged { uid: String },
	Failed(ApplyError),
}

impl ApplyOutcome {
	/// Uid of the object now in the backend, `None` for failures.
	pub fn uid(&self) -> Option<&str> {
		match self {
			ApplyOutcome::Created { uid }
			| ApplyOutcome::Updated { uid }
			| ApplyOutcome::Unchanged { uid } => Some(uid.as_str()).filter(|uid| !uid.is_empty()),
			ApplyOutcome::Failed(_) => None,
		}
	}

	pub fn is_failed(&self) -> bool {
		matches!(self, ApplyOutcome::Failed(_))
	}

	fn label(&self) -> &'static str {
		match self {
			ApplyOutcome::Created { .. } => "created",
			ApplyOutcome::Updated { .. } => "updated",
			ApplyOutcome::Unchanged { .. } => "unchanged",
			ApplyOutcome::Failed(_) => "failed",
		}
	}
}

/// Outcome of one desired object, keyed by where it was placed.
#[derive(Debug)]
pub struct ApplyReport {
	pub key: ObjectKey,
	pub outcome: ApplyOutcome,
}

/// Bounded retry of the read-merge-write cycle on optimistic-concurrency
/// conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRetry {
	/// Extra attempts after the first one.
	pub retries: u32,
	pub initial_backoff: Duration,
}

impl Default for ConflictRetry {
	fn default() -> Self {
		Self {
			retries: 5,
			initial_backoff: Duration::from_millis(10),
		}
	}
}

impl ConflictRetry {
	pub fn backoff(&self, attempt: u32) -> Duration {
		self.initial_backoff
			.saturating_mul(2u32.saturating_pow(attempt))
	}
}

enum AttemptError {
	Conflict(BackendError),
	Fatal(ApplyError),
}

fn classify(operation: &'static str) -> impl FnOnce(BackendError) -> AttemptError {
	move |source| {
		if source.is_conflict() {
			AttemptError::Conflict(source)
		} else {
			AttemptError::Fatal(ApplyError::Backend { operation, source })
		}
	}
}

fn uid_of(object: &DynamicObject) -> String {
	object.metadata.uid.clone().unwrap_or_default()
}

/// Applies desired objects against a backend.
pub struct Applier<B> {
	backend: Arc<B>,
	policies: Arc<MergePolicies>,
	retry: ConflictRetry,
}

impl<B> Clone for Applier<B> {
	fn clone(&self) -> Self {
		Self {
			backend: self.backend.clone(),
			policies: self.policies.clone(),
			retry: self.retry,
		}
	}
}

impl<B: ResourceBackend + 'static> Applier<B> {
	pub fn new(backend: Arc<B>, policies: Arc<MergePolicies>) -> Self {
		Self {
			backend,
			policies,
			retry: ConflictRetry::default(),
		}
	}

	#[must_use]
	pub fn with_conflict_retry(mut self, retry: ConflictRetry) -> Self {
		self.retry = retry;
		self
	}

	/// Apply one desired object on behalf of `scope`.
	#[instrument(skip_all, fields(
		kind = %desired.kind(),
		name = %desired.name(),
		namespace = %desired.key_in(scope.namespace()).namespace(),
	))]
	pub async fn apply(
		&self,
		scope: &OwnershipScope,
		desired: &DesiredObject,
		deadline: Deadline,
	) -> ApplyOutcome {
		let outcome = match self.try_apply(scope, desired, deadline).await {
			Ok(outcome) => outcome,
			Err(error) => ApplyOutcome::Failed(error),
		};

		match &outcome {
			ApplyOutcome::Failed(error) => {
				tracing::error!(error = %error_chain(error), "apply failed");
			}
			other => {
				tracing::debug!(outcome = other.label(), uid = other.uid().unwrap_or_default(), "applied");
			}
		}
		outcome
	}

	/// Apply every desired object with at most `concurrency` in flight.
	///
	/// Returns once all objects have settled, one report per desired object.
	pub async fn apply_all(
		&self,
		scope: Arc<OwnershipScope>,
		desired: Vec<DesiredObject>,
		concurrency: usize,
		deadline: Deadline,
	) -> Vec<ApplyReport> {
		let mut pool = BoundedPool::new(concurrency);

		for object in desired {
			let key = object.key_in(scope.namespace());
			let applier = self.clone();
			let scope = scope.clone();
			let report_key = key.clone();
			pool.spawn(key, async move {
				let outcome = applier.apply(&scope, &object, deadline).await;
				ApplyReport {
					key: report_key,
					outcome,
				}
			});
		}

		pool.join()
			.await
			.into_iter()
			.map(|joined| {
				joined.unwrap_or_else(|panicked| {
					tracing::error!(key = %panicked.key, error = %panicked.message, "apply task panicked");
					ApplyReport {
						key: panicked.key,
						outcome: ApplyOutcome::Failed(ApplyError::TaskPanicked(panicked.message)),
					}
				})
			})
			.collect()
	}

	async fn try_apply(
		&self,
		scope: &OwnershipScope,
		desired: &DesiredObject,
		deadline: Deadline,
	) -> Result<ApplyOutcome, ApplyError> {
		let kind = desired.kind();
		let mut stamped = desired.object().clone();
		scope.stamp(kind, &mut stamped).map_err(ApplyError::Stamp)?;
		let desired_value = serde_json::to_value(&stamped).map_err(ApplyError::Serialization)?;

		let mut attempt = 0;
		loop {
			match self
				.upsert(scope, kind, &stamped, &desired_value, deadline)
				.await
			{
				Ok(outcome) => return Ok(outcome),
				Err(AttemptError::Fatal(error)) => return Err(error),
				Err(AttemptError::Conflict(source)) => {
					if attempt >= self.retry.retries {
						return Err(ApplyError::ConflictRetriesExhausted {
							attempts: attempt + 1,
							source,
						});
					}
					let backoff = self.retry.backoff(attempt);
					attempt += 1;
					tracing::debug!(attempt, backoff_ms = backoff.as_millis(), error = %source, "conflict, retrying");
					tokio::time::sleep(backoff).await;
				}
			}
		}
	}

	async fn upsert(
		&self,
		scope: &OwnershipScope,
		kind: &ResourceKind,
		stamped: &DynamicObject,
		desired_value: &Value,
		deadline: Deadline,
	) -> Result<ApplyOutcome, AttemptError> {
		let namespace = stamped.metadata.namespace.as_deref();
		let name = stamped.metadata.name.as_deref().unwrap_or_default();

		let live = deadline
			.run(self.backend.get(kind, namespace, name))
			.await
			.map_err(|source| AttemptError::Fatal(ApplyError::Backend { operation: "get", source }))?;

		let Some(live) = live else {
			let created = deadline
				.run(self.backend.create(kind, stamped))
				.await
				.map_err(classify("create"))?;
			return Ok(ApplyOutcome::Created {
				uid: uid_of(&created),
			});
		};

		if let Some(other) = scope.foreign_controller(&live.metadata) {
			return Err(AttemptError::Fatal(ApplyError::OwnedByOther {
				kind: other.kind.clone(),
				name: other.name.clone(),
			}));
		}

		let live_value = serde_json::to_value(&live)
			.map_err(|e| AttemptError::Fatal(ApplyError::Serialization(e)))?;
		let mut merged = live_value.clone();
		self.policies
			.for_kind(kind)
			.merge(&mut merged, desired_value)
			.map_err(|e| AttemptError::Fatal(ApplyError::Merge(e)))?;

		if merged == live_value {
			return Ok(ApplyOutcome::Unchanged { uid: uid_of(&live) });
		}

		let merged: DynamicObject = serde_json::from_value(merged)
			.map_err(|e| AttemptError::Fatal(ApplyError::Serialization(e)))?;
		let updated = deadline
			.run(self.backend.replace(kind, &merged))
			.await
			.map_err(classify("replace"))?;
		Ok(ApplyOutcome::Updated {
			uid: uid_of(&updated),
		})
	}
}
