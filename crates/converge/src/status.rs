//! Failure aggregation and status projection.

use std::{error::Error, fmt, time::Duration};

use crate::{
	apply::{ApplyOutcome, ApplyReport},
	object::ObjectKey,
	reconcile::ReconcileError,
};

/// Render an error with all of its sources, `outer: inner: root`.
pub fn error_chain(error: &(dyn Error + 'static)) -> String {
	let mut message = error.to_string();
	let mut source = error.source();
	while let Some(cause) = source {
		message.push_str(": ");
		message.push_str(&cause.to_string());
		source = cause.source();
	}
	message
}

/// Reason attached to a degraded owner, rendered as a status condition reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DegradedReason {
	InvalidStorageConfig,
	InvalidTenantsConfiguration,
	CouldNotGetOpenShiftTLSPolicy,
}

impl DegradedReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			DegradedReason::InvalidStorageConfig => "InvalidStorageConfig",
			DegradedReason::InvalidTenantsConfiguration => "InvalidTenantsConfiguration",
			DegradedReason::CouldNotGetOpenShiftTLSPolicy => "CouldNotGetOpenShiftTLSPolicy",
		}
	}
}

impl fmt::Display for DegradedReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Permanent failure that needs a configuration change before retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Degraded {
	pub reason: DegradedReason,
	pub message: String,
	pub requeue: bool,
}

impl Degraded {
	pub fn new(reason: DegradedReason, message: impl Into<String>) -> Self {
		Self {
			reason,
			message: message.into(),
			requeue: false,
		}
	}
}

impl fmt::Display for Degraded {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}: {}", self.reason, self.message)
	}
}

/// A single object that could not be applied or pruned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFailure {
	pub key: ObjectKey,
	pub message: String,
}

impl ObjectFailure {
	pub fn new(key: ObjectKey, error: &(dyn Error + 'static)) -> Self {
		Self {
			key,
			message: error_chain(error),
		}
	}
}

impl fmt::Display for ObjectFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}: {}", self.key, self.message)
	}
}

/// Successful apply outcomes by kind of operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyTally {
	pub created: usize,
	pub updated: usize,
	pub unchanged: usize,
}

impl ApplyTally {
	pub fn total(&self) -> usize {
		self.created + self.updated + self.unchanged
	}

	/// Count successes and collect failures from apply reports.
	pub fn from_reports(reports: &[ApplyReport]) -> (Self, Vec<ObjectFailure>) {
		let mut tally = Self::default();
		let mut failures = Vec::new();
		for report in reports {
			match &report.outcome {
				ApplyOutcome::Created { .. } => tally.created += 1,
				ApplyOutcome::Updated { .. } => tally.updated += 1,
				ApplyOutcome::Unchanged { .. } => tally.unchanged += 1,
				ApplyOutcome::Failed(error) => {
					failures.push(ObjectFailure::new(report.key.clone(), error));
				}
			}
		}
		(tally, failures)
	}
}

/// Values discovered during a pass that the next pass's snapshot should carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotUpdate {
	pub base_domain: Option<String>,
}

impl SnapshotUpdate {
	pub fn is_empty(&self) -> bool {
		self.base_domain.is_none()
	}
}

/// Terminal output of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileResult {
	pub applied: ApplyTally,
	pub pruned: usize,
	pub apply_failures: Vec<ObjectFailure>,
	pub prune_failures: Vec<ObjectFailure>,
	pub degraded: Option<Degraded>,
	pub snapshot_update: SnapshotUpdate,
}

impl ReconcileResult {
	pub fn applied_count(&self) -> usize {
		self.applied.total()
	}

	pub fn apply_failure_count(&self) -> usize {
		self.apply_failures.len()
	}

	pub fn prune_failure_count(&self) -> usize {
		self.prune_failures.len()
	}

	pub fn outcome(&self) -> PassOutcome {
		match &self.degraded {
			Some(degraded) => PassOutcome::Degraded(degraded.clone()),
			None if self.apply_failures.is_empty() && self.prune_failures.is_empty() => {
				PassOutcome::Success
			}
			None => PassOutcome::TransientFailure,
		}
	}
}

impl fmt::Display for ReconcileResult {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if let Some(degraded) = &self.degraded {
			return write!(f, "degraded ({degraded})");
		}
		write!(
			f,
			"{} created, {} updated, {} unchanged, {} pruned, {} apply failures, {} prune failures",
			self.applied.created,
			self.applied.updated,
			self.applied.unchanged,
			self.pruned,
			self.apply_failures.len(),
			self.prune_failures.len(),
		)
	}
}

/// Combine failures and an optional precondition into a pass result.
///
/// A degraded condition wins over everything else and never requeues.
pub fn project(
	apply_failures: Vec<ObjectFailure>,
	prune_failures: Vec<ObjectFailure>,
	degraded: Option<Degraded>,
) -> ReconcileResult {
	match degraded {
		Some(degraded) => ReconcileResult {
			degraded: Some(Degraded {
				requeue: false,
				..degraded
			}),
			..ReconcileResult::default()
		},
		None => ReconcileResult {
			apply_failures,
			prune_failures,
			..ReconcileResult::default()
		},
	}
}

/// Classification of a finished pass for the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
	Success,
	TransientFailure,
	Degraded(Degraded),
}

impl PassOutcome {
	pub fn of(result: &Result<ReconcileResult, ReconcileError>) -> Self {
		match result {
			Ok(result) => result.outcome(),
			Err(_) => PassOutcome::TransientFailure,
		}
	}
}

/// When the control loop should run the next pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
	/// Wait for the next change event.
	Never,
	After(Duration),
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeuePolicy {
	pub base: Duration,
	pub max: Duration,
}

impl Default for RequeuePolicy {
	fn default() -> Self {
		Self {
			base: Duration::from_secs(5),
			max: Duration::from_secs(300),
		}
	}
}

impl RequeuePolicy {
	/// `consecutive_failures` counts transient failures before this one.
	pub fn requeue(&self, outcome: &PassOutcome, consecutive_failures: u32) -> Requeue {
		match outcome {
			PassOutcome::Success | PassOutcome::Degraded(_) => Requeue::Never,
			PassOutcome::TransientFailure => {
				let factor = 2u32.saturating_pow(consecutive_failures);
				Requeue::After(self.base.saturating_mul(factor).min(self.max))
			}
		}
	}
}
