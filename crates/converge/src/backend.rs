//! Abstract resource backend.
//!
//! The engine only needs keyed CRUD plus label-filtered listing. Every call is
//! a suspension point and the only place a pass can block, so the deadline of a
//! pass is enforced here as well.

use std::future::Future;

use kube::api::DynamicObject;
use thiserror::Error;
use tokio::time::Instant;

use crate::kind::ResourceKind;

/// Errors returned by a [`ResourceBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
	#[error("object not found")]
	NotFound,

	/// Optimistic-concurrency conflict (stale resourceVersion or failed precondition).
	#[error("conflict: {message}")]
	Conflict { message: String },

	#[error("object already exists")]
	AlreadyExists,

	#[error("rejected by backend ({code} {reason}): {message}")]
	Rejected {
		code: u16,
		reason: String,
		message: String,
	},

	#[error("deadline exceeded")]
	DeadlineExceeded,

	#[error("backend request failed")]
	Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

	#[error("decoding object")]
	Serialization(#[source] serde_json::Error),
}

impl BackendError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, BackendError::NotFound)
	}

	pub fn is_conflict(&self) -> bool {
		matches!(self, BackendError::Conflict { .. } | BackendError::AlreadyExists)
	}
}

/// Keyed CRUD and label-filtered list over a resource store.
///
/// Objects are addressed by kind, namespace (`None` for cluster-scoped kinds)
/// and name; every stored object has a stable `metadata.uid`.
pub trait ResourceBackend: Send + Sync {
	/// List objects of `kind` in `namespace` matching the label `selector`.
	fn list(
		&self,
		kind: &ResourceKind,
		namespace: &str,
		selector: &str,
	) -> impl Future<Output = Result<Vec<DynamicObject>, BackendError>> + Send;

	/// Fetch a single object, `None` when it does not exist.
	fn get(
		&self,
		kind: &ResourceKind,
		namespace: Option<&str>,
		name: &str,
	) -> impl Future<Output = Result<Option<DynamicObject>, BackendError>> + Send;

	/// Create `object`; the namespace is taken from its metadata.
	fn create(
		&self,
		kind: &ResourceKind,
		object: &DynamicObject,
	) -> impl Future<Output = Result<DynamicObject, BackendError>> + Send;

	/// Replace `object`. Its `metadata.resourceVersion` guards against lost updates.
	fn replace(
		&self,
		kind: &ResourceKind,
		object: &DynamicObject,
	) -> impl Future<Output = Result<DynamicObject, BackendError>> + Send;

	/// Delete an object. With `uid` set, only the object with that uid is deleted.
	fn delete(
		&self,
		kind: &ResourceKind,
		namespace: Option<&str>,
		name: &str,
		uid: Option<&str>,
	) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// Optional instant after which backend calls of a pass fail fast.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
	pub fn none() -> Self {
		Self(None)
	}

	pub fn after(timeout: std::time::Duration) -> Self {
		Self(Some(Instant::now() + timeout))
	}

	pub fn is_expired(&self) -> bool {
		self.0.is_some_and(|at| Instant::now() >= at)
	}

	/// Run a backend call, failing with [`BackendError::DeadlineExceeded`] once the deadline passes.
	pub async fn run<T, F>(&self, call: F) -> Result<T, BackendError>
	where
		F: Future<Output = Result<T, BackendError>>,
	{
		match self.0 {
			Some(at) => tokio::time::timeout_at(at, call)
				.await
				.map_err(|_| BackendError::DeadlineExceeded)?,
			None => call.await,
		}
	}
}
