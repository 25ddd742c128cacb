//! Desired objects and object keys.

use std::fmt;

use kube::{api::DynamicObject, core::TypeMeta};
use thiserror::Error;

use crate::kind::ResourceKind;

/// Errors that can occur when constructing a desired object.
#[derive(Debug, Error)]
pub enum ObjectError {
	#[error("manifest missing metadata.name")]
	MissingName,

	#[error("manifest is {found_api_version}/{found_kind}, expected {expected}")]
	KindMismatch {
		expected: String,
		found_api_version: String,
		found_kind: String,
	},

	#[error("converting manifest to DynamicObject")]
	ManifestConversion(#[source] serde_json::Error),
}

/// Natural key of an object: kind, namespace (for namespaced kinds) and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
	pub kind: ResourceKind,
	pub namespace: Option<String>,
	pub name: String,
}

impl ObjectKey {
	pub fn new(kind: ResourceKind, namespace: Option<String>, name: impl Into<String>) -> Self {
		Self {
			kind,
			namespace,
			name: name.into(),
		}
	}

	pub fn namespace(&self) -> &str {
		self.namespace.as_deref().unwrap_or("")
	}
}

impl fmt::Display for ObjectKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.namespace {
			Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
			None => write!(f, "{} {}", self.kind, self.name),
		}
	}
}

/// A fully specified resource that should exist after the pass.
///
/// The kind (and with it the resource scope) is fixed at construction time.
/// The payload is never mutated by the engine; the applier stamps a copy.
#[derive(Debug, Clone)]
pub struct DesiredObject {
	kind: ResourceKind,
	object: DynamicObject,
}

impl DesiredObject {
	pub fn new(kind: ResourceKind, mut object: DynamicObject) -> Result<Self, ObjectError> {
		let name = object.metadata.name.as_deref().unwrap_or_default();
		if name.is_empty() {
			return Err(ObjectError::MissingName);
		}

		match &object.types {
			Some(types) if !kind.matches(&types.api_version, &types.kind) => {
				return Err(ObjectError::KindMismatch {
					expected: format!("{}/{}", kind.api_version(), kind.kind),
					found_api_version: types.api_version.clone(),
					found_kind: types.kind.clone(),
				});
			}
			Some(_) => {}
			None => {
				object.types = Some(TypeMeta {
					api_version: kind.api_version(),
					kind: kind.kind.clone(),
				});
			}
		}

		Ok(Self { kind, object })
	}

	/// Build a desired object from a raw JSON manifest.
	pub fn from_manifest(kind: ResourceKind, manifest: serde_json::Value) -> Result<Self, ObjectError> {
		let object: DynamicObject =
			serde_json::from_value(manifest).map_err(ObjectError::ManifestConversion)?;
		Self::new(kind, object)
	}

	pub fn kind(&self) -> &ResourceKind {
		&self.kind
	}

	pub fn name(&self) -> &str {
		self.object.metadata.name.as_deref().unwrap_or_default()
	}

	pub fn object(&self) -> &DynamicObject {
		&self.object
	}

	/// Key this object will have once placed in `owner_namespace`.
	///
	/// Cluster-scoped objects have no namespace regardless of the owner.
	pub fn key_in(&self, owner_namespace: &str) -> ObjectKey {
		let namespace = self
			.kind
			.is_namespaced()
			.then(|| owner_namespace.to_string());
		ObjectKey::new(self.kind.clone(), namespace, self.name())
	}
}
