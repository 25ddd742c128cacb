//! Ownership scope: who owns an object and how ownership is marked.
//!
//! Ownership is recorded twice on every namespaced object the engine writes:
//! the common label set (used to find owned objects) and a controller owner
//! reference (used by the cluster garbage collector and to refuse adopting
//! objects controlled by somebody else). Cluster-scoped objects only get the
//! labels, since a namespaced owner cannot own them.

use std::{collections::BTreeMap, fmt};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::DynamicObject;
use thiserror::Error;

use crate::kind::ResourceKind;

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Errors raised while stamping ownership onto a desired object.
#[derive(Debug, Error)]
pub enum StampError {
	#[error("owner {owner} has no uid")]
	MissingOwnerUid { owner: String },

	#[error("object is already controlled by {kind} {name} ({uid})")]
	AlreadyOwned {
		kind: String,
		name: String,
		uid: String,
	},

	#[error(
		"cross-namespace owner references are disallowed: object namespace `{object_namespace}`, \
		 owner namespace `{owner_namespace}`"
	)]
	CrossNamespace {
		object_namespace: String,
		owner_namespace: String,
	},
}

/// Identity of the owning instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerRef {
	pub api_version: String,
	pub kind: String,
	pub name: String,
	pub uid: String,
}

/// Label set that marks objects as belonging to one instance.
pub fn common_labels(app: &str, instance: &str, managed_by: &str) -> BTreeMap<String, String> {
	BTreeMap::from([
		(LABEL_NAME.to_string(), app.to_string()),
		(LABEL_INSTANCE.to_string(), instance.to_string()),
		(LABEL_MANAGED_BY.to_string(), managed_by.to_string()),
	])
}

/// Everything needed to query and stamp objects of one owner instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipScope {
	owner: OwnerRef,
	namespace: String,
	labels: BTreeMap<String, String>,
}

impl OwnershipScope {
	pub fn new(owner: OwnerRef, namespace: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
		Self {
			owner,
			namespace: namespace.into(),
			labels,
		}
	}

	/// Scope using the conventional `app.kubernetes.io/*` labels for `owner`.
	pub fn with_common_labels(
		owner: OwnerRef,
		namespace: impl Into<String>,
		app: &str,
		managed_by: &str,
	) -> Self {
		let labels = common_labels(app, &owner.name, managed_by);
		Self::new(owner, namespace, labels)
	}

	pub fn owner(&self) -> &OwnerRef {
		&self.owner
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn labels(&self) -> &BTreeMap<String, String> {
		&self.labels
	}

	/// Label selector matching every object of this owner, e.g. `a=b,c=d`.
	pub fn selector(&self) -> String {
		self.labels
			.iter()
			.map(|(k, v)| format!("{k}={v}"))
			.collect::<Vec<_>>()
			.join(",")
	}

	/// Whether `labels` contain the full common label set.
	///
	/// A scope without labels has no marker, so nothing carries it.
	pub fn carries_marker(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
		let Some(labels) = labels else {
			return false;
		};
		!self.labels.is_empty()
			&& self
				.labels
				.iter()
				.all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
	}

	/// Controller reference pointing at the owner.
	pub fn controller_reference(&self) -> OwnerReference {
		OwnerReference {
			api_version: self.owner.api_version.clone(),
			kind: self.owner.kind.clone(),
			name: self.owner.name.clone(),
			uid: self.owner.uid.clone(),
			controller: Some(true),
			block_owner_deletion: Some(true),
		}
	}

	/// Controller reference on `meta` that points at a different owner, if any.
	pub fn foreign_controller<'a>(&self, meta: &'a ObjectMeta) -> Option<&'a OwnerReference> {
		meta.owner_references
			.as_ref()?
			.iter()
			.find(|r| r.controller == Some(true) && r.uid != self.owner.uid)
	}

	/// Stamp ownership metadata onto `object`.
	///
	/// Labels are always forced. Namespaced kinds additionally get the owner
	/// namespace and a controller reference; cluster-scoped kinds get neither.
	pub fn stamp(&self, kind: &ResourceKind, object: &mut DynamicObject) -> Result<(), StampError> {
		let labels = object.metadata.labels.get_or_insert_with(BTreeMap::new);
		for (k, v) in &self.labels {
			labels.insert(k.clone(), v.clone());
		}

		if !kind.is_namespaced() {
			object.metadata.namespace = None;
			return Ok(());
		}

		if self.owner.uid.is_empty() {
			return Err(StampError::MissingOwnerUid {
				owner: self.to_string(),
			});
		}

		match object.metadata.namespace.as_deref() {
			Some(ns) if !ns.is_empty() && ns != self.namespace => {
				return Err(StampError::CrossNamespace {
					object_namespace: ns.to_string(),
					owner_namespace: self.namespace.clone(),
				});
			}
			_ => object.metadata.namespace = Some(self.namespace.clone()),
		}

		if let Some(other) = self.foreign_controller(&object.metadata) {
			return Err(StampError::AlreadyOwned {
				kind: other.kind.clone(),
				name: other.name.clone(),
				uid: other.uid.clone(),
			});
		}

		let refs = object.metadata.owner_references.get_or_insert_with(Vec::new);
		refs.retain(|r| r.uid != self.owner.uid);
		refs.push(self.controller_reference());

		Ok(())
	}
}

impl fmt::Display for OwnershipScope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {}/{}", self.owner.kind, self.namespace, self.owner.name)
	}
}
