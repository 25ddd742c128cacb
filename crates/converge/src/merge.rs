//! Field merge policies.
//!
//! A merge policy decides which fields of a live object are owned by the
//! engine (overwritten from the desired object) and which belong to users or
//! the server (kept as they are). Policies are picked per kind.

use std::{collections::HashMap, fmt, sync::Arc};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::kind::ResourceKind;

/// Top-level fields a policy never copies from the desired object.
const RESERVED_FIELDS: &[&str] = &["apiVersion", "kind", "metadata", "status"];

#[derive(Debug, Error)]
pub enum MergeError {
	#[error("{0} is not a JSON object")]
	NotAnObject(&'static str),
}

/// Brings a live object in line with a desired one.
pub trait MergePolicy: Send + Sync + fmt::Debug {
	/// Mutate `live` so that every engine-managed field matches `desired`.
	fn merge(&self, live: &mut Value, desired: &Value) -> Result<(), MergeError>;
}

/// Default policy: desired wins everywhere except user-managed fields.
///
/// - `metadata.labels` and `metadata.annotations` are merged, desired keys
///   overwrite and foreign keys are kept
/// - `metadata.ownerReferences` is taken from desired when present
/// - any other top-level field of desired (`spec`, `data`, `rules`, ...) is
///   merged into the live value: objects recursively, desired keys win and
///   keys only the live object has (server defaults) are kept; arrays and
///   scalars are replaced
/// - fields listed as user-managed keep their live value
#[derive(Debug, Clone, Default)]
pub struct FieldMerge {
	user_managed: Vec<String>,
}

impl FieldMerge {
	pub fn new() -> Self {
		Self::default()
	}

	/// Keep the live value at JSON pointer `pointer` (e.g. `/spec/clusterIP`).
	#[must_use]
	pub fn user_managed(mut self, pointer: impl Into<String>) -> Self {
		self.user_managed.push(pointer.into());
		self
	}
}

impl MergePolicy for FieldMerge {
	fn merge(&self, live: &mut Value, desired: &Value) -> Result<(), MergeError> {
		let kept: Vec<(&str, Value)> = self
			.user_managed
			.iter()
			.filter_map(|p| live.pointer(p).map(|v| (p.as_str(), v.clone())))
			.collect();

		let desired = desired
			.as_object()
			.ok_or(MergeError::NotAnObject("desired object"))?;
		let live_map = live
			.as_object_mut()
			.ok_or(MergeError::NotAnObject("live object"))?;

		if let Some(desired_meta) = desired.get("metadata").and_then(Value::as_object) {
			let live_meta = live_map
				.entry("metadata")
				.or_insert_with(|| Value::Object(Map::new()))
				.as_object_mut()
				.ok_or(MergeError::NotAnObject("metadata"))?;

			merge_string_map(live_meta, desired_meta, "labels")?;
			merge_string_map(live_meta, desired_meta, "annotations")?;
			if let Some(refs) = desired_meta.get("ownerReferences") {
				live_meta.insert("ownerReferences".to_string(), refs.clone());
			}
		}

		for (key, value) in desired {
			if RESERVED_FIELDS.contains(&key.as_str()) {
				continue;
			}
			match live_map.get_mut(key) {
				Some(live_value) => merge_value(live_value, value),
				None => {
					live_map.insert(key.clone(), value.clone());
				}
			}
		}

		for (pointer, value) in kept {
			set_pointer(live, pointer, value);
		}

		Ok(())
	}
}

/// Overlay `desired` onto `live`. Objects merge key by key, anything else is
/// replaced.
fn merge_value(live: &mut Value, desired: &Value) {
	match (live, desired) {
		(Value::Object(live), Value::Object(desired)) => {
			for (key, value) in desired {
				match live.get_mut(key) {
					Some(live_value) => merge_value(live_value, value),
					None => {
						live.insert(key.clone(), value.clone());
					}
				}
			}
		}
		(live, desired) => *live = desired.clone(),
	}
}

fn merge_string_map(
	live_meta: &mut Map<String, Value>,
	desired_meta: &Map<String, Value>,
	field: &'static str,
) -> Result<(), MergeError> {
	let Some(desired) = desired_meta.get(field) else {
		return Ok(());
	};
	let desired = desired.as_object().ok_or(MergeError::NotAnObject(field))?;

	let live = live_meta
		.entry(field)
		.or_insert_with(|| Value::Object(Map::new()));
	if live.is_null() {
		*live = Value::Object(Map::new());
	}
	let live = live.as_object_mut().ok_or(MergeError::NotAnObject(field))?;
	for (k, v) in desired {
		live.insert(k.clone(), v.clone());
	}
	Ok(())
}

/// Write `value` at JSON pointer `pointer`, creating intermediate objects.
///
/// Returns false when the path crosses a non-container value.
fn set_pointer(root: &mut Value, pointer: &str, value: Value) -> bool {
	let tokens: Vec<String> = pointer
		.split('/')
		.skip(1)
		.map(|t| t.replace("~1", "/").replace("~0", "~"))
		.collect();
	let Some((last, parents)) = tokens.split_last() else {
		*root = value;
		return true;
	};

	let mut current = root;
	for token in parents {
		current = match current {
			Value::Object(map) => map
				.entry(token.clone())
				.or_insert_with(|| Value::Object(Map::new())),
			Value::Array(items) => match token.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
				Some(item) => item,
				None => return false,
			},
			_ => return false,
		};
	}

	match current {
		Value::Object(map) => {
			map.insert(last.clone(), value);
			true
		}
		Value::Array(items) => match last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
			Some(item) => {
				*item = value;
				true
			}
			None => false,
		},
		_ => false,
	}
}

/// Merge policy table keyed by (group, kind) with a fallback.
#[derive(Debug, Clone)]
pub struct MergePolicies {
	fallback: Arc<dyn MergePolicy>,
	by_kind: HashMap<(String, String), Arc<dyn MergePolicy>>,
}

impl Default for MergePolicies {
	/// Field merge everywhere; server-assigned fields of services and routes
	/// are kept.
	fn default() -> Self {
		Self::with_fallback(FieldMerge::new())
			.with_policy(
				&ResourceKind::service(),
				FieldMerge::new()
					.user_managed("/spec/clusterIP")
					.user_managed("/spec/clusterIPs"),
			)
			.with_policy(
				&ResourceKind::route(),
				FieldMerge::new().user_managed("/spec/host"),
			)
	}
}

impl MergePolicies {
	pub fn with_fallback(fallback: impl MergePolicy + 'static) -> Self {
		Self {
			fallback: Arc::new(fallback),
			by_kind: HashMap::new(),
		}
	}

	#[must_use]
	pub fn with_policy(mut self, kind: &ResourceKind, policy: impl MergePolicy + 'static) -> Self {
		self.by_kind
			.insert((kind.group.clone(), kind.kind.clone()), Arc::new(policy));
		self
	}

	pub fn for_kind(&self, kind: &ResourceKind) -> &dyn MergePolicy {
		self.by_kind
			.get(&(kind.group.clone(), kind.kind.clone()))
			.unwrap_or(&self.fallback)
			.as_ref()
	}
}
