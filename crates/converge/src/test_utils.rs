//! Common test utilities.

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	sync::{Mutex, MutexGuard, PoisonError},
	time::Duration,
};

use kube::api::DynamicObject;
use serde_json::json;

use crate::{
	backend::{BackendError, ResourceBackend},
	kind::ResourceKind,
	object::DesiredObject,
	scope::{OwnerRef, OwnershipScope},
};

/// A backend call as observed by [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
	List { kind: String, selector: String },
	Get { kind: String, name: String },
	Create { kind: String, name: String },
	Replace { kind: String, name: String },
	Delete { kind: String, name: String },
}

type Key = (String, String, Option<String>, String);

#[derive(Default)]
struct State {
	objects: BTreeMap<Key, DynamicObject>,
	calls: Vec<Call>,
	next_uid: u64,
	failing_lists: HashSet<String>,
	failing_writes: HashSet<String>,
	failing_deletes: HashSet<String>,
	conflicts: HashMap<String, u32>,
}

/// An in-memory resource backend for testing.
///
/// Keeps objects in a map, assigns uids and resource versions like an API
/// server would, enforces optimistic concurrency on replace and records every
/// call. Failures and conflicts can be injected per kind or object name.
#[derive(Default)]
pub struct MemoryBackend {
	state: Mutex<State>,
	latency: Option<Duration>,
}

fn key_of(kind: &ResourceKind, namespace: Option<&str>, name: &str) -> Key {
	(
		kind.api_version(),
		kind.kind.clone(),
		namespace.filter(|_| kind.is_namespaced()).map(str::to_string),
		name.to_string(),
	)
}

fn object_key(object: &DynamicObject) -> Key {
	let (api_version, kind) = object
		.types
		.as_ref()
		.map(|t| (t.api_version.clone(), t.kind.clone()))
		.unwrap_or_default();
	(
		api_version,
		kind,
		object.metadata.namespace.clone(),
		object.metadata.name.clone().unwrap_or_default(),
	)
}

fn matches_selector(object: &DynamicObject, selector: &str) -> bool {
	let labels = object.metadata.labels.clone().unwrap_or_default();
	selector
		.split(',')
		.filter(|term| !term.is_empty())
		.all(|term| match term.split_once('=') {
			Some((k, v)) => labels.get(k).is_some_and(|actual| actual == v),
			None => labels.contains_key(term),
		})
}

fn rejected(message: &str) -> BackendError {
	BackendError::Rejected {
		code: 500,
		reason: "InternalError".to_string(),
		message: message.to_string(),
	}
}

impl MemoryBackend {
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	async fn delay(&self) {
		if let Some(latency) = self.latency {
			tokio::time::sleep(latency).await;
		}
	}

	/// Seed an object; a uid and resource version are assigned when missing.
	pub fn with_object(self, mut object: DynamicObject) -> Self {
		{
			let mut state = self.state();
			if object.metadata.uid.is_none() {
				state.next_uid += 1;
				object.metadata.uid = Some(format!("uid-{}", state.next_uid));
			}
			object.metadata.resource_version.get_or_insert_with(|| "1".to_string());
			state.objects.insert(object_key(&object), object);
		}
		self
	}

	/// Make every list of `kind` (short kind name) fail.
	pub fn fail_list(self, kind: &str) -> Self {
		self.state().failing_lists.insert(kind.to_string());
		self
	}

	/// Make get/create/replace of objects named `name` fail.
	pub fn fail_writes(self, name: &str) -> Self {
		self.state().failing_writes.insert(name.to_string());
		self
	}

	/// Make deletion of objects named `name` fail.
	pub fn fail_delete(self, name: &str) -> Self {
		self.state().failing_deletes.insert(name.to_string());
		self
	}

	/// Answer the next `times` replaces of `name` with a conflict.
	pub fn conflict(self, name: &str, times: u32) -> Self {
		self.state().conflicts.insert(name.to_string(), times);
		self
	}

	/// Delay every call by `latency`.
	pub fn with_latency(mut self, latency: Duration) -> Self {
		self.latency = Some(latency);
		self
	}

	pub fn calls(&self) -> Vec<Call> {
		self.state().calls.clone()
	}

	pub fn mutating_calls(&self) -> Vec<Call> {
		self.calls()
			.into_iter()
			.filter(|c| {
				matches!(
					c,
					Call::Create { .. } | Call::Replace { .. } | Call::Delete { .. }
				)
			})
			.collect()
	}

	pub fn object(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
		self.state()
			.objects
			.get(&key_of(kind, namespace, name))
			.cloned()
	}

	pub fn names(&self) -> Vec<String> {
		self.state()
			.objects
			.values()
			.filter_map(|o| o.metadata.name.clone())
			.collect()
	}

	/// Remove an object behind the engine's back.
	pub fn remove(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str) {
		self.state().objects.remove(&key_of(kind, namespace, name));
	}
}

impl ResourceBackend for MemoryBackend {
	async fn list(
		&self,
		kind: &ResourceKind,
		namespace: &str,
		selector: &str,
	) -> Result<Vec<DynamicObject>, BackendError> {
		self.delay().await;
		let mut state = self.state();
		state.calls.push(Call::List {
			kind: kind.kind.clone(),
			selector: selector.to_string(),
		});
		if state.failing_lists.contains(&kind.kind) {
			return Err(rejected("list failed"));
		}
		Ok(state
			.objects
			.iter()
			.filter(|((api_version, k, ns, _), _)| {
				*api_version == kind.api_version()
					&& *k == kind.kind
					&& ns.as_deref() == Some(namespace)
			})
			.map(|(_, o)| o)
			.filter(|o| matches_selector(o, selector))
			.cloned()
			.collect())
	}

	async fn get(
		&self,
		kind: &ResourceKind,
		namespace: Option<&str>,
		name: &str,
	) -> Result<Option<DynamicObject>, BackendError> {
		self.delay().await;
		let mut state = self.state();
		state.calls.push(Call::Get {
			kind: kind.kind.clone(),
			name: name.to_string(),
		});
		if state.failing_writes.contains(name) {
			return Err(rejected("get failed"));
		}
		Ok(state.objects.get(&key_of(kind, namespace, name)).cloned())
	}

	async fn create(
		&self,
		kind: &ResourceKind,
		object: &DynamicObject,
	) -> Result<DynamicObject, BackendError> {
		self.delay().await;
		let mut state = self.state();
		let name = object.metadata.name.clone().unwrap_or_default();
		state.calls.push(Call::Create {
			kind: kind.kind.clone(),
			name: name.clone(),
		});
		if state.failing_writes.contains(&name) {
			return Err(rejected("create failed"));
		}
		let key = key_of(kind, object.metadata.namespace.as_deref(), &name);
		if state.objects.contains_key(&key) {
			return Err(BackendError::AlreadyExists);
		}
		state.next_uid += 1;
		let mut stored = object.clone();
		stored.metadata.uid = Some(format!("uid-{}", state.next_uid));
		stored.metadata.resource_version = Some("1".to_string());
		state.objects.insert(key, stored.clone());
		Ok(stored)
	}

	async fn replace(
		&self,
		kind: &ResourceKind,
		object: &DynamicObject,
	) -> Result<DynamicObject, BackendError> {
		self.delay().await;
		let mut state = self.state();
		let name = object.metadata.name.clone().unwrap_or_default();
		state.calls.push(Call::Replace {
			kind: kind.kind.clone(),
			name: name.clone(),
		});
		if state.failing_writes.contains(&name) {
			return Err(rejected("replace failed"));
		}
		if let Some(remaining) = state.conflicts.get_mut(&name) {
			if *remaining > 0 {
				*remaining -= 1;
				return Err(BackendError::Conflict {
					message: "the object has been modified".to_string(),
				});
			}
		}
		let key = key_of(kind, object.metadata.namespace.as_deref(), &name);
		let Some(current) = state.objects.get(&key) else {
			return Err(BackendError::NotFound);
		};
		if current.metadata.resource_version != object.metadata.resource_version {
			return Err(BackendError::Conflict {
				message: "stale resourceVersion".to_string(),
			});
		}
		let version: u64 = current
			.metadata
			.resource_version
			.as_deref()
			.and_then(|v| v.parse().ok())
			.unwrap_or(0);
		let mut stored = object.clone();
		stored.metadata.uid.clone_from(&current.metadata.uid);
		stored.metadata.resource_version = Some((version + 1).to_string());
		state.objects.insert(key, stored.clone());
		Ok(stored)
	}

	async fn delete(
		&self,
		kind: &ResourceKind,
		namespace: Option<&str>,
		name: &str,
		uid: Option<&str>,
	) -> Result<(), BackendError> {
		self.delay().await;
		let mut state = self.state();
		state.calls.push(Call::Delete {
			kind: kind.kind.clone(),
			name: name.to_string(),
		});
		if state.failing_deletes.contains(name) {
			return Err(rejected("delete failed"));
		}
		let key = key_of(kind, namespace, name);
		let Some(current) = state.objects.get(&key) else {
			return Err(BackendError::NotFound);
		};
		if uid.is_some_and(|uid| current.metadata.uid.as_deref() != Some(uid)) {
			return Err(BackendError::Conflict {
				message: "uid precondition failed".to_string(),
			});
		}
		state.objects.remove(&key);
		Ok(())
	}
}

/// Scope of a TempoStack named `name` in the `observability` namespace.
pub fn scope_for(name: &str, uid: &str) -> OwnershipScope {
	OwnershipScope::with_common_labels(
		OwnerRef {
			api_version: "tempo.grafana.com/v1alpha1".to_string(),
			kind: "TempoStack".to_string(),
			name: name.to_string(),
			uid: uid.to_string(),
		},
		"observability",
		"tempo",
		"tempo-operator",
	)
}

/// A desired object of `kind` named `name` with the given `spec`.
pub fn desired(kind: ResourceKind, name: &str, spec: serde_json::Value) -> DesiredObject {
	DesiredObject::from_manifest(
		kind,
		json!({
			"metadata": { "name": name },
			"spec": spec,
		}),
	)
	.expect("valid test manifest")
}

/// A live object of `kind` already stamped as owned by `scope`.
pub fn owned(scope: &OwnershipScope, kind: ResourceKind, name: &str) -> DynamicObject {
	let desired = desired(kind.clone(), name, json!({}));
	let mut object = desired.object().clone();
	scope.stamp(&kind, &mut object).expect("stampable test object");
	object
}
