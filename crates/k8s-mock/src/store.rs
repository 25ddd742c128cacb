//! In-memory object store behind the mock API server.
//!
//! Mirrors the API server semantics the engine relies on: server-assigned
//! `uid` and `resourceVersion`, optimistic concurrency on replace, uid
//! preconditions on delete and label-selector filtering on list.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use wiremock::ResponseTemplate;

/// Location of an object or collection in the API path space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResourcePath {
	pub group_version: String,
	pub namespace: Option<String>,
	pub plural: String,
	pub name: Option<String>,
}

impl ResourcePath {
	/// Parse a request path.
	///
	/// - `/api/v1/namespaces/default/configmaps` is a namespaced collection
	/// - `/apis/rbac.authorization.k8s.io/v1/clusterroles/reader` is a cluster-scoped object
	/// - `/api/v1/namespaces/default` is the `default` namespace object
	pub fn parse(path: &str) -> Option<Self> {
		let path = path.trim_end_matches('/');
		let (group_version, rest) = if let Some(rest) = path.strip_prefix("/api/") {
			let (version, rest) = rest.split_once('/')?;
			(version.to_string(), rest)
		} else {
			let rest = path.strip_prefix("/apis/")?;
			let mut parts = rest.splitn(3, '/');
			let group = parts.next()?;
			let version = parts.next()?;
			(format!("{group}/{version}"), parts.next()?)
		};

		let segments: Vec<&str> = rest.split('/').collect();
		let (namespace, plural, name) = match segments.as_slice() {
			["namespaces", ns, plural] => (Some(*ns), *plural, None),
			["namespaces", ns, plural, name] => (Some(*ns), *plural, Some(*name)),
			[plural] => (None, *plural, None),
			[plural, name] => (None, *plural, Some(*name)),
			_ => return None,
		};

		Some(Self {
			group_version,
			namespace: namespace.map(str::to_string),
			plural: plural.to_string(),
			name: name.map(str::to_string),
		})
	}

	fn key(&self, name: &str) -> StoreKey {
		StoreKey {
			group_version: self.group_version.clone(),
			plural: self.plural.clone(),
			namespace: self.namespace.clone(),
			name: name.to_string(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct StoreKey {
	pub group_version: String,
	pub plural: String,
	pub namespace: Option<String>,
	pub name: String,
}

/// A failed API call, rendered as a `Status` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ApiStatus {
	pub code: u16,
	pub reason: &'static str,
	pub message: String,
}

impl ApiStatus {
	pub fn not_found(name: &str) -> Self {
		Self {
			code: 404,
			reason: "NotFound",
			message: format!("\"{name}\" not found"),
		}
	}

	pub fn already_exists(name: &str) -> Self {
		Self {
			code: 409,
			reason: "AlreadyExists",
			message: format!("\"{name}\" already exists"),
		}
	}

	pub fn conflict(message: String) -> Self {
		Self {
			code: 409,
			reason: "Conflict",
			message,
		}
	}

	pub fn invalid(message: String) -> Self {
		Self {
			code: 422,
			reason: "Invalid",
			message,
		}
	}

	pub fn forbidden(message: String) -> Self {
		Self {
			code: 403,
			reason: "Forbidden",
			message,
		}
	}

	pub fn into_response(self) -> ResponseTemplate {
		ResponseTemplate::new(self.code).set_body_json(json!({
			"kind": "Status",
			"apiVersion": "v1",
			"metadata": {},
			"status": "Failure",
			"message": self.message,
			"reason": self.reason,
			"code": self.code
		}))
	}
}

/// Objects keyed by collection and name.
#[derive(Debug, Default)]
pub(crate) struct ObjectStore {
	objects: BTreeMap<StoreKey, Value>,
	next_uid: u64,
	next_version: u64,
}

impl ObjectStore {
	fn next_resource_version(&mut self) -> String {
		self.next_version += 1;
		self.next_version.to_string()
	}

	/// Insert a seed object, assigning a uid unless the manifest carries one.
	pub fn seed(&mut self, path: &ResourcePath, mut object: Value) -> Option<()> {
		let name = object.pointer("/metadata/name")?.as_str()?.to_string();
		if object.pointer("/metadata/uid").is_none() {
			self.next_uid += 1;
			object["metadata"]["uid"] = json!(format!("seed-{}", self.next_uid));
		}
		object["metadata"]["resourceVersion"] = json!(self.next_resource_version());
		self.objects.insert(path.key(&name), object);
		Some(())
	}

	pub fn get(&self, path: &ResourcePath, name: &str) -> Result<Value, ApiStatus> {
		self.objects
			.get(&path.key(name))
			.cloned()
			.ok_or_else(|| ApiStatus::not_found(name))
	}

	/// Objects of a collection; without a namespace, across all namespaces.
	pub fn list(&self, path: &ResourcePath, selector: Option<&str>) -> Vec<Value> {
		let selector = LabelSelector::parse(selector.unwrap_or_default());
		self.objects
			.iter()
			.filter(|(key, _)| {
				key.group_version == path.group_version
					&& key.plural == path.plural
					&& (path.namespace.is_none() || key.namespace == path.namespace)
			})
			.map(|(_, object)| object)
			.filter(|object| selector.matches(object))
			.cloned()
			.collect()
	}

	pub fn create(&mut self, path: &ResourcePath, mut object: Value) -> Result<Value, ApiStatus> {
		let Some(name) = object.pointer("/metadata/name").and_then(Value::as_str).map(str::to_string) else {
			return Err(ApiStatus::invalid("metadata.name: Required value".to_string()));
		};
		let key = path.key(&name);
		if self.objects.contains_key(&key) {
			return Err(ApiStatus::already_exists(&name));
		}

		self.next_uid += 1;
		object["metadata"]["uid"] = json!(format!("uid-{}", self.next_uid));
		object["metadata"]["resourceVersion"] = json!(self.next_resource_version());
		if let Some(ns) = &path.namespace {
			object["metadata"]["namespace"] = json!(ns);
		}
		self.objects.insert(key, object.clone());
		Ok(object)
	}

	/// Replace an object. A resourceVersion in the body must match the stored one.
	pub fn replace(&mut self, path: &ResourcePath, name: &str, mut object: Value) -> Result<Value, ApiStatus> {
		let key = path.key(name);
		let Some(current) = self.objects.get(&key) else {
			return Err(ApiStatus::not_found(name));
		};

		let current_version = current.pointer("/metadata/resourceVersion").cloned();
		if let Some(sent) = object.pointer("/metadata/resourceVersion") {
			if Some(sent) != current_version.as_ref() {
				return Err(ApiStatus::conflict(format!(
					"Operation cannot be fulfilled on {} \"{name}\": the object has been modified",
					path.plural
				)));
			}
		}

		let uid = current.pointer("/metadata/uid").cloned().unwrap_or(Value::Null);
		object["metadata"]["uid"] = uid;
		object["metadata"]["resourceVersion"] = json!(self.next_resource_version());
		self.objects.insert(key, object.clone());
		Ok(object)
	}

	/// Delete an object, honouring a uid precondition.
	pub fn delete(&mut self, path: &ResourcePath, name: &str, uid: Option<&str>) -> Result<Value, ApiStatus> {
		let key = path.key(name);
		let Some(current) = self.objects.get(&key) else {
			return Err(ApiStatus::not_found(name));
		};
		if let Some(uid) = uid {
			let stored = current.pointer("/metadata/uid").and_then(Value::as_str);
			if stored != Some(uid) {
				return Err(ApiStatus::conflict(format!(
					"Precondition failed: UID in precondition: {uid}, UID in object meta: {}",
					stored.unwrap_or_default()
				)));
			}
		}
		self.objects.remove(&key).ok_or_else(|| ApiStatus::not_found(name))
	}

	pub fn find(&self, path: &ResourcePath, name: &str) -> Option<&Value> {
		self.objects.get(&path.key(name))
	}

	pub fn names(&self, path: &ResourcePath) -> Vec<String> {
		self.objects
			.keys()
			.filter(|key| {
				key.group_version == path.group_version
					&& key.plural == path.plural
					&& key.namespace == path.namespace
			})
			.map(|key| key.name.clone())
			.collect()
	}
}

enum Requirement {
	Equals(String, String),
	NotEquals(String, String),
	Exists(String),
	NotExists(String),
}

/// Equality-based label selector (`a=b,c!=d,e,!f`).
struct LabelSelector(Vec<Requirement>);

impl LabelSelector {
	fn parse(selector: &str) -> Self {
		let requirements = selector
			.split(',')
			.map(str::trim)
			.filter(|term| !term.is_empty())
			.map(|term| {
				if let Some((key, value)) = term.split_once("!=") {
					Requirement::NotEquals(key.trim().to_string(), value.trim().to_string())
				} else if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
					Requirement::Equals(key.trim().to_string(), value.trim().to_string())
				} else if let Some(key) = term.strip_prefix('!') {
					Requirement::NotExists(key.trim().to_string())
				} else {
					Requirement::Exists(term.to_string())
				}
			})
			.collect();
		Self(requirements)
	}

	fn matches(&self, object: &Value) -> bool {
		let labels = object.pointer("/metadata/labels");
		let label = |key: &str| labels.and_then(|l| l.get(key)).and_then(Value::as_str);
		self.0.iter().all(|requirement| match requirement {
			Requirement::Equals(key, value) => label(key.as_str()) == Some(value.as_str()),
			Requirement::NotEquals(key, value) => label(key.as_str()) != Some(value.as_str()),
			Requirement::Exists(key) => label(key.as_str()).is_some(),
			Requirement::NotExists(key) => label(key.as_str()).is_none(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn collection(path: &str) -> ResourcePath {
		ResourcePath::parse(path).unwrap()
	}

	#[test]
	fn test_parse_paths() {
		assert_eq!(
			collection("/api/v1/namespaces/default/configmaps/app"),
			ResourcePath {
				group_version: "v1".to_string(),
				namespace: Some("default".to_string()),
				plural: "configmaps".to_string(),
				name: Some("app".to_string()),
			}
		);
		assert_eq!(
			collection("/apis/rbac.authorization.k8s.io/v1/clusterroles"),
			ResourcePath {
				group_version: "rbac.authorization.k8s.io/v1".to_string(),
				namespace: None,
				plural: "clusterroles".to_string(),
				name: None,
			}
		);
		let ns = collection("/api/v1/namespaces/default");
		assert_eq!((ns.plural.as_str(), ns.name.as_deref()), ("namespaces", Some("default")));
		assert!(ResourcePath::parse("/apis/apps").is_none());
	}

	#[test]
	fn test_replace_requires_current_version() {
		let path = collection("/api/v1/namespaces/default/configmaps");
		let mut store = ObjectStore::default();
		let created = store
			.create(&path, json!({ "metadata": { "name": "app" }, "data": {} }))
			.unwrap();
		assert_eq!(created["metadata"]["uid"], "uid-1");
		assert_eq!(created["metadata"]["namespace"], "default");

		let updated = store.replace(&path, "app", created.clone()).unwrap();
		assert_eq!(updated["metadata"]["uid"], "uid-1");
		assert_ne!(updated["metadata"]["resourceVersion"], created["metadata"]["resourceVersion"]);

		let stale = store.replace(&path, "app", created).unwrap_err();
		assert_eq!((stale.code, stale.reason), (409, "Conflict"));
	}

	#[test]
	fn test_create_twice_is_already_exists() {
		let path = collection("/api/v1/namespaces/default/configmaps");
		let mut store = ObjectStore::default();
		store.create(&path, json!({ "metadata": { "name": "app" } })).unwrap();
		let err = store.create(&path, json!({ "metadata": { "name": "app" } })).unwrap_err();
		assert_eq!(err.reason, "AlreadyExists");
	}

	#[test]
	fn test_delete_checks_uid() {
		let path = collection("/api/v1/namespaces/default/configmaps");
		let mut store = ObjectStore::default();
		store.create(&path, json!({ "metadata": { "name": "app" } })).unwrap();

		assert_eq!(store.delete(&path, "app", Some("uid-9")).unwrap_err().code, 409);
		store.delete(&path, "app", Some("uid-1")).unwrap();
		assert_eq!(store.delete(&path, "app", None).unwrap_err().code, 404);
	}

	#[test]
	fn test_list_filters_by_selector_and_namespace() {
		let mut store = ObjectStore::default();
		let team_a = collection("/api/v1/namespaces/a/configmaps");
		let team_b = collection("/api/v1/namespaces/b/configmaps");
		store
			.create(&team_a, json!({ "metadata": { "name": "one", "labels": { "app": "tempo", "instance": "x" } } }))
			.unwrap();
		store
			.create(&team_a, json!({ "metadata": { "name": "two", "labels": { "app": "tempo", "instance": "y" } } }))
			.unwrap();
		store
			.create(&team_b, json!({ "metadata": { "name": "three", "labels": { "app": "tempo", "instance": "x" } } }))
			.unwrap();

		let names = |items: Vec<Value>| -> Vec<String> {
			items
				.iter()
				.map(|o| o["metadata"]["name"].as_str().unwrap().to_string())
				.collect()
		};
		assert_eq!(names(store.list(&team_a, Some("app=tempo,instance=x"))), ["one"]);
		assert_eq!(names(store.list(&team_a, Some("instance!=x"))), ["two"]);
		assert_eq!(names(store.list(&team_a, Some("!missing"))).len(), 2);
		assert_eq!(
			names(store.list(&collection("/api/v1/configmaps"), Some("instance==x"))).len(),
			2
		);
	}
}
