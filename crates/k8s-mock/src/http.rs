//! HTTP-based mock Kubernetes server using wiremock.
//!
//! This provides a real HTTP server that can be used with actual kubeconfig-based
//! connections. Objects live in an in-memory store with API server semantics
//! (uids, resource versions, preconditions), so a client can converge against
//! it over several passes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bon::Builder;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value};
use tracing::{debug, trace};
use wiremock::{
	matchers::{header_regex, method, path, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

use super::{
	discovery::{DiscoveryMode, MockApiResource, MockDiscovery},
	store::{ApiStatus, ObjectStore, ResourcePath},
};

type SharedStore = Arc<Mutex<ObjectStore>>;

fn lock(store: &Mutex<ObjectStore>) -> MutexGuard<'_, ObjectStore> {
	store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	#[builder(default)]
	discovery_mode: DiscoveryMode,
	#[builder(default)]
	discovery: MockDiscovery,
	/// Resources to serve as raw manifests. The server derives API paths from
	/// apiVersion/kind using the discovery data.
	#[builder(default)]
	resources: Vec<Value>,
	/// Object names whose create and replace requests are rejected as invalid.
	#[builder(default)]
	reject_writes: Vec<String>,
	/// Plural resource names whose list requests are forbidden.
	#[builder(default)]
	forbid_lists: Vec<String>,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
	discovery: MockDiscovery,
	store: SharedStore,
}

impl HttpMockK8sServer {
	/// Start the mock server with all configured resources.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;
		debug!(uri = %server.uri(), "Started mock K8s server");

		let mut store = ObjectStore::default();
		for manifest in self.resources {
			match path_for_manifest(&manifest, &self.discovery) {
				Some(path) => {
					trace!(?path, "Registered resource");
					store.seed(&path, manifest);
				}
				None => debug!("skipping seed manifest of an unserved kind"),
			}
		}
		let store = Arc::new(Mutex::new(store));

		mount_version(&server).await;
		mount_discovery(&server, &self.discovery, self.discovery_mode).await;
		mount_resources(
			&server,
			&store,
			Arc::new(self.reject_writes),
			Arc::new(self.forbid_lists),
		)
		.await;

		RunningHttpMockK8sServer {
			server,
			discovery: self.discovery,
			store,
		}
	}
}

/// Derive the API path for a manifest using discovery data.
fn path_for_manifest(manifest: &Value, discovery: &MockDiscovery) -> Option<ResourcePath> {
	let api_version = manifest.get("apiVersion")?.as_str()?;
	let kind = manifest.get("kind")?.as_str()?;
	let name = manifest.pointer("/metadata/name")?.as_str()?;
	let namespace = manifest.pointer("/metadata/namespace").and_then(Value::as_str);
	resource_path(discovery, api_version, kind, namespace, Some(name))
}

fn resource_path(
	discovery: &MockDiscovery,
	api_version: &str,
	kind: &str,
	namespace: Option<&str>,
	name: Option<&str>,
) -> Option<ResourcePath> {
	let resource = discovery.by_kind(api_version, kind)?;
	Some(ResourcePath {
		group_version: api_version.to_string(),
		namespace: resource
			.namespaced
			.then(|| namespace.unwrap_or("default").to_string()),
		plural: resource.name.clone(),
		name: name.map(str::to_string),
	})
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Current state of an object, `None` when it does not exist.
	pub fn object(
		&self,
		api_version: &str,
		kind: &str,
		namespace: Option<&str>,
		name: &str,
	) -> Option<Value> {
		let path = resource_path(&self.discovery, api_version, kind, namespace, Some(name))?;
		lock(&self.store).find(&path, name).cloned()
	}

	/// Names of all stored objects of a kind in a namespace, sorted.
	pub fn names(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Vec<String> {
		resource_path(&self.discovery, api_version, kind, namespace, None)
			.map(|path| lock(&self.store).names(&path))
			.unwrap_or_default()
	}

	/// Add an object behind the client's back, as another actor would.
	pub fn insert(&self, manifest: Value) {
		if let Some(path) = path_for_manifest(&manifest, &self.discovery) {
			lock(&self.store).seed(&path, manifest);
		}
	}

	/// Method and path of every request that changed or tried to change state.
	pub async fn mutating_requests(&self) -> Vec<(String, String)> {
		self.server
			.received_requests()
			.await
			.unwrap_or_default()
			.into_iter()
			.filter(|req| matches!(req.method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE"))
			.map(|req| (req.method.as_str().to_string(), req.url.path().to_string()))
			.collect()
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: Some(user_name.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"major": "1",
			"minor": "31",
			"gitVersion": "v1.31.0",
			"gitCommit": "fake",
			"gitTreeState": "clean",
			"buildDate": "2024-08-13T00:00:00Z",
			"goVersion": "go1.22.5",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.mount(server)
		.await;
}

fn aggregated_group(group: &str, version: &str, resources: &[MockApiResource]) -> Value {
	let resources: Vec<_> = resources
		.iter()
		.map(|r| {
			json!({
				"resource": r.name,
				"responseKind": {
					"group": group,
					"version": version,
					"kind": r.kind
				},
				"scope": r.scope(),
				"verbs": r.verbs,
			})
		})
		.collect();

	json!({
		"metadata": {
			"name": group
		},
		"versions": [{
			"version": version,
			"resources": resources,
			"freshness": "Current"
		}]
	})
}

fn resource_list(group_version: &str, resources: &[MockApiResource]) -> Value {
	let resources: Vec<_> = resources
		.iter()
		.map(|r| {
			json!({
				"name": r.name,
				"singularName": "",
				"namespaced": r.namespaced,
				"kind": r.kind,
				"verbs": r.verbs,
			})
		})
		.collect();

	json!({
		"kind": "APIResourceList",
		"apiVersion": "v1",
		"groupVersion": group_version,
		"resources": resources
	})
}

async fn mount_discovery(server: &MockServer, discovery: &MockDiscovery, mode: DiscoveryMode) {
	// The Content-Type must name the aggregated format or clients treat the
	// body as a legacy APIVersions document.
	const AGGREGATED_DISCOVERY_CONTENT_TYPE: &str =
		"application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList";

	match mode {
		DiscoveryMode::Aggregated => {
			let core_body = json!({
				"kind": "APIGroupDiscoveryList",
				"apiVersion": "apidiscovery.k8s.io/v2",
				"items": [aggregated_group("", "v1", &discovery.core_resources)]
			});
			let groups: Vec<_> = discovery
				.group_resources
				.iter()
				.map(|(gv, rs)| {
					let (group, version) = gv.split_once('/').unwrap_or(("", gv));
					aggregated_group(group, version, rs)
				})
				.collect();
			let apis_body = json!({
				"kind": "APIGroupDiscoveryList",
				"apiVersion": "apidiscovery.k8s.io/v2",
				"items": groups
			});

			// set_body_raw keeps the Content-Type; set_body_json would overwrite it.
			for (endpoint, body) in [("/api", core_body), ("/apis", apis_body)] {
				Mock::given(method("GET"))
					.and(path(endpoint))
					.and(header_regex("accept", "apidiscovery"))
					.respond_with(
						ResponseTemplate::new(200)
							.set_body_raw(body.to_string(), AGGREGATED_DISCOVERY_CONTENT_TYPE),
					)
					.mount(server)
					.await;
			}
		}
		DiscoveryMode::Legacy => {
			for endpoint in ["/api", "/apis"] {
				Mock::given(method("GET"))
					.and(path(endpoint))
					.and(header_regex("accept", "apidiscovery"))
					.respond_with(ResponseTemplate::new(406))
					.mount(server)
					.await;
			}
		}
	}

	// Legacy discovery endpoints (fallback)
	Mock::given(method("GET"))
		.and(path("/api"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIVersions",
			"versions": ["v1"],
			"serverAddressByClientCIDRs": []
		})))
		.mount(server)
		.await;

	let groups: Vec<_> = discovery
		.group_resources
		.keys()
		.map(|gv| {
			let (group, version) = gv.split_once('/').unwrap_or(("", gv));
			json!({
				"name": group,
				"versions": [{"groupVersion": gv, "version": version}],
				"preferredVersion": {"groupVersion": gv, "version": version}
			})
		})
		.collect();

	Mock::given(method("GET"))
		.and(path("/apis"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIGroupList",
			"apiVersion": "v1",
			"groups": groups
		})))
		.mount(server)
		.await;

	Mock::given(method("GET"))
		.and(path("/api/v1"))
		.respond_with(
			ResponseTemplate::new(200).set_body_json(resource_list("v1", &discovery.core_resources)),
		)
		.mount(server)
		.await;

	for (gv, rs) in &discovery.group_resources {
		Mock::given(method("GET"))
			.and(path(format!("/apis/{gv}")))
			.respond_with(ResponseTemplate::new(200).set_body_json(resource_list(gv, rs)))
			.mount(server)
			.await;
	}
}

fn query_param(req: &Request, key: &str) -> Option<String> {
	req.url
		.query_pairs()
		.find(|(k, _)| k == key)
		.map(|(_, v)| v.into_owned())
}

fn body_json(req: &Request) -> Value {
	serde_json::from_slice(&req.body).unwrap_or(Value::Null)
}

fn respond(result: Result<Value, ApiStatus>, success: u16) -> ResponseTemplate {
	match result {
		Ok(object) => ResponseTemplate::new(success).set_body_json(object),
		Err(status) => status.into_response(),
	}
}

fn unknown_path(req: &Request) -> ResponseTemplate {
	ApiStatus::not_found(req.url.path()).into_response()
}

async fn mount_resources(
	server: &MockServer,
	store: &SharedStore,
	reject_writes: Arc<Vec<String>>,
	forbid_lists: Arc<Vec<String>>,
) {
	let rejected = |name: &str, writes: &[String]| -> Option<ApiStatus> {
		writes
			.iter()
			.any(|n| n == name)
			.then(|| ApiStatus::invalid(format!("{name}: rejected by admission")))
	};

	// GET handles both single objects and label-filtered lists.
	let get_store = Arc::clone(store);
	Mock::given(method("GET"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let Some(resource) = ResourcePath::parse(req.url.path()) else {
				return unknown_path(req);
			};
			let store = lock(&get_store);
			match &resource.name {
				Some(name) => respond(store.get(&resource, name), 200),
				None if forbid_lists.contains(&resource.plural) => {
					ApiStatus::forbidden(format!("{} is forbidden: cannot list", resource.plural))
						.into_response()
				}
				None => {
					let selector = query_param(req, "labelSelector");
					let items = store.list(&resource, selector.as_deref());
					ResponseTemplate::new(200).set_body_json(json!({
						"kind": "List",
						"apiVersion": "v1",
						"metadata": {"resourceVersion": "1"},
						"items": items
					}))
				}
			}
		})
		.mount(server)
		.await;

	let post_store = Arc::clone(store);
	let post_rejects = Arc::clone(&reject_writes);
	Mock::given(method("POST"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let Some(resource) = ResourcePath::parse(req.url.path()) else {
				return unknown_path(req);
			};
			let body = body_json(req);
			let name = body.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default();
			if let Some(status) = rejected(name, post_rejects.as_slice()) {
				return status.into_response();
			}
			respond(lock(&post_store).create(&resource, body.clone()), 201)
		})
		.mount(server)
		.await;

	let put_store = Arc::clone(store);
	Mock::given(method("PUT"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let Some((resource, name)) = ResourcePath::parse(req.url.path())
				.and_then(|r| r.name.clone().map(|name| (r, name)))
			else {
				return unknown_path(req);
			};
			if let Some(status) = rejected(&name, reject_writes.as_slice()) {
				return status.into_response();
			}
			respond(lock(&put_store).replace(&resource, &name, body_json(req)), 200)
		})
		.mount(server)
		.await;

	let delete_store = Arc::clone(store);
	Mock::given(method("DELETE"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let Some((resource, name)) = ResourcePath::parse(req.url.path())
				.and_then(|r| r.name.clone().map(|name| (r, name)))
			else {
				return unknown_path(req);
			};
			let options = body_json(req);
			let uid = options.pointer("/preconditions/uid").and_then(Value::as_str);
			respond(lock(&delete_store).delete(&resource, &name, uid), 200)
		})
		.mount(server)
		.await;
}
