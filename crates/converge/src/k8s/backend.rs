//! [`ResourceBackend`] over the Kubernetes API.

use kube::{
	api::{Api, DeleteParams, DynamicObject, ListParams, PostParams, Preconditions},
	Client,
};

use crate::{
	backend::{BackendError, ResourceBackend},
	kind::ResourceKind,
};

/// Resource backend talking to a Kubernetes API server.
#[derive(Clone)]
pub struct KubeBackend {
	client: Client,
}

impl std::fmt::Debug for KubeBackend {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KubeBackend").finish_non_exhaustive()
	}
}

impl KubeBackend {
	pub fn new(client: Client) -> Self {
		Self { client }
	}

	/// Create a dynamic API for the given kind.
	///
	/// The namespace is ignored for cluster-scoped kinds.
	fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
		let ar = kind.api_resource();
		match namespace.filter(|_| kind.is_namespaced()) {
			Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
			None => Api::all_with(self.client.clone(), &ar),
		}
	}
}

fn classify(error: kube::Error) -> BackendError {
	match error {
		kube::Error::Api(ref status) if status.code == 404 => BackendError::NotFound,
		kube::Error::Api(ref status) if status.code == 409 && status.reason == "AlreadyExists" => {
			BackendError::AlreadyExists
		}
		kube::Error::Api(ref status) if status.code == 409 => BackendError::Conflict {
			message: status.message.clone(),
		},
		kube::Error::Api(ref status) => BackendError::Rejected {
			code: status.code,
			reason: status.reason.clone(),
			message: status.message.clone(),
		},
		kube::Error::SerdeError(source) => BackendError::Serialization(source),
		other => BackendError::Transport(Box::new(other)),
	}
}

fn name_of(object: &DynamicObject) -> &str {
	object.metadata.name.as_deref().unwrap_or_default()
}

impl ResourceBackend for KubeBackend {
	async fn list(
		&self,
		kind: &ResourceKind,
		namespace: &str,
		selector: &str,
	) -> Result<Vec<DynamicObject>, BackendError> {
		let list = self
			.api(kind, Some(namespace))
			.list(&ListParams::default().labels(selector))
			.await
			.map_err(classify)?;
		Ok(list.items)
	}

	async fn get(
		&self,
		kind: &ResourceKind,
		namespace: Option<&str>,
		name: &str,
	) -> Result<Option<DynamicObject>, BackendError> {
		self.api(kind, namespace)
			.get_opt(name)
			.await
			.map_err(classify)
	}

	async fn create(
		&self,
		kind: &ResourceKind,
		object: &DynamicObject,
	) -> Result<DynamicObject, BackendError> {
		self.api(kind, object.metadata.namespace.as_deref())
			.create(&PostParams::default(), object)
			.await
			.map_err(classify)
	}

	async fn replace(
		&self,
		kind: &ResourceKind,
		object: &DynamicObject,
	) -> Result<DynamicObject, BackendError> {
		self.api(kind, object.metadata.namespace.as_deref())
			.replace(name_of(object), &PostParams::default(), object)
			.await
			.map_err(classify)
	}

	async fn delete(
		&self,
		kind: &ResourceKind,
		namespace: Option<&str>,
		name: &str,
		uid: Option<&str>,
	) -> Result<(), BackendError> {
		let params = DeleteParams {
			preconditions: uid.map(|uid| Preconditions {
				uid: Some(uid.to_string()),
				resource_version: None,
			}),
			..DeleteParams::default()
		};
		self.api(kind, namespace)
			.delete(name, &params)
			.await
			.map(|_| ())
			.map_err(classify)
	}
}
