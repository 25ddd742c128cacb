//! Resolving the owner instance named on the command line.

use std::{collections::BTreeMap, fmt, str::FromStr};

use anyhow::{Context, Result};
use clap::Args;
use converge::{
	k8s::{ApiCatalog, KubeBackend},
	scope::{common_labels, OwnerRef, OwnershipScope},
	Deadline, ResourceBackend,
};

/// Owner named as `<apiVersion>/<Kind>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerTarget {
	pub api_version: String,
	pub kind: String,
	pub name: String,
}

impl FromStr for OwnerTarget {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut parts = s.rsplitn(3, '/');
		let (Some(name), Some(kind), Some(api_version)) = (parts.next(), parts.next(), parts.next())
		else {
			return Err(format!("expected <apiVersion>/<Kind>/<name>, got `{s}`"));
		};
		if [api_version, kind, name].iter().any(|p| p.is_empty()) {
			return Err(format!("expected <apiVersion>/<Kind>/<name>, got `{s}`"));
		}
		Ok(Self {
			api_version: api_version.to_string(),
			kind: kind.to_string(),
			name: name.to_string(),
		})
	}
}

impl fmt::Display for OwnerTarget {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}/{}", self.api_version, self.kind, self.name)
	}
}

fn parse_label(s: &str) -> Result<(String, String), String> {
	match s.split_once('=') {
		Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
		_ => Err(format!("expected KEY=VALUE, got `{s}`")),
	}
}

/// Arguments selecting one owner instance and its ownership labels.
#[derive(Debug, Clone, Args)]
pub struct OwnerArgs {
	/// Owner instance as <apiVersion>/<Kind>/<name>
	#[arg(long)]
	pub owner: OwnerTarget,

	/// Namespace of the owner and of its namespaced objects
	#[arg(long, short = 'n')]
	pub namespace: String,

	/// Value of the app.kubernetes.io/name label
	#[arg(long, default_value = "converge")]
	pub app: String,

	/// Value of the app.kubernetes.io/managed-by label
	#[arg(long, default_value = "converge")]
	pub managed_by: String,

	/// Additional ownership label (Format: key=value)
	#[arg(long = "instance-label", value_parser = parse_label)]
	pub instance_labels: Vec<(String, String)>,

	/// Kubernetes context to use instead of the current one
	#[arg(long)]
	pub context: Option<String>,
}

impl OwnerArgs {
	/// Label set marking objects of this owner.
	pub fn labels(&self) -> BTreeMap<String, String> {
		let mut labels = common_labels(&self.app, &self.owner.name, &self.managed_by);
		labels.extend(self.instance_labels.iter().cloned());
		labels
	}

	/// Look the owner up in the cluster and build its ownership scope.
	pub async fn scope(
		&self,
		catalog: &ApiCatalog,
		backend: &KubeBackend,
		deadline: Deadline,
	) -> Result<OwnershipScope> {
		let target = &self.owner;
		let kind = catalog
			.resolve(&target.api_version, &target.kind)
			.with_context(|| format!("resolving owner kind of {target}"))?;
		let object = deadline
			.run(backend.get(&kind, Some(&self.namespace), &target.name))
			.await
			.with_context(|| format!("fetching owner {target}"))?
			.with_context(|| format!("owner {target} not found in namespace {}", self.namespace))?;
		let uid = object
			.metadata
			.uid
			.filter(|uid| !uid.is_empty())
			.with_context(|| format!("owner {target} has no uid"))?;

		let owner = OwnerRef {
			api_version: target.api_version.clone(),
			kind: target.kind.clone(),
			name: target.name.clone(),
			uid,
		};
		Ok(OwnershipScope::new(owner, self.namespace.clone(), self.labels()))
	}
}
