//! Preconditions checked before a pass touches any object.
//!
//! These helpers turn the results of external collaborators (storage secret,
//! tenant configuration, cluster TLS policy) into the engine's precomputed
//! degraded condition. They do not build manifests.

use std::{collections::HashSet, fmt, str::FromStr};

use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

use crate::{
	backend::{BackendError, Deadline, ResourceBackend},
	config::ConfigSnapshot,
	kind::ResourceKind,
	status::{Degraded, DegradedReason, SnapshotUpdate},
};

/// Object storage flavour named by the storage secret type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
	S3,
	Azure,
	Gcs,
}

impl StorageKind {
	/// Keys the storage secret must carry, non-empty.
	pub fn required_keys(&self) -> &'static [&'static str] {
		match self {
			StorageKind::S3 => &["endpoint", "bucket", "access_key_id", "access_key_secret"],
			StorageKind::Azure => &["container", "account_name", "account_key"],
			StorageKind::Gcs => &["bucketname", "key.json"],
		}
	}
}

impl FromStr for StorageKind {
	type Err = StorageError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"s3" => Ok(StorageKind::S3),
			"azure" => Ok(StorageKind::Azure),
			"gcs" => Ok(StorageKind::Gcs),
			other => Err(StorageError::UnknownType(other.to_string())),
		}
	}
}

impl fmt::Display for StorageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			StorageKind::S3 => "s3",
			StorageKind::Azure => "azure",
			StorageKind::Gcs => "gcs",
		})
	}
}

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("could not fetch storage secret {name}")]
	Fetch {
		name: String,
		#[source]
		source: BackendError,
	},

	#[error("storage secret {name} not found")]
	NotFound { name: String },

	#[error("decoding storage secret")]
	Decode(#[source] serde_json::Error),

	#[error("storage secret type `{0}` is not recognized")]
	UnknownType(String),

	#[error("invalid storage secret: {}", .details.join(", "))]
	Invalid { details: Vec<String> },
}

/// Check that `secret` holds every key `kind` needs.
pub fn validate_storage_secret(kind: StorageKind, secret: &Secret) -> Result<(), StorageError> {
	let details: Vec<String> = kind
		.required_keys()
		.iter()
		.filter(|key| {
			secret
				.data
				.as_ref()
				.and_then(|data| data.get(**key))
				.is_none_or(|value| value.0.is_empty())
		})
		.map(|key| format!("storage secret must contain \"{key}\" field"))
		.collect();

	if details.is_empty() {
		Ok(())
	} else {
		Err(StorageError::Invalid { details })
	}
}

/// Fetch the storage secret and validate it for `secret_type`.
#[instrument(skip(backend, deadline))]
pub async fn check_storage<B: ResourceBackend>(
	backend: &B,
	namespace: &str,
	secret_name: &str,
	secret_type: &str,
	deadline: Deadline,
) -> Result<StorageKind, StorageError> {
	let object = deadline
		.run(backend.get(&ResourceKind::secret(), Some(namespace), secret_name))
		.await
		.map_err(|source| StorageError::Fetch {
			name: secret_name.to_string(),
			source,
		})?
		.ok_or_else(|| StorageError::NotFound {
			name: secret_name.to_string(),
		})?;

	let secret: Secret = serde_json::to_value(&object)
		.and_then(serde_json::from_value)
		.map_err(StorageError::Decode)?;

	let kind = secret_type.parse()?;
	validate_storage_secret(kind, &secret)?;
	Ok(kind)
}

/// How tenants authenticate against the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantsMode {
	Static,
	Openshift,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcSpec {
	pub secret_name: String,
	pub issuer_url: String,
	#[serde(default)]
	pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantAuthentication {
	pub tenant_name: String,
	pub tenant_id: String,
	#[serde(default)]
	pub oidc: Option<OidcSpec>,
}

/// Multi-tenant gateway configuration of an owner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantsConfig {
	pub mode: TenantsMode,
	#[serde(default)]
	pub authentication: Vec<TenantAuthentication>,
	#[serde(default)]
	pub authorization: Option<serde_json::Value>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TenantsError {
	#[error("tenant {tenant} needs oidc settings in static mode")]
	MissingOidc { tenant: String },

	#[error("tenant {tenant} must not define oidc settings in openshift mode")]
	OidcNotAllowed { tenant: String },

	#[error("authorization is required in static mode")]
	MissingAuthorization,

	#[error("authorization must not be defined in openshift mode")]
	AuthorizationNotAllowed,

	#[error("tenant name {0} is used more than once")]
	DuplicateName(String),

	#[error("tenant id {0} is used more than once")]
	DuplicateId(String),
}

impl TenantsConfig {
	pub fn validate(&self) -> Result<(), TenantsError> {
		let mut names = HashSet::new();
		let mut ids = HashSet::new();
		for tenant in &self.authentication {
			if !names.insert(tenant.tenant_name.as_str()) {
				return Err(TenantsError::DuplicateName(tenant.tenant_name.clone()));
			}
			if !ids.insert(tenant.tenant_id.as_str()) {
				return Err(TenantsError::DuplicateId(tenant.tenant_id.clone()));
			}
			match (self.mode, &tenant.oidc) {
				(TenantsMode::Static, None) => {
					return Err(TenantsError::MissingOidc {
						tenant: tenant.tenant_name.clone(),
					});
				}
				(TenantsMode::Openshift, Some(_)) => {
					return Err(TenantsError::OidcNotAllowed {
						tenant: tenant.tenant_name.clone(),
					});
				}
				_ => {}
			}
		}

		match (self.mode, &self.authorization) {
			(TenantsMode::Static, None) => Err(TenantsError::MissingAuthorization),
			(TenantsMode::Openshift, Some(_)) => Err(TenantsError::AuthorizationNotAllowed),
			_ => Ok(()),
		}
	}
}

/// TLS settings for served endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsProfile {
	pub min_version: String,
	pub ciphers: Vec<String>,
}

impl TlsProfile {
	/// Profile used when the cluster does not publish one.
	pub fn builtin_default() -> Self {
		Self {
			min_version: "VersionTLS12".to_string(),
			ciphers: [
				"TLS_AES_128_GCM_SHA256",
				"TLS_AES_256_GCM_SHA384",
				"TLS_CHACHA20_POLY1305_SHA256",
				"ECDHE-ECDSA-AES128-GCM-SHA256",
				"ECDHE-RSA-AES128-GCM-SHA256",
				"ECDHE-ECDSA-AES256-GCM-SHA384",
				"ECDHE-RSA-AES256-GCM-SHA384",
				"ECDHE-ECDSA-CHACHA20-POLY1305",
				"ECDHE-RSA-CHACHA20-POLY1305",
			]
			.into_iter()
			.map(str::to_string)
			.collect(),
		}
	}
}

/// Result of looking up the cluster TLS security profile.
#[derive(Debug)]
pub enum TlsProfileResolution {
	Resolved(TlsProfile),
	/// The cluster-wide policy could not be read.
	Unavailable,
	/// The cluster publishes a policy that cannot be used.
	Invalid(String),
	Failed(Box<dyn std::error::Error + Send + Sync>),
}

/// TLS profile a pass proceeds with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsDecision {
	Profile(TlsProfile),
	BuiltinDefault,
}

impl TlsDecision {
	pub fn profile(&self) -> TlsProfile {
		match self {
			TlsDecision::Profile(profile) => profile.clone(),
			TlsDecision::BuiltinDefault => TlsProfile::builtin_default(),
		}
	}
}

#[derive(Debug, Error)]
pub enum PreflightError {
	#[error("resolving external configuration")]
	External(#[source] Box<dyn std::error::Error + Send + Sync>),

	#[error("reading cluster DNS configuration")]
	BaseDomain(#[source] BackendError),

	#[error("cluster DNS configuration has no base domain")]
	MissingBaseDomain,
}

/// Outcome of the preconditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
	Proceed {
		storage: StorageKind,
		tls: TlsDecision,
	},
	Degraded(Degraded),
}

impl Verdict {
	pub fn degraded(&self) -> Option<&Degraded> {
		match self {
			Verdict::Degraded(degraded) => Some(degraded),
			Verdict::Proceed { .. } => None,
		}
	}
}

/// Collected collaborator results, judged in a fixed order.
#[derive(Debug)]
pub struct Preflight {
	pub storage: Result<StorageKind, StorageError>,
	pub tenants: Result<(), TenantsError>,
	pub tls: TlsProfileResolution,
}

impl Preflight {
	/// Storage first, then tenants, then TLS; the first failing check decides.
	pub fn verdict(self) -> Result<Verdict, PreflightError> {
		let storage = match self.storage {
			Ok(storage) => storage,
			Err(error) => {
				return Ok(Verdict::Degraded(Degraded::new(
					DegradedReason::InvalidStorageConfig,
					error.to_string(),
				)));
			}
		};

		if let Err(error) = self.tenants {
			return Ok(Verdict::Degraded(Degraded::new(
				DegradedReason::InvalidTenantsConfiguration,
				format!("Invalid tenants configuration: {error}"),
			)));
		}

		let tls = match self.tls {
			TlsProfileResolution::Resolved(profile) => TlsDecision::Profile(profile),
			TlsProfileResolution::Unavailable => {
				tracing::info!("cluster TLS profile unavailable, using built-in default");
				TlsDecision::BuiltinDefault
			}
			TlsProfileResolution::Invalid(detail) => {
				return Ok(Verdict::Degraded(Degraded::new(
					DegradedReason::CouldNotGetOpenShiftTLSPolicy,
					detail,
				)));
			}
			TlsProfileResolution::Failed(error) => return Err(PreflightError::External(error)),
		};

		Ok(Verdict::Proceed { storage, tls })
	}
}

/// Read the cluster base domain from the OpenShift DNS configuration.
#[instrument(skip_all)]
pub async fn resolve_base_domain<B: ResourceBackend>(
	backend: &B,
	deadline: Deadline,
) -> Result<String, PreflightError> {
	let dns = deadline
		.run(backend.get(&ResourceKind::openshift_dns(), None, "cluster"))
		.await
		.map_err(PreflightError::BaseDomain)?
		.ok_or(PreflightError::MissingBaseDomain)?;

	let domain = dns
		.data
		.pointer("/spec/baseDomain")
		.and_then(serde_json::Value::as_str)
		.filter(|domain| !domain.is_empty())
		.ok_or(PreflightError::MissingBaseDomain)?;

	tracing::info!(base_domain = domain, "OpenShift base domain set");
	Ok(domain.to_string())
}

/// Values the next snapshot needs given the owner's tenants mode.
///
/// The base domain is only looked up in openshift mode and only when the
/// snapshot does not carry one yet.
pub async fn snapshot_update<B: ResourceBackend>(
	backend: &B,
	tenants: Option<&TenantsConfig>,
	snapshot: &ConfigSnapshot,
	deadline: Deadline,
) -> Result<SnapshotUpdate, PreflightError> {
	let needs_domain = tenants.is_some_and(|t| t.mode == TenantsMode::Openshift)
		&& snapshot.base_domain().is_none();
	if !needs_domain {
		return Ok(SnapshotUpdate::default());
	}
	Ok(SnapshotUpdate {
		base_domain: Some(resolve_base_domain(backend, deadline).await?),
	})
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use assert_matches::assert_matches;
	use indoc::indoc;
	use k8s_openapi::ByteString;
	use rstest::rstest;
	use serde_json::json;

	use super::*;
	use crate::{
		config::ConvergeConfig,
		object::DesiredObject,
		test_utils::MemoryBackend,
	};

	fn secret(keys: &[(&str, &str)]) -> Secret {
		Secret {
			data: Some(
				keys.iter()
					.map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
					.collect::<BTreeMap<_, _>>(),
			),
			..Secret::default()
		}
	}

	fn tenants(yaml: &str) -> TenantsConfig {
		serde_yaml::from_str(yaml).unwrap()
	}

	fn proceed() -> Preflight {
		Preflight {
			storage: Ok(StorageKind::S3),
			tenants: Ok(()),
			tls: TlsProfileResolution::Resolved(TlsProfile::builtin_default()),
		}
	}

	#[test]
	fn test_valid_s3_secret() {
		let secret = secret(&[
			("endpoint", "http://minio:9000"),
			("bucket", "tempo"),
			("access_key_id", "tempo"),
			("access_key_secret", "supersecret"),
		]);
		assert!(validate_storage_secret(StorageKind::S3, &secret).is_ok());
	}

	#[test]
	fn test_missing_and_empty_keys_are_collected() {
		let secret = secret(&[("container", ""), ("account_name", "tempo")]);

		let error = validate_storage_secret(StorageKind::Azure, &secret).unwrap_err();
		assert_eq!(
			error.to_string(),
			"invalid storage secret: storage secret must contain \"container\" field, \
			 storage secret must contain \"account_key\" field"
		);
	}

	#[rstest]
	#[case("s3", Ok(StorageKind::S3))]
	#[case("azure", Ok(StorageKind::Azure))]
	#[case("gcs", Ok(StorageKind::Gcs))]
	#[case("swift", Err(()))]
	fn test_storage_kind_parse(#[case] input: &str, #[case] expected: Result<StorageKind, ()>) {
		assert_eq!(input.parse::<StorageKind>().map_err(|_| ()), expected);
	}

	#[tokio::test]
	async fn test_check_storage_reads_secret() {
		let object = DesiredObject::from_manifest(
			ResourceKind::secret(),
			json!({
				"metadata": { "name": "gcs-secret", "namespace": "observability" },
				"data": { "bucketname": "dGVtcG8=", "key.json": "e30=" }
			}),
		)
		.unwrap();
		let backend = MemoryBackend::new().with_object(object.object().clone());

		let kind = check_storage(&backend, "observability", "gcs-secret", "gcs", Deadline::none())
			.await
			.unwrap();
		assert_eq!(kind, StorageKind::Gcs);

		let missing = check_storage(&backend, "observability", "nope", "gcs", Deadline::none()).await;
		assert_matches!(missing, Err(StorageError::NotFound { .. }));
	}

	#[test]
	fn test_static_tenants_need_oidc_and_authorization() {
		let config = tenants(indoc! {"
			mode: static
			authentication:
			  - tenantName: dev
			    tenantId: 1610b0c3-c509-4592-a256-a1871353dbfa
		"});
		assert_eq!(
			config.validate(),
			Err(TenantsError::MissingOidc {
				tenant: "dev".to_string()
			})
		);

		let config = tenants(indoc! {"
			mode: static
			authentication:
			  - tenantName: dev
			    tenantId: 1610b0c3-c509-4592-a256-a1871353dbfa
			    oidc:
			      secretName: oidc-dev
			      issuerUrl: https://dex.example.com
		"});
		assert_eq!(config.validate(), Err(TenantsError::MissingAuthorization));
	}

	#[test]
	fn test_openshift_tenants_forbid_oidc() {
		let config = tenants(indoc! {"
			mode: openshift
			authentication:
			  - tenantName: dev
			    tenantId: a
			    oidc:
			      secretName: oidc-dev
			      issuerUrl: https://dex.example.com
		"});
		assert_matches!(config.validate(), Err(TenantsError::OidcNotAllowed { .. }));
	}

	#[test]
	fn test_tenant_names_are_unique() {
		let config = tenants(indoc! {"
			mode: openshift
			authentication:
			  - tenantName: dev
			    tenantId: a
			  - tenantName: dev
			    tenantId: b
		"});
		assert_eq!(config.validate(), Err(TenantsError::DuplicateName("dev".to_string())));
	}

	#[test]
	fn test_verdict_proceeds() {
		assert_matches!(
			proceed().verdict(),
			Ok(Verdict::Proceed { storage: StorageKind::S3, tls: TlsDecision::Profile(_) })
		);
	}

	#[test]
	fn test_storage_failure_degrades_first() {
		let preflight = Preflight {
			storage: Err(StorageError::UnknownType("swift".to_string())),
			tenants: Err(TenantsError::MissingAuthorization),
			..proceed()
		};

		let verdict = preflight.verdict().unwrap();
		let degraded = verdict.degraded().unwrap();
		assert_eq!(degraded.reason, DegradedReason::InvalidStorageConfig);
		assert!(!degraded.requeue);
	}

	#[test]
	fn test_tenants_failure_degrades() {
		let preflight = Preflight {
			tenants: Err(TenantsError::MissingAuthorization),
			..proceed()
		};

		let verdict = preflight.verdict().unwrap();
		assert_eq!(
			verdict.degraded().map(|d| d.message.as_str()),
			Some("Invalid tenants configuration: authorization is required in static mode")
		);
	}

	#[test]
	fn test_unavailable_tls_uses_builtin_default() {
		let preflight = Preflight {
			tls: TlsProfileResolution::Unavailable,
			..proceed()
		};
		assert_matches!(
			preflight.verdict(),
			Ok(Verdict::Proceed { tls: TlsDecision::BuiltinDefault, .. })
		);
	}

	#[test]
	fn test_invalid_tls_degrades() {
		let preflight = Preflight {
			tls: TlsProfileResolution::Invalid("unknown TLS profile type Bogus".to_string()),
			..proceed()
		};
		let verdict = preflight.verdict().unwrap();
		assert_eq!(
			verdict.degraded().map(|d| d.reason),
			Some(DegradedReason::CouldNotGetOpenShiftTLSPolicy)
		);
	}

	#[test]
	fn test_failed_tls_is_propagated() {
		let preflight = Preflight {
			tls: TlsProfileResolution::Failed("apiserver unreachable".into()),
			..proceed()
		};
		let error = preflight.verdict().unwrap_err();
		assert_matches!(&error, PreflightError::External(_));
		assert_eq!(
			std::error::Error::source(&error).map(ToString::to_string),
			Some("apiserver unreachable".to_string())
		);
	}

	#[tokio::test]
	async fn test_base_domain_only_looked_up_when_needed() {
		let dns = DesiredObject::from_manifest(
			ResourceKind::openshift_dns(),
			json!({
				"metadata": { "name": "cluster" },
				"spec": { "baseDomain": "apps.example.com" }
			}),
		)
		.unwrap();
		let backend = MemoryBackend::new().with_object(dns.object().clone());
		let openshift = tenants("mode: openshift");
		let snapshot = ConvergeConfig::default().snapshot();

		let update = snapshot_update(&backend, Some(&openshift), &snapshot, Deadline::none())
			.await
			.unwrap();
		assert_eq!(update.base_domain.as_deref(), Some("apps.example.com"));

		let update = snapshot_update(&backend, None, &snapshot, Deadline::none())
			.await
			.unwrap();
		assert!(update.is_empty());

		let known = snapshot.advance(&SnapshotUpdate {
			base_domain: Some("apps.example.com".to_string()),
		});
		let calls = backend.calls().len();
		let update = snapshot_update(&backend, Some(&openshift), &known, Deadline::none())
			.await
			.unwrap();
		assert!(update.is_empty());
		assert_eq!(backend.calls().len(), calls);
	}

	#[tokio::test]
	async fn test_missing_dns_config_is_an_error() {
		let backend = MemoryBackend::new();
		assert_matches!(
			resolve_base_domain(&backend, Deadline::none()).await,
			Err(PreflightError::MissingBaseDomain)
		);
	}
}
