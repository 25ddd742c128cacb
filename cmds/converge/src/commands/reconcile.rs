//! Reconcile command handler.
//!
//! Runs one pass for one owner: loads the desired manifests, checks the
//! owner's preconditions, applies and prunes, and prints the result.

use std::{
	fs,
	io::Write,
	path::{Path, PathBuf},
	process::ExitCode,
	sync::Arc,
};

use anyhow::{Context, Result};
use clap::Args;
use converge::{
	config::ConvergeConfig,
	index::OwnedKinds,
	k8s::{ApiCatalog, ClusterConnection, KubeBackend},
	merge::MergePolicies,
	preflight::{
		check_storage, snapshot_update, Preflight, TenantsConfig, TlsProfileResolution, Verdict,
	},
	status::{Degraded, PassOutcome, SnapshotUpdate},
	Deadline, DesiredObject, Pass, ReconcileResult, Reconciler,
};
use tracing::instrument;

use super::load_config;
use crate::{manifests, owner::OwnerArgs};

#[derive(Debug, Args)]
pub struct ReconcileArgs {
	#[command(flatten)]
	pub target: OwnerArgs,

	/// Directory with the desired manifests (*.yaml, *.yml)
	#[arg(long)]
	pub manifests: PathBuf,

	/// Engine configuration file
	#[arg(long)]
	pub config: Option<PathBuf>,

	/// Object storage secret to validate before the pass
	#[arg(long, requires = "storage_type")]
	pub storage_secret: Option<String>,

	/// Type of the object storage secret (s3, azure, gcs)
	#[arg(long, requires = "storage_secret")]
	pub storage_type: Option<String>,

	/// Tenants configuration (YAML) to validate before the pass
	#[arg(long, requires = "storage_secret")]
	pub tenants: Option<PathBuf>,
}

/// Run the reconcile command.
///
/// Exits non-zero when the pass left failures behind or the owner is degraded.
pub async fn run<W: Write>(args: ReconcileArgs, writer: W) -> Result<ExitCode> {
	let config = load_config(args.config.as_deref())?;
	let connection = ClusterConnection::connect(args.target.context.as_deref())
		.await
		.context("connecting to cluster")?;

	let result = reconcile_owner(&connection, &args, &config, writer).await?;
	Ok(match result.outcome() {
		PassOutcome::Success => ExitCode::SUCCESS,
		PassOutcome::TransientFailure | PassOutcome::Degraded(_) => ExitCode::FAILURE,
	})
}

fn load_tenants(path: &Path) -> Result<TenantsConfig> {
	let content =
		fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
	serde_yaml::from_str(&content)
		.with_context(|| format!("parsing tenants config {}", path.display()))
}

/// Degraded condition of the owner, `None` when the pass may proceed.
async fn preconditions(
	backend: &KubeBackend,
	args: &ReconcileArgs,
	tenants: Option<&TenantsConfig>,
	deadline: Deadline,
) -> Result<Option<Degraded>> {
	let (Some(secret), Some(secret_type)) = (&args.storage_secret, &args.storage_type) else {
		return Ok(None);
	};

	let preflight = Preflight {
		storage: check_storage(backend, &args.target.namespace, secret, secret_type, deadline).await,
		tenants: tenants.map_or(Ok(()), TenantsConfig::validate),
		// The cluster TLS security profile is only published on OpenShift.
		tls: TlsProfileResolution::Unavailable,
	};
	match preflight.verdict().context("checking preconditions")? {
		Verdict::Proceed { storage, tls } => {
			tracing::info!(storage = %storage, tls_min_version = %tls.profile().min_version, "preconditions met");
			Ok(None)
		}
		Verdict::Degraded(degraded) => Ok(Some(degraded)),
	}
}

/// Run one pass for the owner named in `args` and print its result.
#[instrument(skip_all, fields(owner = %args.target.owner, namespace = %args.target.namespace))]
pub async fn reconcile_owner<W: Write>(
	connection: &ClusterConnection,
	args: &ReconcileArgs,
	config: &ConvergeConfig,
	mut writer: W,
) -> Result<ReconcileResult> {
	let options = config.options();
	let deadline = options.deadline.map_or_else(Deadline::none, Deadline::after);
	let snapshot = config.snapshot();
	tracing::info!(
		cluster = connection.cluster_identifier(),
		server_version = %connection.server_version().git_version,
		"connected"
	);

	let catalog = ApiCatalog::discover(connection.client())
		.await
		.context("discovering API resources")?;

	let desired = manifests::load_dir(&args.manifests)?
		.into_iter()
		.map(|manifest| catalog.resolve_manifest(manifest))
		.collect::<Result<Vec<DesiredObject>, _>>()
		.context("resolving manifest kinds")?;
	tracing::debug!(count = desired.len(), "loaded desired objects");

	let backend = Arc::new(KubeBackend::new(connection.client().clone()));
	let scope = args.target.scope(&catalog, &backend, deadline).await?;

	let tenants = args.tenants.as_deref().map(load_tenants).transpose()?;
	let precondition = preconditions(&backend, args, tenants.as_ref(), deadline).await?;
	let update = match precondition {
		Some(_) => SnapshotUpdate::default(),
		None => snapshot_update(backend.as_ref(), tenants.as_ref(), &snapshot, deadline)
			.await
			.context("resolving cluster base domain")?,
	};

	let capabilities = catalog.available_capabilities(
		&snapshot.requested_capabilities(),
		&OwnedKinds::default(),
	);
	let reconciler = Reconciler::new(backend, Arc::new(MergePolicies::default()), options);
	let pass = Pass::builder()
		.scope(scope)
		.desired(desired)
		.capabilities(capabilities)
		.maybe_precondition(precondition)
		.snapshot_update(update)
		.build();

	let result = reconciler.reconcile(pass).await.context("reconcile pass aborted")?;

	if !result.snapshot_update.is_empty() {
		let next = snapshot.advance(&result.snapshot_update);
		tracing::info!(base_domain = ?next.base_domain(), "configuration updated for the next pass");
	}

	writeln!(writer, "{result}")?;
	for failure in &result.apply_failures {
		writeln!(writer, "apply failed: {failure}")?;
	}
	for failure in &result.prune_failures {
		writeln!(writer, "prune failed: {failure}")?;
	}

	Ok(result)
}
