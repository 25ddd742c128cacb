//! Owned command handler: prints the ownership index of an owner.

use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use converge::{
	config::ConvergeConfig,
	index::{discover, OwnedIndex, OwnedKinds},
	k8s::{ApiCatalog, ClusterConnection, KubeBackend},
	Deadline, ObjectKey,
};
use tabwriter::TabWriter;
use tracing::instrument;

use super::load_config;
use crate::owner::OwnerArgs;

#[derive(Debug, Args)]
pub struct OwnedArgs {
	#[command(flatten)]
	pub target: OwnerArgs,

	/// Engine configuration file, for the enabled integrations
	#[arg(long)]
	pub config: Option<PathBuf>,
}

/// Run the owned command.
pub async fn run<W: Write>(args: OwnedArgs, writer: W) -> Result<()> {
	let config = load_config(args.config.as_deref())?;
	let connection = ClusterConnection::connect(args.target.context.as_deref())
		.await
		.context("connecting to cluster")?;
	list_owned(&connection, &args, &config, writer).await?;
	Ok(())
}

fn namespaced_name(key: &ObjectKey) -> String {
	match &key.namespace {
		Some(ns) => format!("{ns}/{}", key.name),
		None => key.name.clone(),
	}
}

/// Print every object currently owned by the owner named in `args`.
#[instrument(skip_all, fields(owner = %args.target.owner))]
pub async fn list_owned<W: Write>(
	connection: &ClusterConnection,
	args: &OwnedArgs,
	config: &ConvergeConfig,
	writer: W,
) -> Result<OwnedIndex> {
	tracing::info!(
		cluster = connection.cluster_identifier(),
		server_version = %connection.server_version().git_version,
		"connected"
	);
	let catalog = ApiCatalog::discover(connection.client())
		.await
		.context("discovering API resources")?;
	let backend = KubeBackend::new(connection.client().clone());
	let scope = args.target.scope(&catalog, &backend, Deadline::none()).await?;

	let kinds = OwnedKinds::default();
	let capabilities =
		catalog.available_capabilities(&config.snapshot().requested_capabilities(), &kinds);
	let index = discover(&backend, &scope, &kinds, &capabilities, Deadline::none())
		.await
		.context("listing owned objects")?;

	let mut table = TabWriter::new(writer);
	writeln!(table, "KIND\tNAME\tUID")?;
	for record in index.iter() {
		writeln!(
			table,
			"{}\t{}\t{}",
			record.key.kind,
			namespaced_name(&record.key),
			record.uid
		)?;
	}
	table.flush()?;

	Ok(index)
}
