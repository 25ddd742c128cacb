use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use converge_cli::{commands, telemetry};
use tracing::Level;

#[cfg(all(
	target_os = "linux",
	feature = "mimalloc",
	not(feature = "system-alloc")
))]
#[global_allocator]
static GLOBAL: mimallocator::Mimalloc = mimallocator::Mimalloc;

#[derive(Parser)]
#[command(name = "converge")]
#[command(about = "Converge the objects of an owner to a desired set", long_about = None)]
#[command(version = env!("CONVERGE_VERSION"))]
struct Cli {
	/// Log level (error, warn, info, debug, trace). Overrides RUST_LOG
	#[arg(long, global = true)]
	log_level: Option<Level>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Apply the manifests for an owner and prune what it no longer wants
	Reconcile(commands::reconcile::ReconcileArgs),

	/// List the objects an owner currently owns
	Owned(commands::owned::OwnedArgs),
}

fn main() -> Result<ExitCode> {
	let cli = Cli::parse();

	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("creating tokio runtime")?;
	let _runtime = runtime.enter();
	let _telemetry = telemetry::init(cli.log_level)?;

	let stdout = std::io::stdout();
	match cli.command {
		Commands::Reconcile(args) => runtime.block_on(commands::reconcile::run(args, stdout)),
		Commands::Owned(args) => runtime
			.block_on(commands::owned::run(args, stdout))
			.map(|()| ExitCode::SUCCESS),
	}
}
