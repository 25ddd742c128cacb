pub mod owned;
pub mod reconcile;

use std::path::Path;

use anyhow::{Context, Result};
use converge::config::ConvergeConfig;

/// Engine configuration from `path`, defaults when no file is given.
fn load_config(path: Option<&Path>) -> Result<ConvergeConfig> {
	match path {
		Some(path) => ConvergeConfig::load(path).context("loading engine configuration"),
		None => Ok(ConvergeConfig::default()),
	}
}
