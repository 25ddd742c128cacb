//! Loading desired manifests from disk.

use std::{
	fs,
	path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

/// YAML files directly inside `dir`, sorted by path.
fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>> {
	let mut files: Vec<PathBuf> = fs::read_dir(dir)
		.with_context(|| format!("reading manifest directory {}", dir.display()))?
		.filter_map(|entry| entry.ok().map(|e| e.path()))
		.filter(|path| {
			path.is_file()
				&& path
					.extension()
					.is_some_and(|ext| ext == "yaml" || ext == "yml")
		})
		.collect();
	files.sort();
	Ok(files)
}

/// Parse every document of a multi-document YAML stream.
///
/// Empty documents are skipped and `kind: List` documents are flattened into
/// their items.
pub fn parse_documents(content: &str) -> Result<Vec<Value>> {
	let mut manifests = Vec::new();
	for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
		let value = Value::deserialize(document).with_context(|| format!("parsing document {index}"))?;
		match value {
			Value::Null => {}
			Value::Object(ref object) if object.get("kind").and_then(Value::as_str) == Some("List") => {
				let items = object.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
				manifests.extend(items);
			}
			Value::Object(_) => manifests.push(value),
			_ => anyhow::bail!("document {index} is not a mapping"),
		}
	}
	Ok(manifests)
}

/// Load all manifests from the YAML files in `dir`.
pub fn load_dir(dir: &Path) -> Result<Vec<Value>> {
	let mut manifests = Vec::new();
	for file in manifest_files(dir)? {
		let content =
			fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
		let documents = parse_documents(&content).with_context(|| format!("parsing {}", file.display()))?;
		tracing::debug!(file = %file.display(), count = documents.len(), "loaded manifests");
		manifests.extend(documents);
	}
	Ok(manifests)
}
