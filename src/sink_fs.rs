//! Plain-directory sink.
//!
//! Markdown (or `.mm` mind maps) lands in `output.directory`, assets in
//! `output.asset_directory` when one is configured. The returned output path
//! is relative to the markdown directory.

use std::path::{Path, PathBuf};

use crate::atomic;
use crate::config::OutputConfig;
use crate::error::SinkError;
use crate::models::OutputArtifact;
use crate::render::{self, Asset, AssetKind, AssetPolicy};
use crate::traits::Sink;

/// Writes markdown (and optional assets) into plain directories.
pub struct DirectorySink {
    directory: PathBuf,
    asset_directory: Option<PathBuf>,
    policy: AssetPolicy,
}

impl DirectorySink {
    pub fn new(directory: PathBuf, asset_directory: Option<PathBuf>, policy: AssetPolicy) -> Self {
        Self {
            directory,
            asset_directory,
            policy,
        }
    }

    pub fn from_config(config: &OutputConfig) -> Self {
        Self::new(
            config.directory.clone(),
            config.asset_directory.clone(),
            AssetPolicy::from_output_config(config),
        )
    }
}

impl Sink for DirectorySink {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn write(&self, artifact: &OutputArtifact) -> Result<String, SinkError> {
        let assets = render::build_assets(artifact, &self.policy)?;
        let written = write_files(
            &self.directory,
            self.asset_directory.as_deref(),
            artifact,
            &assets,
            &artifact.body,
        )?;
        let relative = written
            .markdown_path
            .strip_prefix(&self.directory)
            .unwrap_or(&written.markdown_path);
        Ok(relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }
}

/// Paths produced by [`write_files`].
#[derive(Debug)]
pub(crate) struct WrittenFiles {
    pub markdown_path: PathBuf,
    pub assets: Vec<(PathBuf, AssetKind)>,
}

/// Where each asset will land, without writing anything.
pub(crate) fn asset_paths(asset_dir: Option<&Path>, assets: &[Asset]) -> Vec<(PathBuf, AssetKind)> {
    match asset_dir {
        Some(dir) => assets
            .iter()
            .map(|a| (dir.join(&a.file_name), a.kind))
            .collect(),
        None => Vec::new(),
    }
}

/// Write assets first, then the document that may reference them. Every
/// file is replaced atomically, so a retry overwrites cleanly.
pub(crate) fn write_files(
    markdown_dir: &Path,
    asset_dir: Option<&Path>,
    artifact: &OutputArtifact,
    assets: &[Asset],
    body: &str,
) -> Result<WrittenFiles, SinkError> {
    let planned = asset_paths(asset_dir, assets);
    for ((path, _), asset) in planned.iter().zip(assets) {
        atomic::write(path, &asset.bytes).map_err(|e| SinkError::io(path, e))?;
    }

    let markdown_path = markdown_dir.join(artifact.file_name());
    let mut body = body.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    atomic::write(&markdown_path, body.as_bytes()).map_err(|e| SinkError::io(&markdown_path, e))?;

    Ok(WrittenFiles {
        markdown_path,
        assets: planned,
    })
}
