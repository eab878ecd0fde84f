//! JSON sidecars recording where each derivative came from, and helpers that place a file in a
//! dataset together with its sidecar.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bids::{sidecar_path, BidsImage};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(rename = "Sources")]
    pub sources: Vec<String>,
    #[serde(rename = "SkullStripped")]
    pub skull_stripped: bool,
}

impl Provenance {
    pub fn new(sources: impl IntoIterator<Item = impl Into<String>>, skull_stripped: bool) -> Self {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            skull_stripped,
        }
    }

    pub fn read(sidecar: impl AsRef<Path>) -> Result<Self> {
        let s = fs::read_to_string(sidecar)?;
        Ok(serde_json::from_str(&s)?)
    }

    pub fn write(&self, sidecar: impl AsRef<Path>) -> Result<()> {
        let mut s = serde_json::to_string_pretty(self)?;
        s.push('\n');
        fs::write(sidecar, s)?;
        Ok(())
    }
}

/// copies `source` into `dataset` at `rel_path`, writing the provenance sidecar next to it.
/// Parent directories are created as needed.
pub fn image_to_bids(source: &Path, dataset: &Path, rel_path: &Path, provenance: &Provenance) -> Result<BidsImage> {
    let dest = dataset.join(rel_path);
    copy_with_sidecar(source, &dest, provenance)?;
    BidsImage::new(dataset, rel_path)
}

/// copies any file (image or transform) to `dest` and writes its sidecar
pub fn copy_with_sidecar(source: &Path, dest: &Path, provenance: &Provenance) -> Result<PathBuf> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    debug!("copying {} to {}", source.display(), dest.display());
    fs::copy(source, dest)?;
    let sidecar = sidecar_path(dest);
    provenance.write(&sidecar)?;
    Ok(sidecar)
}
