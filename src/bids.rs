//! A minimal model of BIDS file names: just enough to parse the entities the pipeline
//! selects on and to template derivative paths next to a source image.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::session::SessionKey;

/// extensions that span more than one dot
const COMPOUND_EXTENSIONS: [&str; 2] = [".nii.gz", ".tsv.gz"];

/// the key/value entities, suffix and extension of a BIDS file name, e.g.
/// `sub-01_ses-MR1_acq-vnavpass_run-2_desc-preproc_T1w.nii.gz`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entities {
    pairs: Vec<(String, String)>,
    suffix: Option<String>,
    extension: String,
}

impl Entities {
    pub fn parse(file_name: &str) -> Self {
        let (stem, extension) = split_extension(file_name);
        let mut pairs = Vec::new();
        let mut suffix = None;
        for part in stem.split('_').filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((key, value)) => pairs.push((key.to_string(), value.to_string())),
                None => suffix = Some(part.to_string()),
            }
        }
        Self { pairs, suffix, extension: extension.to_string() }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn acquisition(&self) -> Option<&str> {
        self.get("acq")
    }

    pub fn reconstruction(&self) -> Option<&str> {
        self.get("rec")
    }

    pub fn description(&self) -> Option<&str> {
        self.get("desc")
    }

    /// run number, 1 when the entity is absent or not an integer
    pub fn run(&self) -> u32 {
        self.get("run").and_then(|r| r.parse().ok()).unwrap_or(1)
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// the entity part of a derivative file name: every entity except `desc`, joined in the
    /// original order, without suffix or extension
    pub fn derivative_prefix(&self) -> String {
        self.pairs
            .iter()
            .filter(|(k, _)| k != "desc")
            .map(|(k, v)| format!("{k}-{v}"))
            .collect::<Vec<_>>()
            .join("_")
    }
}

fn split_extension(file_name: &str) -> (&str, &str) {
    for ext in COMPOUND_EXTENSIONS {
        if let Some(stem) = file_name.strip_suffix(ext) {
            return (stem, ext);
        }
    }
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => file_name.split_at(idx),
        _ => (file_name, ""),
    }
}

/// an image inside a dataset, addressed by the dataset root and its path relative to the root
#[derive(Debug, Clone, PartialEq)]
pub struct BidsImage {
    dataset: PathBuf,
    rel_path: PathBuf,
    entities: Entities,
}

impl BidsImage {
    pub fn new(dataset: impl Into<PathBuf>, rel_path: impl Into<PathBuf>) -> Result<Self> {
        let dataset = dataset.into();
        let rel_path = rel_path.into();
        let file_name = rel_path.file_name().and_then(OsStr::to_str).ok_or_else(|| {
            PipelineError::image(dataset.join(&rel_path), "path has no valid utf-8 file name")
        })?;
        let entities = Entities::parse(file_name);
        Ok(Self { dataset, rel_path, entities })
    }

    pub fn dataset(&self) -> &Path {
        &self.dataset
    }

    pub fn rel_path(&self) -> &Path {
        &self.rel_path
    }

    pub fn path(&self) -> PathBuf {
        self.dataset.join(&self.rel_path)
    }

    pub fn entities(&self) -> &Entities {
        &self.entities
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// absolute path of the image, used as the provenance source
    pub fn uri(&self) -> String {
        absolute(&self.path()).display().to_string()
    }

    /// relative path of the derivative prefix, e.g. `sub-01/ses-MR1/anat/sub-01_ses-MR1_run-2`
    /// for `sub-01/ses-MR1/anat/sub-01_ses-MR1_run-2_desc-preproc_T1w.nii.gz`
    pub fn derivative_rel_path_prefix(&self) -> PathBuf {
        let prefix = self.entities.derivative_prefix();
        match self.rel_path.parent() {
            Some(parent) => parent.join(prefix),
            None => PathBuf::from(prefix),
        }
    }

    /// relative path of a derivative of this image, where `suffix` starts with `_`, e.g.
    /// `_desc-brain_mask.nii.gz`
    pub fn derivative_rel_path(&self, suffix: &str) -> PathBuf {
        let mut p = self.derivative_rel_path_prefix().into_os_string();
        p.push(suffix);
        PathBuf::from(p)
    }

    /// a derivative of this image living in the same dataset
    pub fn derivative_image(&self, suffix: &str) -> Result<BidsImage> {
        BidsImage::new(&self.dataset, self.derivative_rel_path(suffix))
    }

    /// a derivative of this image, named after it, but living in another dataset
    pub fn derivative_in(&self, dataset: impl Into<PathBuf>, suffix: &str) -> Result<BidsImage> {
        BidsImage::new(dataset, self.derivative_rel_path(suffix))
    }
}

impl fmt::Display for BidsImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// the JSON sidecar path for an image: the image extension replaced with `.json`
pub fn sidecar_path(image: &Path) -> PathBuf {
    let file_name = image.file_name().and_then(OsStr::to_str).unwrap_or_default();
    let (stem, _) = split_extension(file_name);
    image.with_file_name(format!("{stem}.json"))
}

pub(crate) fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// finds the `<suffix>.nii.gz` images of one session under `anat/`, optionally restricted to a
/// `desc` entity. Results are in sorted path order.
pub fn find_session_images(dataset: &Path, key: &SessionKey, desc: Option<&str>, suffix: &str) -> Result<Vec<BidsImage>> {
    let anat = key.anat_dir();
    let pattern = format!(
        "{}/{}*_{}.nii.gz",
        Pattern::escape(&dataset.join(&anat).display().to_string()),
        Pattern::escape(&key.file_prefix()),
        Pattern::escape(suffix),
    );
    debug!("searching for images matching {pattern}");

    let mut images = Vec::new();
    for entry in glob::glob(&pattern)? {
        let path = entry.map_err(|e| PipelineError::Io(e.into_error()))?;
        let Some(file_name) = path.file_name() else { continue };
        let image = BidsImage::new(dataset, anat.join(file_name))?;
        let entities = image.entities();
        if entities.suffix() != Some(suffix)
            || entities.get("sub") != Some(key.participant.as_str())
            || entities.get("ses") != Some(key.session.as_str())
        {
            continue;
        }
        if desc.is_some() && entities.description() != desc {
            continue;
        }
        images.push(image);
    }
    images.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(images)
}
