//! `dataset_description.json` handling. The descriptor is read once per run, a derived
//! descriptor is computed from it as a plain value, and the output dataset is updated with it
//! before any session is processed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::bids::absolute;
use crate::error::{PipelineError, Result};

pub const DESCRIPTION_FILE: &str = "dataset_description.json";

/// appended to the input dataset name to name the output dataset
pub const OUTPUT_NAME_SUFFIX: &str = "_t1w_to_ihmt";

const BIDS_VERSION: &str = "1.9.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescription {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "BIDSVersion", default, skip_serializing_if = "Option::is_none")]
    pub bids_version: Option<String>,
    #[serde(rename = "DatasetType", default, skip_serializing_if = "Option::is_none")]
    pub dataset_type: Option<String>,
    #[serde(rename = "GeneratedBy", default, skip_serializing_if = "Vec::is_empty")]
    pub generated_by: Vec<Value>,
    #[serde(rename = "DatasetLinks", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dataset_links: BTreeMap<String, String>,
    /// any other fields, carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DatasetDescription {
    /// the description of a derivative dataset built from this one: `Name` gets `suffix`
    /// appended and every source dataset is recorded as a link
    pub fn derived(&self, suffix: &str, sources: &[PathBuf]) -> DatasetDescription {
        let mut derived = DatasetDescription {
            name: format!("{}{}", self.name, suffix),
            bids_version: Some(BIDS_VERSION.to_string()),
            dataset_type: Some("derivative".to_string()),
            generated_by: vec![serde_json::json!({
                "Name": env!("CARGO_PKG_NAME"),
                "Version": env!("CARGO_PKG_VERSION"),
            })],
            dataset_links: BTreeMap::new(),
            extra: Map::new(),
        };
        derived.add_links(sources);
        derived
    }

    /// records source datasets under their directory name. Returns true if anything was added.
    pub fn add_links(&mut self, sources: &[PathBuf]) -> bool {
        let mut changed = false;
        for source in sources {
            let uri = absolute(source).display().to_string();
            if self.dataset_links.values().any(|v| *v == uri) {
                continue;
            }
            let base = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "source".to_string());
            let mut key = base.clone();
            let mut n = 1;
            while self.dataset_links.contains_key(&key) {
                n += 1;
                key = format!("{base}{n}");
            }
            self.dataset_links.insert(key, uri);
            changed = true;
        }
        changed
    }
}

pub fn read_description(dataset: impl AsRef<Path>) -> Result<DatasetDescription> {
    let file = dataset.as_ref().join(DESCRIPTION_FILE);
    if !file.is_file() {
        return Err(PipelineError::MissingDescriptor(dataset.as_ref().to_path_buf()));
    }
    let s = fs::read_to_string(&file)?;
    Ok(serde_json::from_str(&s)?)
}

pub fn write_description(dataset: impl AsRef<Path>, description: &DatasetDescription) -> Result<()> {
    let dataset = dataset.as_ref();
    fs::create_dir_all(dataset)?;
    let mut s = serde_json::to_string_pretty(description)?;
    s.push('\n');
    fs::write(dataset.join(DESCRIPTION_FILE), s)?;
    Ok(())
}

/// creates the output dataset descriptor, or adds any missing source links to an existing one.
/// The descriptor on disk after the call is returned.
pub fn update_output_dataset(output: impl AsRef<Path>, derived: &DatasetDescription) -> Result<DatasetDescription> {
    let output = output.as_ref();
    if output.join(DESCRIPTION_FILE).is_file() {
        let mut existing = read_description(output)?;
        let links = derived.dataset_links.values().map(PathBuf::from).collect::<Vec<_>>();
        if existing.add_links(&links) {
            debug!("adding dataset links to {}", output.display());
            write_description(output, &existing)?;
        }
        Ok(existing)
    } else {
        info!("creating output dataset {} ({})", output.display(), derived.name);
        write_description(output, derived)?;
        Ok(derived.clone())
    }
}

/// reads the input descriptor, checks that input and output differ and brings the output
/// descriptor up to date. Called once per run before session work.
pub fn prepare_output_dataset(input: &Path, output: &Path, sources: &[PathBuf]) -> Result<DatasetDescription> {
    ensure_distinct(input, output)?;
    let input_description = read_description(input)?;
    info!("input dataset path: {}", input.display());
    info!("input dataset name: {}", input_description.name);

    let derived = input_description.derived(OUTPUT_NAME_SUFFIX, sources);
    let output_description = update_output_dataset(output, &derived)?;
    info!("output dataset path: {}", output.display());
    info!("output dataset name: {}", output_description.name);
    Ok(output_description)
}

pub fn ensure_distinct(input: &Path, output: &Path) -> Result<()> {
    if resolve(input) == resolve(output) {
        return Err(PipelineError::SameDataset(output.to_path_buf()));
    }
    Ok(())
}

fn resolve(p: &Path) -> PathBuf {
    fs::canonicalize(p).unwrap_or_else(|_| absolute(p))
}
