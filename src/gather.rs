//! Collects the inputs of the T1w to ihMT registration into a BIDS derivative dataset: the best
//! preprocessed T1w of each session with its brain mask, a reference frame of the ihMTR series
//! and the ihMT brain mask.

use std::path::{Path, PathBuf};

use tempfile::Builder;
use tracing::{debug, info};

use crate::bids::{absolute, find_session_images, BidsImage};
use crate::dataset::{prepare_output_dataset, DatasetDescription};
use crate::error::{PipelineError, Result};
use crate::provenance::{image_to_bids, Provenance};
use crate::selector::select_best;
use crate::session::{run_sessions, BatchSummary, SessionKey, SessionOutcome};
use crate::volume::extract_reference_frame;

/// ihMTR series name inside `<ihmt-dir>/sub-P/ses-S/output`
pub const IHMT_SERIES_NAME: &str = "acq-ihMTgre2500um_part-mag_ihMTR.nii.gz";
/// ihMT brain mask name inside `<ihmt-dir>/sub-P/ses-S/output`
pub const IHMT_SOURCE_MASK_NAME: &str = "Sepia_mask_QSM.nii.gz";

pub const T1W_BRAIN_MASK_SUFFIX: &str = "_desc-brain_mask.nii.gz";
pub const T1W_GATHERED_MASK_SUFFIX: &str = "_desc-antsnetct_mask.nii.gz";
pub const IHMT_GATHERED_MASK_SUFFIX: &str = "_desc-sepia_mask.nii.gz";

/// relative path of the gathered ihMTR reference image
pub fn ihmt_rel_path(key: &SessionKey) -> PathBuf {
    key.anat_dir().join(format!("{}_{}", key.file_prefix(), IHMT_SERIES_NAME))
}

/// relative path of a session level image, `suffix` starting with `_`
pub fn session_rel_path(key: &SessionKey, suffix: &str) -> PathBuf {
    key.anat_dir().join(format!("{}{}", key.file_prefix(), suffix))
}

/// everything a session needs, checked to exist
#[derive(Debug, Clone)]
struct GatherInputs {
    t1w: BidsImage,
    t1w_mask: BidsImage,
    ihmt_series: PathBuf,
    ihmt_mask: PathBuf,
}

pub struct Gatherer {
    antsnetct_dataset: PathBuf,
    ihmt_dir: PathBuf,
    output_dataset: PathBuf,
}

impl Gatherer {
    pub fn new(antsnetct_dataset: impl Into<PathBuf>, ihmt_dir: impl Into<PathBuf>, output_dataset: impl Into<PathBuf>) -> Self {
        Self {
            antsnetct_dataset: antsnetct_dataset.into(),
            ihmt_dir: ihmt_dir.into(),
            output_dataset: output_dataset.into(),
        }
    }

    /// checks the datasets and writes the output descriptor
    pub fn prepare(&self) -> Result<DatasetDescription> {
        prepare_output_dataset(&self.antsnetct_dataset, &self.output_dataset, &[self.antsnetct_dataset.clone()])
    }

    /// prepares the output dataset, then gathers every session of the worklist
    pub fn run(&self, sessions: &[SessionKey]) -> Result<BatchSummary> {
        self.prepare()?;
        run_sessions(sessions, |key| self.gather_session(key))
    }

    pub fn gather_session(&self, key: &SessionKey) -> Result<SessionOutcome> {
        if self.output_dataset.join(key.anat_dir()).exists() {
            return Ok(SessionOutcome::AlreadyDone);
        }

        let inputs = self.resolve_inputs(key)?;
        let work_dir = Builder::new().prefix("ihmt_t1w_selector").tempdir()?;
        let ihmt_ref = work_dir.path().join(format!("{}_ihmt_ref.nii.gz", key.file_prefix()));
        let shape = extract_reference_frame(&inputs.ihmt_series, &ihmt_ref)?;
        debug!("ihMT reference frame has shape {shape:?}");

        let ihmt_series_uri = absolute(&inputs.ihmt_series).display().to_string();
        image_to_bids(
            &ihmt_ref,
            &self.output_dataset,
            &ihmt_rel_path(key),
            &Provenance::new([ihmt_series_uri], false),
        )?;

        let t1w = image_to_bids(
            &inputs.t1w.path(),
            &self.output_dataset,
            inputs.t1w.rel_path(),
            &Provenance::new([inputs.t1w.uri()], false),
        )?;

        image_to_bids(
            &inputs.t1w_mask.path(),
            &self.output_dataset,
            &t1w.derivative_rel_path(T1W_GATHERED_MASK_SUFFIX),
            &Provenance::new([inputs.t1w_mask.uri()], false),
        )?;

        let ihmt_mask_uri = absolute(&inputs.ihmt_mask).display().to_string();
        image_to_bids(
            &inputs.ihmt_mask,
            &self.output_dataset,
            &session_rel_path(key, IHMT_GATHERED_MASK_SUFFIX),
            &Provenance::new([ihmt_mask_uri], false),
        )?;

        info!("gathered {} and {}", t1w, self.output_dataset.join(ihmt_rel_path(key)).display());
        Ok(SessionOutcome::Completed)
    }

    fn resolve_inputs(&self, key: &SessionKey) -> Result<GatherInputs> {
        let missing = |what: &str, path: &Path| PipelineError::missing_input(&key.participant, &key.session, what, path);

        let candidates = find_session_images(&self.antsnetct_dataset, key, Some("preproc"), "T1w")?;
        if candidates.is_empty() {
            return Err(missing("T1w image", &self.antsnetct_dataset.join(key.anat_dir())));
        }
        for c in &candidates {
            info!("found T1w image: {}", c.uri());
        }
        let t1w = select_best(&candidates)?.clone();
        info!("selected T1w image: {}", t1w.uri());

        let t1w_mask = t1w.derivative_image(T1W_BRAIN_MASK_SUFFIX)?;
        if !t1w_mask.exists() {
            return Err(missing("T1w brain mask", &t1w_mask.path()));
        }

        let ihmt_output = self.ihmt_dir.join(key.session_dir()).join("output");
        let ihmt_series = ihmt_output.join(IHMT_SERIES_NAME);
        if !ihmt_series.is_file() {
            return Err(missing("ihMT image", &ihmt_series));
        }
        let ihmt_mask = ihmt_output.join(IHMT_SOURCE_MASK_NAME);
        if !ihmt_mask.is_file() {
            return Err(missing("ihMT mask", &ihmt_mask));
        }

        Ok(GatherInputs { t1w, t1w_mask, ihmt_series, ihmt_mask })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dataset::DESCRIPTION_FILE;
    use crate::volume::read_volume;
    use crate::volume::tests::{test_header, write_test_volume};
    use ndarray::{Array3, Array4};
    use nifti::writer::WriterOptions;
    use std::fs;
    use tempfile::tempdir;

    pub(crate) fn write_description(dataset: &Path, name: &str) {
        fs::create_dir_all(dataset).unwrap();
        fs::write(dataset.join(DESCRIPTION_FILE), format!(r#"{{"Name": "{name}"}}"#)).unwrap();
    }

    /// antsnetct dataset with two T1w runs for sub-01 ses-MR1 and the ihMT directory
    fn setup(root: &Path) -> (PathBuf, PathBuf) {
        let antsnetct = root.join("antsnetct");
        let ihmt = root.join("ihmt");
        write_description(&antsnetct, "ftdc");

        let anat = antsnetct.join("sub-01/ses-MR1/anat");
        fs::create_dir_all(&anat).unwrap();
        for prefix in ["sub-01_ses-MR1_acq-sag_run-1", "sub-01_ses-MR1_acq-vnavmoco_run-2"] {
            write_test_volume(&anat.join(format!("{prefix}_desc-preproc_T1w.nii.gz")), &Array3::from_elem((4, 4, 4), 100.));
            write_test_volume(&anat.join(format!("{prefix}{T1W_BRAIN_MASK_SUFFIX}")), &Array3::from_elem((4, 4, 4), 1.));
        }

        let out = ihmt.join("sub-01/ses-MR1/output");
        fs::create_dir_all(&out).unwrap();
        let series = Array4::from_shape_fn((3, 3, 2, 4), |(x, _, _, t)| (x + 10 * t) as f32);
        WriterOptions::new(out.join(IHMT_SERIES_NAME)).reference_header(&test_header()).write_nifti(&series).unwrap();
        write_test_volume(&out.join(IHMT_SOURCE_MASK_NAME), &Array3::from_elem((3, 3, 2), 1.));
        (antsnetct, ihmt)
    }

    #[test]
    fn gathers_session_outputs() {
        let dir = tempdir().unwrap();
        let (antsnetct, ihmt) = setup(dir.path());
        let output = dir.path().join("out");
        let gatherer = Gatherer::new(&antsnetct, &ihmt, &output);

        let summary = gatherer.run(&[SessionKey::new("01", "MR1")]).unwrap();
        assert_eq!(summary.completed, 1);

        let anat = output.join("sub-01/ses-MR1/anat");
        let t1w = anat.join("sub-01_ses-MR1_acq-vnavmoco_run-2_desc-preproc_T1w.nii.gz");
        assert!(t1w.is_file());
        assert!(anat.join("sub-01_ses-MR1_acq-vnavmoco_run-2_desc-antsnetct_mask.nii.gz").is_file());
        assert!(anat.join("sub-01_ses-MR1_desc-sepia_mask.nii.gz").is_file());
        assert!(!anat.join("sub-01_ses-MR1_acq-sag_run-1_desc-preproc_T1w.nii.gz").exists());

        let reference = read_volume(anat.join("sub-01_ses-MR1_acq-ihMTgre2500um_part-mag_ihMTR.nii.gz")).unwrap();
        assert_eq!(reference.shape(), [3, 3, 2]);
        assert_eq!(reference.data[[2, 0, 0]], 2.);

        let prov = Provenance::read(anat.join("sub-01_ses-MR1_acq-vnavmoco_run-2_desc-preproc_T1w.json")).unwrap();
        assert!(prov.sources[0].ends_with("antsnetct/sub-01/ses-MR1/anat/sub-01_ses-MR1_acq-vnavmoco_run-2_desc-preproc_T1w.nii.gz"));
        assert!(!prov.skull_stripped);
        let prov = Provenance::read(anat.join("sub-01_ses-MR1_acq-ihMTgre2500um_part-mag_ihMTR.json")).unwrap();
        assert!(prov.sources[0].ends_with(IHMT_SERIES_NAME));

        let description = crate::dataset::read_description(&output).unwrap();
        assert_eq!(description.name, "ftdc_t1w_to_ihmt");
    }

    #[test]
    fn existing_output_is_left_alone() {
        let dir = tempdir().unwrap();
        let (antsnetct, ihmt) = setup(dir.path());
        let output = dir.path().join("out");
        let gatherer = Gatherer::new(&antsnetct, &ihmt, &output);
        let key = SessionKey::new("01", "MR1");

        assert_eq!(gatherer.gather_session(&key).unwrap(), SessionOutcome::Completed);
        let marker = output.join("sub-01/ses-MR1/anat/sub-01_ses-MR1_desc-sepia_mask.nii.gz");
        fs::write(&marker, b"edited").unwrap();
        assert_eq!(gatherer.gather_session(&key).unwrap(), SessionOutcome::AlreadyDone);
        assert_eq!(fs::read(&marker).unwrap(), b"edited");
    }

    #[test]
    fn missing_inputs_skip_without_writing() {
        let dir = tempdir().unwrap();
        let (antsnetct, ihmt) = setup(dir.path());
        let output = dir.path().join("out");
        fs::remove_file(ihmt.join("sub-01/ses-MR1/output").join(IHMT_SOURCE_MASK_NAME)).unwrap();
        let gatherer = Gatherer::new(&antsnetct, &ihmt, &output);

        let err = gatherer.gather_session(&SessionKey::new("01", "MR1")).unwrap_err();
        assert!(matches!(&err, PipelineError::MissingInput { what, .. } if what == "ihMT mask"));
        assert!(!output.join("sub-01/ses-MR1").exists());

        let summary = gatherer
            .run(&[SessionKey::new("01", "MR1"), SessionKey::new("02", "MR1")])
            .unwrap();
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.skipped.len(), 2);
    }

    #[test]
    fn same_input_and_output_is_fatal() {
        let dir = tempdir().unwrap();
        let (antsnetct, ihmt) = setup(dir.path());
        let gatherer = Gatherer::new(&antsnetct, &ihmt, &antsnetct);
        assert!(matches!(
            gatherer.run(&[SessionKey::new("01", "MR1")]),
            Err(PipelineError::SameDataset(_))
        ));
    }
}
