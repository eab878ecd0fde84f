//! Rigid registration of the gathered T1w onto the ihMT reference and propagation of the
//! antsnetct segmentations into ihMT space.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tempfile::Builder;
use tracing::info;

use crate::bids::{find_session_images, BidsImage};
use crate::dataset::{prepare_output_dataset, DatasetDescription};
use crate::error::{PipelineError, Result};
use crate::gather::{ihmt_rel_path, session_rel_path, IHMT_GATHERED_MASK_SUFFIX, T1W_GATHERED_MASK_SUFFIX};
use crate::labels::propagate_labels;
use crate::provenance::{copy_with_sidecar, image_to_bids, Provenance};
use crate::session::{run_sessions, BatchSummary, SessionKey, SessionOutcome};
use crate::tools::{ImageTools, RigidRegistration};
use crate::transform::LinearTransform;
use crate::volume::apply_mask;

pub const WARPED_T1W_SUFFIX: &str = "_space-ihmt_T1w.nii.gz";
pub const TRANSFORM_SUFFIX: &str = "_from-T1w_to-ihmt_mode-image_xfm.mat";

/// a label image in T1w space and the name of its propagated copy in ihMT space
#[derive(Debug, Clone, Copy)]
pub struct LabelSet {
    pub name: &'static str,
    pub source_suffix: &'static str,
    pub output_suffix: &'static str,
}

pub const LABEL_SETS: [LabelSet; 2] = [
    LabelSet {
        name: "dkt31",
        source_suffix: "_seg-dkt31Propagated_dseg.nii.gz",
        output_suffix: "_space-ihmt_seg-dkt31_dseg.nii.gz",
    },
    LabelSet {
        name: "hoa",
        source_suffix: "_seg-hoaMasked_dseg.nii.gz",
        output_suffix: "_space-ihmt_seg-hoa_dseg.nii.gz",
    },
];

/// which precomputed brain masks guide bias correction and registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskStrategy {
    #[default]
    Synthstrip,
    SynthstripNoCsf,
    NoSynthstrip,
}

impl MaskStrategy {
    pub const ALL: [MaskStrategy; 3] = [Self::Synthstrip, Self::SynthstripNoCsf, Self::NoSynthstrip];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synthstrip => "synthstrip",
            Self::SynthstripNoCsf => "synthstrip_no_csf",
            Self::NoSynthstrip => "no_synthstrip",
        }
    }

    /// suffix of the ihMT mask after the session prefix
    pub fn ihmt_mask_suffix(&self) -> &'static str {
        match self {
            Self::Synthstrip => "_desc-ihMTRSynthstrip_mask.nii.gz",
            Self::SynthstripNoCsf => "_desc-ihMTRSynthstripNoCSF_mask.nii.gz",
            Self::NoSynthstrip => IHMT_GATHERED_MASK_SUFFIX,
        }
    }

    /// suffix of the T1w mask after the T1w derivative prefix
    pub fn t1w_mask_suffix(&self) -> &'static str {
        match self {
            Self::Synthstrip => "_desc-synthstrip_mask.nii.gz",
            Self::SynthstripNoCsf => "_desc-synthstripNoCSF_mask.nii.gz",
            Self::NoSynthstrip => T1W_GATHERED_MASK_SUFFIX,
        }
    }
}

impl FromStr for MaskStrategy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == s).ok_or_else(|| {
            PipelineError::invalid_configuration(format!(
                "invalid registration mask strategy '{s}', options are 'synthstrip', 'synthstrip_no_csf' or 'no_synthstrip'"
            ))
        })
    }
}

impl fmt::Display for MaskStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// resolved and existing inputs of one session
#[derive(Debug, Clone)]
pub struct SessionInputs {
    pub t1w: BidsImage,
    pub t1w_mask: BidsImage,
    pub ihmt: BidsImage,
    pub ihmt_mask: BidsImage,
    /// label images in T1w space, in [LABEL_SETS] order
    pub labels: Vec<BidsImage>,
}

pub struct Driver<T: ImageTools> {
    input_dataset: PathBuf,
    antsnetct_dataset: PathBuf,
    output_dataset: PathBuf,
    strategy: MaskStrategy,
    tools: T,
}

impl<T: ImageTools> Driver<T> {
    pub fn new(
        input_dataset: impl Into<PathBuf>,
        antsnetct_dataset: impl Into<PathBuf>,
        output_dataset: impl Into<PathBuf>,
        strategy: MaskStrategy,
        tools: T,
    ) -> Self {
        Self {
            input_dataset: input_dataset.into(),
            antsnetct_dataset: antsnetct_dataset.into(),
            output_dataset: output_dataset.into(),
            strategy,
            tools,
        }
    }

    #[cfg(test)]
    pub(crate) fn tools(&self) -> &T {
        &self.tools
    }

    /// checks the datasets and writes the output descriptor, linking the gathered inputs and
    /// antsnetct
    pub fn prepare(&self) -> Result<DatasetDescription> {
        prepare_output_dataset(
            &self.input_dataset,
            &self.output_dataset,
            &[self.input_dataset.clone(), self.antsnetct_dataset.clone()],
        )
    }

    pub fn run(&self, sessions: &[SessionKey]) -> Result<BatchSummary> {
        self.prepare()?;
        run_sessions(sessions, |key| self.register_session(key))
    }

    pub fn resolve_inputs(&self, key: &SessionKey) -> Result<SessionInputs> {
        let require = |what: &str, image: BidsImage| {
            if image.exists() {
                Ok(image)
            } else {
                Err(PipelineError::missing_input(&key.participant, &key.session, what, image.path()))
            }
        };

        // the gathered dataset holds exactly one T1w per session
        let mut t1w = find_session_images(&self.input_dataset, key, Some("preproc"), "T1w")?;
        if t1w.len() != 1 {
            return Err(PipelineError::Cardinality {
                participant: key.participant.clone(),
                session: key.session.clone(),
                what: "T1w images in the input dataset".to_string(),
                expected: 1,
                found: t1w.len(),
            });
        }
        let t1w = t1w.remove(0);

        let t1w_mask = require("T1w mask", t1w.derivative_image(self.strategy.t1w_mask_suffix())?)?;
        let ihmt = require("ihMT image", BidsImage::new(&self.input_dataset, ihmt_rel_path(key))?)?;
        let ihmt_mask = require(
            "ihMT mask",
            BidsImage::new(&self.input_dataset, session_rel_path(key, self.strategy.ihmt_mask_suffix()))?,
        )?;

        let labels = LABEL_SETS
            .iter()
            .map(|set| require(&format!("{} labels", set.name), t1w.derivative_in(&self.antsnetct_dataset, set.source_suffix)?))
            .collect::<Result<Vec<_>>>()?;

        Ok(SessionInputs { t1w, t1w_mask, ihmt, ihmt_mask, labels })
    }

    pub fn register_session(&self, key: &SessionKey) -> Result<SessionOutcome> {
        if self.output_dataset.join(key.anat_dir()).exists() {
            return Ok(SessionOutcome::AlreadyDone);
        }

        let inputs = self.resolve_inputs(key)?;
        info!("registering {} to {} using {} masks", inputs.t1w, inputs.ihmt, self.strategy);

        let work_dir = Builder::new().prefix(&format!("t1w_to_ihmt_{}", key.participant)).tempdir()?;
        let work = |name: &str| work_dir.path().join(format!("{}_{}", key.file_prefix(), name));

        let t1w_n4 = work("t1w_n4.nii.gz");
        let ihmt_n4 = work("ihmt_n4.nii.gz");
        self.tools.bias_correct(&inputs.t1w.path(), &inputs.t1w_mask.path(), &t1w_n4)?;
        self.tools.bias_correct(&inputs.ihmt.path(), &inputs.ihmt_mask.path(), &ihmt_n4)?;

        let t1w_masked = work("t1w_n4_masked.nii.gz");
        let ihmt_masked = work("ihmt_n4_masked.nii.gz");
        apply_mask(&t1w_n4, inputs.t1w_mask.path(), &t1w_masked)?;
        apply_mask(&ihmt_n4, inputs.ihmt_mask.path(), &ihmt_masked)?;

        let registration = RigidRegistration {
            fixed: ihmt_masked.clone(),
            moving: t1w_masked,
            fixed_mask: inputs.ihmt_mask.path(),
            moving_mask: inputs.t1w_mask.path(),
            output_prefix: work("t1w_to_ihmt_"),
        };
        let outputs = self.tools.register_rigid(&registration)?;
        let transform = LinearTransform::read(&outputs.transform)?;

        // resample into the scratch area so a failure leaves no partial session output
        let mut propagated = Vec::with_capacity(LABEL_SETS.len());
        for (set, labels) in LABEL_SETS.iter().zip(&inputs.labels) {
            let resampled = work(&format!("{}_ihmt.nii.gz", set.name));
            let present = propagate_labels(labels.path(), inputs.ihmt.path(), &transform, &resampled)?;
            info!("propagated {} labels, {} present in ihMT space", set.name, present.len());
            propagated.push(resampled);
        }

        let out = &self.output_dataset;
        image_to_bids(
            &outputs.warped,
            out,
            &inputs.t1w.derivative_rel_path(WARPED_T1W_SUFFIX),
            &Provenance::new([inputs.t1w.uri()], true),
        )?;
        copy_with_sidecar(
            &outputs.transform,
            &out.join(inputs.t1w.derivative_rel_path(TRANSFORM_SUFFIX)),
            &Provenance::new([inputs.t1w.uri(), inputs.ihmt.uri()], false),
        )?;
        image_to_bids(
            &ihmt_masked,
            out,
            inputs.ihmt.rel_path(),
            &Provenance::new([inputs.ihmt.uri()], true),
        )?;
        for ((set, labels), resampled) in LABEL_SETS.iter().zip(&inputs.labels).zip(&propagated) {
            image_to_bids(
                resampled,
                out,
                &inputs.ihmt.derivative_rel_path(set.output_suffix),
                &Provenance::new([labels.uri()], false),
            )?;
        }

        info!("wrote registration outputs to {}", out.join(key.anat_dir()).display());
        Ok(SessionOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gather::tests::write_description;
    use crate::labels::read_label_set;
    use crate::tools::RegistrationOutputs;
    use crate::volume::tests::write_test_volume;
    use ndarray::Array3;
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    /// stands in for ANTs: bias correction copies, registration copies the moving image and
    /// writes an identity transform
    #[derive(Default)]
    struct FakeTools {
        calls: RefCell<Vec<String>>,
        fail_registration: bool,
    }

    impl ImageTools for FakeTools {
        fn bias_correct(&self, image: &Path, _mask: &Path, output: &Path) -> Result<()> {
            self.calls.borrow_mut().push(format!("n4 {}", image.display()));
            fs::copy(image, output)?;
            Ok(())
        }

        fn register_rigid(&self, registration: &RigidRegistration) -> Result<RegistrationOutputs> {
            self.calls.borrow_mut().push("rigid".to_string());
            if self.fail_registration {
                return Err(PipelineError::ExternalTool {
                    program: "antsRegistration".to_string(),
                    status: "1".to_string(),
                    stderr: "failed".to_string(),
                });
            }
            fs::copy(&registration.moving, registration.warped_path())?;
            LinearTransform::identity().write(registration.transform_path())?;
            Ok(RegistrationOutputs {
                transform: registration.transform_path(),
                warped: registration.warped_path(),
            })
        }
    }

    struct Datasets {
        input: PathBuf,
        antsnetct: PathBuf,
        output: PathBuf,
    }

    const T1W_PREFIX: &str = "sub-01/ses-MR1/anat/sub-01_ses-MR1_acq-vnavmoco_run-2";

    fn setup(root: &Path) -> Datasets {
        let input = root.join("gathered");
        let antsnetct = root.join("antsnetct");
        write_description(&input, "ftdc_t1w_to_ihmt");
        write_description(&antsnetct, "ftdc");
        fs::create_dir_all(input.join("sub-01/ses-MR1/anat")).unwrap();
        fs::create_dir_all(antsnetct.join("sub-01/ses-MR1/anat")).unwrap();

        let image = Array3::from_shape_fn((4, 4, 3), |(x, y, z)| (1 + x + y + z) as f32);
        let mask = Array3::from_shape_fn((4, 4, 3), |(x, _, _)| if x > 0 { 1. } else { 0. });
        let labels = Array3::from_shape_fn((4, 4, 3), |(x, y, _)| if x == 0 { 0. } else { (10 * y + x) as f32 });

        write_test_volume(&input.join(format!("{T1W_PREFIX}_desc-preproc_T1w.nii.gz")), &image);
        write_test_volume(&input.join(ihmt_rel_path(&SessionKey::new("01", "MR1"))), &image);
        for strategy in MaskStrategy::ALL {
            write_test_volume(&input.join(format!("{T1W_PREFIX}{}", strategy.t1w_mask_suffix())), &mask);
            write_test_volume(
                &input.join(format!("sub-01/ses-MR1/anat/sub-01_ses-MR1{}", strategy.ihmt_mask_suffix())),
                &mask,
            );
        }
        for set in LABEL_SETS {
            write_test_volume(&antsnetct.join(format!("{T1W_PREFIX}{}", set.source_suffix)), &labels);
        }
        Datasets { input, antsnetct, output: root.join("out") }
    }

    fn driver(d: &Datasets, strategy: MaskStrategy, tools: FakeTools) -> Driver<FakeTools> {
        Driver::new(&d.input, &d.antsnetct, &d.output, strategy, tools)
    }

    #[test]
    fn parses_mask_strategies() {
        for m in MaskStrategy::ALL {
            assert_eq!(m.as_str().parse::<MaskStrategy>().unwrap(), m);
        }
        assert!(matches!("bogus".parse::<MaskStrategy>(), Err(PipelineError::InvalidConfiguration(_))));
        assert_eq!(MaskStrategy::default(), MaskStrategy::Synthstrip);
    }

    #[test]
    fn no_synthstrip_uses_gathered_masks() {
        assert_eq!(MaskStrategy::NoSynthstrip.t1w_mask_suffix(), "_desc-antsnetct_mask.nii.gz");
        assert_eq!(MaskStrategy::NoSynthstrip.ihmt_mask_suffix(), "_desc-sepia_mask.nii.gz");
    }

    #[test]
    fn registers_and_propagates_labels() {
        let dir = tempdir().unwrap();
        let d = setup(dir.path());
        let driver = driver(&d, MaskStrategy::SynthstripNoCsf, FakeTools::default());

        let summary = driver.run(&[SessionKey::new("01", "MR1")]).unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(driver.tools().calls.borrow().len(), 3);

        let out = &d.output;
        let anat = out.join("sub-01/ses-MR1/anat");
        assert!(out.join(format!("{T1W_PREFIX}_space-ihmt_T1w.nii.gz")).is_file());
        assert!(out.join(format!("{T1W_PREFIX}_from-T1w_to-ihmt_mode-image_xfm.mat")).is_file());
        let xfm_sidecar = Provenance::read(out.join(format!("{T1W_PREFIX}_from-T1w_to-ihmt_mode-image_xfm.json"))).unwrap();
        assert_eq!(xfm_sidecar.sources.len(), 2);
        assert!(anat.join("sub-01_ses-MR1_acq-ihMTgre2500um_part-mag_ihMTR.nii.gz").is_file());

        let source_labels = read_label_set(d.antsnetct.join(format!("{T1W_PREFIX}_seg-dkt31Propagated_dseg.nii.gz"))).unwrap();
        for name in ["dkt31", "hoa"] {
            let propagated = anat.join(format!("sub-01_ses-MR1_acq-ihMTgre2500um_part-mag_space-ihmt_seg-{name}_dseg.nii.gz"));
            assert_eq!(read_label_set(&propagated).unwrap(), source_labels);
        }

        let description = crate::dataset::read_description(out).unwrap();
        assert_eq!(description.dataset_links.len(), 2);
    }

    #[test]
    fn second_run_is_a_no_op() {
        let dir = tempdir().unwrap();
        let d = setup(dir.path());
        let driver = driver(&d, MaskStrategy::Synthstrip, FakeTools::default());
        let key = SessionKey::new("01", "MR1");

        assert_eq!(driver.register_session(&key).unwrap(), SessionOutcome::Completed);
        let calls = driver.tools().calls.borrow().len();
        assert_eq!(driver.register_session(&key).unwrap(), SessionOutcome::AlreadyDone);
        assert_eq!(driver.tools().calls.borrow().len(), calls);
    }

    #[test]
    fn missing_mask_fails_before_any_tool_runs() {
        let dir = tempdir().unwrap();
        let d = setup(dir.path());
        fs::remove_file(d.input.join(format!("{T1W_PREFIX}_desc-synthstrip_mask.nii.gz"))).unwrap();
        let driver = driver(&d, MaskStrategy::Synthstrip, FakeTools::default());

        let err = driver.register_session(&SessionKey::new("01", "MR1")).unwrap_err();
        assert!(matches!(&err, PipelineError::MissingInput { what, .. } if what == "T1w mask"));
        assert!(driver.tools().calls.borrow().is_empty());
        assert!(!d.output.join("sub-01/ses-MR1/anat").exists());
    }

    #[test]
    fn more_than_one_t1w_is_a_cardinality_error() {
        let dir = tempdir().unwrap();
        let d = setup(dir.path());
        fs::copy(
            d.input.join(format!("{T1W_PREFIX}_desc-preproc_T1w.nii.gz")),
            d.input.join("sub-01/ses-MR1/anat/sub-01_ses-MR1_acq-sag_desc-preproc_T1w.nii.gz"),
        )
        .unwrap();
        let driver = driver(&d, MaskStrategy::Synthstrip, FakeTools::default());
        assert!(matches!(
            driver.register_session(&SessionKey::new("01", "MR1")),
            Err(PipelineError::Cardinality { expected: 1, found: 2, .. })
        ));
    }

    #[test]
    fn tool_failure_skips_session_in_batch() {
        let dir = tempdir().unwrap();
        let d = setup(dir.path());
        let tools = FakeTools { fail_registration: true, ..Default::default() };
        let driver = driver(&d, MaskStrategy::NoSynthstrip, tools);

        let summary = driver.run(&[SessionKey::new("01", "MR1")]).unwrap();
        assert_eq!(summary.skipped, vec![SessionKey::new("01", "MR1")]);
        assert!(!d.output.join("sub-01/ses-MR1/anat").exists());
    }
}
