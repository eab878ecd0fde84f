//! Tunable parameters of the registration and bias correction calls. The defaults reproduce the
//! FTDC T1w to ihMT protocol; a parameter file only needs to be written to change them.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineParams {
    pub registration: RegistrationParams,
    pub bias_correction: BiasCorrectionParams,
    pub tools: ToolParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationParams {
    /// gradient step of the rigid transform
    pub transform_step: f64,
    /// histogram bins of the mutual information metric
    pub metric_bins: usize,
    /// `Regular`, `Random` or `None`
    pub sampling_strategy: String,
    /// fraction of voxels sampled, all voxels when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_percentage: Option<f64>,
    /// iterations per level, coarse to fine
    pub iterations: Vec<usize>,
    pub convergence_threshold: f64,
    pub convergence_window: usize,
    pub shrink_factors: Vec<usize>,
    /// in voxels
    pub smoothing_sigmas: Vec<f64>,
    /// lower and upper quantile
    pub winsorize: [f64; 2],
    pub interpolation: String,
    /// single precision registration
    pub float: bool,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            transform_step: 0.1,
            metric_bins: 32,
            sampling_strategy: "Regular".to_string(),
            sampling_percentage: None,
            iterations: vec![500, 250, 50],
            convergence_threshold: 1e-6,
            convergence_window: 10,
            shrink_factors: vec![4, 2, 1],
            smoothing_sigmas: vec![2., 1., 0.],
            winsorize: [0.0, 0.999],
            interpolation: "Linear".to_string(),
            float: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasCorrectionParams {
    pub shrink_factor: usize,
    /// `[iterations per level,threshold]`
    pub convergence: String,
    /// `[spacing in mm]`
    pub bspline_fitting: String,
}

impl Default for BiasCorrectionParams {
    fn default() -> Self {
        Self {
            shrink_factor: 4,
            convergence: "[50x50x50x50,1e-7]".to_string(),
            bspline_fitting: "[200]".to_string(),
        }
    }
}

/// executable names or paths of the external tools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolParams {
    pub registration: PathBuf,
    pub bias_correction: PathBuf,
}

impl Default for ToolParams {
    fn default() -> Self {
        Self {
            registration: PathBuf::from("antsRegistration"),
            bias_correction: PathBuf::from("N4BiasFieldCorrection"),
        }
    }
}

impl PipelineParams {
    /// reads a parameter file. The `.toml` extension is implied.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = fs::read_to_string(path.as_ref().with_extension("toml"))?;
        let params: PipelineParams = toml::from_str(&s)?;
        params.validate()?;
        Ok(params)
    }

    /// writes the parameters as toml, returning the file written
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let mut s = toml::to_string(self)?;
        s.push('\n');
        let filename = path.as_ref().with_extension("toml");
        fs::write(&filename, s)?;
        Ok(filename)
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.registration;
        let levels = r.iterations.len();
        if levels == 0 {
            return Err(PipelineError::invalid_configuration("registration needs at least one level"));
        }
        if r.shrink_factors.len() != levels || r.smoothing_sigmas.len() != levels {
            return Err(PipelineError::invalid_configuration(format!(
                "iterations, shrink factors and smoothing sigmas must have the same number of levels, found {}, {} and {}",
                levels,
                r.shrink_factors.len(),
                r.smoothing_sigmas.len()
            )));
        }
        if r.shrink_factors.contains(&0) {
            return Err(PipelineError::invalid_configuration("shrink factors must be positive"));
        }
        let [lo, hi] = r.winsorize;
        if !(0. ..=1.).contains(&lo) || !(0. ..=1.).contains(&hi) || lo >= hi {
            return Err(PipelineError::invalid_configuration(format!(
                "winsorize quantiles must satisfy 0 <= lower < upper <= 1, found [{lo},{hi}]"
            )));
        }
        if let Some(p) = r.sampling_percentage {
            if !(p > 0. && p <= 1.) {
                return Err(PipelineError::invalid_configuration(format!("sampling percentage {p} is not in (0,1]")));
            }
        }
        if r.metric_bins == 0 || r.transform_step <= 0. {
            return Err(PipelineError::invalid_configuration("metric bins and transform step must be positive"));
        }
        Ok(())
    }
}
