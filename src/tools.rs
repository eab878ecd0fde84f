//! External image processing tools. The driver only talks to the [ImageTools] trait; [AntsTools]
//! runs the ANTs command line programs.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::params::{BiasCorrectionParams, PipelineParams, RegistrationParams};
use crate::transform::generic_affine_path;

/// inputs of one rigid registration, moving (T1w) onto fixed (ihMT)
#[derive(Debug, Clone)]
pub struct RigidRegistration {
    pub fixed: PathBuf,
    pub moving: PathBuf,
    pub fixed_mask: PathBuf,
    pub moving_mask: PathBuf,
    /// output file prefix, the tool appends `0GenericAffine.mat` and `Warped.nii.gz`
    pub output_prefix: PathBuf,
}

impl RigidRegistration {
    pub fn transform_path(&self) -> PathBuf {
        generic_affine_path(&self.output_prefix)
    }

    pub fn warped_path(&self) -> PathBuf {
        let mut p = self.output_prefix.as_os_str().to_owned();
        p.push("Warped.nii.gz");
        PathBuf::from(p)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationOutputs {
    pub transform: PathBuf,
    pub warped: PathBuf,
}

pub trait ImageTools {
    /// intensity bias correction of `image` within `mask`
    fn bias_correct(&self, image: &Path, mask: &Path, output: &Path) -> Result<()>;
    fn register_rigid(&self, registration: &RigidRegistration) -> Result<RegistrationOutputs>;
}

pub struct AntsTools {
    registration: RegistrationParams,
    bias_correction: BiasCorrectionParams,
    registration_program: PathBuf,
    bias_correction_program: PathBuf,
    verbose: bool,
}

impl AntsTools {
    pub fn new(params: &PipelineParams, verbose: bool) -> Self {
        Self {
            registration: params.registration.clone(),
            bias_correction: params.bias_correction.clone(),
            registration_program: params.tools.registration.clone(),
            bias_correction_program: params.tools.bias_correction.clone(),
            verbose,
        }
    }

    pub fn bias_correction_args(&self, image: &Path, mask: &Path, output: &Path) -> Vec<OsString> {
        let p = &self.bias_correction;
        let mut args: Vec<OsString> = vec!["--image-dimensionality".into(), "3".into()];
        args.push("--input-image".into());
        args.push(image.into());
        args.push("--mask-image".into());
        args.push(mask.into());
        args.push("--shrink-factor".into());
        args.push(p.shrink_factor.to_string().into());
        args.push("--convergence".into());
        args.push(p.convergence.clone().into());
        args.push("--bspline-fitting".into());
        args.push(p.bspline_fitting.clone().into());
        args.push("--output".into());
        args.push(output.into());
        args.push("--verbose".into());
        args.push(if self.verbose { "1" } else { "0" }.into());
        args
    }

    pub fn registration_args(&self, reg: &RigidRegistration) -> Vec<OsString> {
        let p = &self.registration;
        let prefix = reg.output_prefix.display();

        let sampling = match p.sampling_percentage {
            Some(pct) => format!("{},{}", p.sampling_strategy, pct),
            None => p.sampling_strategy.clone(),
        };
        let x_joined = |v: Vec<String>| v.join("x");

        let args = [
            "--dimensionality".to_string(),
            "3".to_string(),
            "--float".to_string(),
            if p.float { "1" } else { "0" }.to_string(),
            "--output".to_string(),
            format!("[{prefix},{}]", reg.warped_path().display()),
            "--interpolation".to_string(),
            p.interpolation.clone(),
            "--winsorize-image-intensities".to_string(),
            format!("[{:?},{:?}]", p.winsorize[0], p.winsorize[1]),
            "--masks".to_string(),
            format!("[{},{}]", reg.fixed_mask.display(), reg.moving_mask.display()),
            "--transform".to_string(),
            format!("Rigid[{}]", p.transform_step),
            "--metric".to_string(),
            format!("MI[{},{},1,{},{}]", reg.fixed.display(), reg.moving.display(), p.metric_bins, sampling),
            "--convergence".to_string(),
            format!(
                "[{},{:e},{}]",
                x_joined(p.iterations.iter().map(|i| i.to_string()).collect()),
                p.convergence_threshold,
                p.convergence_window
            ),
            "--shrink-factors".to_string(),
            x_joined(p.shrink_factors.iter().map(|s| s.to_string()).collect()),
            "--smoothing-sigmas".to_string(),
            format!("{}vox", x_joined(p.smoothing_sigmas.iter().map(|s| s.to_string()).collect())),
            "--verbose".to_string(),
            if self.verbose { "1" } else { "0" }.to_string(),
        ];
        args.into_iter().map(OsString::from).collect()
    }
}

impl ImageTools for AntsTools {
    fn bias_correct(&self, image: &Path, mask: &Path, output: &Path) -> Result<()> {
        let args = self.bias_correction_args(image, mask, output);
        run_command(&self.bias_correction_program, &args, self.verbose)?;
        expect_output(&self.bias_correction_program, output)
    }

    fn register_rigid(&self, registration: &RigidRegistration) -> Result<RegistrationOutputs> {
        let args = self.registration_args(registration);
        run_command(&self.registration_program, &args, self.verbose)?;
        let outputs = RegistrationOutputs {
            transform: registration.transform_path(),
            warped: registration.warped_path(),
        };
        expect_output(&self.registration_program, &outputs.transform)?;
        expect_output(&self.registration_program, &outputs.warped)?;
        Ok(outputs)
    }
}

fn expect_output(program: &Path, output: &Path) -> Result<()> {
    if !output.is_file() {
        return Err(PipelineError::ExternalTool {
            program: program.display().to_string(),
            status: "0".to_string(),
            stderr: format!("expected output {} was not written", output.display()),
        });
    }
    Ok(())
}

/// runs `program` to completion. A non-zero exit is an error carrying the captured stderr.
pub fn run_command(program: &Path, args: &[OsString], verbose: bool) -> Result<()> {
    let cmd_line = std::iter::once(program.as_os_str())
        .chain(args.iter().map(OsString::as_os_str))
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ");
    info!("running {cmd_line}");

    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| PipelineError::ExternalTool {
            program: program.display().to_string(),
            status: "not started".to_string(),
            stderr: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if verbose {
        stdout.lines().for_each(|l| info!("{l}"));
        stderr.lines().for_each(|l| info!("{l}"));
    } else {
        debug!("{} wrote {} bytes of output", program.display(), output.stdout.len());
    }

    if !output.status.success() {
        return Err(PipelineError::ExternalTool {
            program: program.display().to_string(),
            status: output
                .status
                .code()
                .map_or_else(|| "terminated by signal".to_string(), |c| c.to_string()),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(())
}
