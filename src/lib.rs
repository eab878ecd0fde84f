//! Selection, gathering and rigid T1w to ihMT registration of neuroimaging sessions stored as
//! BIDS datasets.
//!
//! Per session the pipeline runs in three stages:
//! 1. [selector::select_best] picks one T1w among several acquisitions,
//! 2. [gather::Gatherer] copies the T1w, an ihMT reference frame and masks into a derivative
//!    dataset,
//! 3. [register::Driver] registers the T1w to the ihMT reference and moves the antsnetct
//!    segmentations into ihMT space.

pub mod bids;
pub mod cli;
pub mod dataset;
pub mod error;
pub mod gather;
pub mod labels;
pub mod params;
pub mod provenance;
pub mod register;
pub mod selector;
pub mod session;
pub mod tools;
pub mod transform;
pub mod volume;

pub use error::{PipelineError, Result};
pub use gather::Gatherer;
pub use params::PipelineParams;
pub use register::{Driver, MaskStrategy};
pub use session::{read_worklist, SessionKey};
pub use tools::{AntsTools, ImageTools};
