//! Moves categorical label images into another image's space with nearest-neighbour lookup, so
//! label codes are never blended.

use std::collections::BTreeSet;
use std::path::Path;

use ndarray::{Array3, Zip};
use tracing::debug;

use crate::error::Result;
use crate::transform::LinearTransform;
use crate::volume::{read_first_frame, read_volume, write_label_volume};

/// label images are read as floats, codes are recovered by rounding
fn to_labels(data: &Array3<f32>) -> Array3<i32> {
    data.mapv(|v| v.round() as i32)
}

pub fn label_set(labels: &Array3<i32>) -> BTreeSet<i32> {
    labels.iter().copied().collect()
}

pub fn read_label_set(path: impl AsRef<Path>) -> Result<BTreeSet<i32>> {
    let vol = read_volume(path)?;
    Ok(label_set(&to_labels(&vol.data)))
}

/// resamples `labels` (moving space) onto the grid of `reference` (fixed space). `transform`
/// maps fixed points to moving points. Voxels that map outside the label image are 0.
/// Returns the set of labels present in the output.
pub fn propagate_labels(
    labels: impl AsRef<Path>,
    reference: impl AsRef<Path>,
    transform: &LinearTransform,
    output: impl AsRef<Path>,
) -> Result<BTreeSet<i32>> {
    let moving = read_volume(labels.as_ref())?;
    let moving_grid = moving.grid()?;
    let moving_labels = to_labels(&moving.data);

    let fixed = read_first_frame(reference.as_ref())?;
    let fixed_grid = fixed.grid()?;

    let mut resampled = Array3::<i32>::zeros(fixed.data.dim());
    Zip::indexed(&mut resampled).par_for_each(|(i, j, k), v| {
        let world = fixed_grid.to_world([i as f64, j as f64, k as f64]);
        let ijk = moving_grid.to_voxel(transform.apply_ras(world));
        if let Some(idx) = moving_grid.nearest_index(ijk) {
            *v = moving_labels[idx];
        }
    });

    let present = label_set(&resampled);
    debug!(
        "propagated {} to {}: {} of {} labels present",
        labels.as_ref().display(),
        output.as_ref().display(),
        present.len(),
        label_set(&moving_labels).len(),
    );
    write_label_volume(output, &fixed.header, &resampled)?;
    Ok(present)
}
