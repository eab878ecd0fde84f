//! NIfTI reading and writing, plus the few voxel operations done natively: extracting the
//! reference frame of a 4-D series and applying a binary mask.

use std::path::Path;

use nalgebra::{Matrix4, Vector4};
use ndarray::{Array3, ArrayD, Axis, Ix3, Zip};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// a 3-D image and the header it was read with
#[derive(Debug, Clone)]
pub struct Volume {
    pub header: NiftiHeader,
    pub data: Array3<f32>,
}

impl Volume {
    pub fn shape(&self) -> [usize; 3] {
        self.data.dim().into()
    }

    pub fn grid(&self) -> Result<Grid> {
        Grid::from_header(&self.header, self.shape())
    }
}

fn read_nd(path: &Path) -> Result<(NiftiHeader, ArrayD<f32>)> {
    let obj = ReaderOptions::new().read_file(path)?;
    let header = obj.header().clone();
    let data = obj.into_volume().into_ndarray::<f32>()?;
    Ok((header, data))
}

/// reads a 3-D image. Trailing singleton dimensions are accepted.
pub fn read_volume(path: impl AsRef<Path>) -> Result<Volume> {
    let path = path.as_ref();
    let (header, mut data) = read_nd(path)?;
    while data.ndim() > 3 && data.shape()[data.ndim() - 1] == 1 {
        let last = data.ndim() - 1;
        data = data.index_axis_move(Axis(last), 0);
    }
    let data = data
        .into_dimensionality::<Ix3>()
        .map_err(|_| PipelineError::image(path, "expected a 3-D volume"))?;
    Ok(Volume { header, data })
}

/// reads the first volume of a 4-D (or higher) series. A 3-D image is its own first volume.
pub fn read_first_frame(path: impl AsRef<Path>) -> Result<Volume> {
    let path = path.as_ref();
    let (header, mut data) = read_nd(path)?;
    if data.ndim() < 3 {
        return Err(PipelineError::image(path, format!("expected at least 3 dimensions, found {}", data.ndim())));
    }
    while data.ndim() > 3 {
        let last = data.ndim() - 1;
        data = data.index_axis_move(Axis(last), 0);
    }
    let data = data
        .into_dimensionality::<Ix3>()
        .map_err(|_| PipelineError::image(path, "failed to reduce series to a 3-D frame"))?;
    Ok(Volume { header, data })
}

/// writes `data` with the spatial metadata of `reference`
pub fn write_volume(path: impl AsRef<Path>, reference: &NiftiHeader, data: &Array3<f32>) -> Result<()> {
    WriterOptions::new(path.as_ref())
        .reference_header(&unscaled(reference))
        .write_nifti(data)?;
    Ok(())
}

/// writes integer labels with the spatial metadata of `reference`
pub fn write_label_volume(path: impl AsRef<Path>, reference: &NiftiHeader, labels: &Array3<i32>) -> Result<()> {
    WriterOptions::new(path.as_ref())
        .reference_header(&unscaled(reference))
        .write_nifti(labels)?;
    Ok(())
}

/// voxel values are scaled on read, so written images carry identity scaling
fn unscaled(reference: &NiftiHeader) -> NiftiHeader {
    let mut header = reference.clone();
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    header
}

/// writes the first volume of `series` to `output`, keeping origin, spacing and orientation
pub fn extract_reference_frame(series: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<[usize; 3]> {
    let frame = read_first_frame(series.as_ref())?;
    debug!("extracted reference frame of shape {:?} from {}", frame.shape(), series.as_ref().display());
    write_volume(output, &frame.header, &frame.data)?;
    Ok(frame.shape())
}

/// zeroes every voxel of `image` where `mask` is not positive and writes the result
pub fn apply_mask(image: impl AsRef<Path>, mask: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<()> {
    let mut img = read_volume(image.as_ref())?;
    let msk = read_volume(mask.as_ref())?;
    if img.shape() != msk.shape() {
        return Err(PipelineError::image(
            mask.as_ref(),
            format!("mask shape {:?} does not match image shape {:?}", msk.shape(), img.shape()),
        ));
    }
    Zip::from(&mut img.data).and(&msk.data).par_for_each(|v, &m| {
        if !(m > 0.) {
            *v = 0.;
        }
    });
    write_volume(output, &img.header, &img.data)
}

/// voxel lattice of an image in world (RAS, mm) space
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub shape: [usize; 3],
    pub voxel_to_world: Matrix4<f64>,
    pub world_to_voxel: Matrix4<f64>,
}

impl Grid {
    pub fn new(shape: [usize; 3], voxel_to_world: Matrix4<f64>) -> Result<Self> {
        let world_to_voxel = voxel_to_world.try_inverse().ok_or_else(|| {
            PipelineError::image("<header>", "voxel to world matrix is singular")
        })?;
        Ok(Self { shape, voxel_to_world, world_to_voxel })
    }

    /// sform when set, else qform, else voxel spacing only. Images are expected to carry
    /// matching sform and qform when both are set, since ITK based tools may read the qform;
    /// a mismatch is logged.
    pub fn from_header(header: &NiftiHeader, shape: [usize; 3]) -> Result<Self> {
        Self::new(shape, header_affine(header))
    }

    pub fn to_world(&self, ijk: [f64; 3]) -> [f64; 3] {
        let p = self.voxel_to_world * Vector4::new(ijk[0], ijk[1], ijk[2], 1.);
        [p.x, p.y, p.z]
    }

    pub fn to_voxel(&self, xyz: [f64; 3]) -> [f64; 3] {
        let p = self.world_to_voxel * Vector4::new(xyz[0], xyz[1], xyz[2], 1.);
        [p.x, p.y, p.z]
    }

    /// nearest voxel index, None when outside the lattice
    pub fn nearest_index(&self, ijk: [f64; 3]) -> Option<[usize; 3]> {
        let mut idx = [0usize; 3];
        for d in 0..3 {
            let r = ijk[d].round();
            if !(r >= 0. && r < self.shape[d] as f64) {
                return None;
            }
            idx[d] = r as usize;
        }
        Some(idx)
    }
}

fn header_affine(h: &NiftiHeader) -> Matrix4<f64> {
    match (sform_affine(h), qform_affine(h)) {
        (Some(sform), Some(qform)) => {
            if !affines_agree(&sform, &qform) {
                warn!("sform and qform disagree, using sform: {sform} vs {qform}");
            }
            sform
        }
        (Some(sform), None) => sform,
        (None, Some(qform)) => qform,
        (None, None) => pixdim_affine(h),
    }
}

/// within a micrometre, tolerating the float32 storage of both forms
fn affines_agree(a: &Matrix4<f64>, b: &Matrix4<f64>) -> bool {
    (a - b).amax() < 1e-3
}

fn sform_affine(h: &NiftiHeader) -> Option<Matrix4<f64>> {
    if h.sform_code <= 0 {
        return None;
    }
    let [x, y, z] = [h.srow_x, h.srow_y, h.srow_z].map(|r| r.map(f64::from));
    Some(Matrix4::new(
        x[0], x[1], x[2], x[3],
        y[0], y[1], y[2], y[3],
        z[0], z[1], z[2], z[3],
        0., 0., 0., 1.,
    ))
}

fn qform_affine(h: &NiftiHeader) -> Option<Matrix4<f64>> {
    if h.qform_code <= 0 {
        return None;
    }
    let dx = f64::from(h.pixdim[1]);
    let dy = f64::from(h.pixdim[2]);
    let b = f64::from(h.quatern_b);
    let c = f64::from(h.quatern_c);
    let d = f64::from(h.quatern_d);
    let a = (1. - (b * b + c * c + d * d)).max(0.).sqrt();
    let qfac = if h.pixdim[0] < 0. { -1. } else { 1. };
    let dz = f64::from(h.pixdim[3]) * qfac;
    Some(Matrix4::new(
        (a * a + b * b - c * c - d * d) * dx, (2. * (b * c - a * d)) * dy, (2. * (b * d + a * c)) * dz, f64::from(h.quatern_x),
        (2. * (b * c + a * d)) * dx, (a * a + c * c - b * b - d * d) * dy, (2. * (c * d - a * b)) * dz, f64::from(h.quatern_y),
        (2. * (b * d - a * c)) * dx, (2. * (c * d + a * b)) * dy, (a * a + d * d - b * b - c * c) * dz, f64::from(h.quatern_z),
        0., 0., 0., 1.,
    ))
}

fn pixdim_affine(h: &NiftiHeader) -> Matrix4<f64> {
    let spacing = |s: f32| if s > 0. { f64::from(s) } else { 1. };
    Matrix4::new(
        spacing(h.pixdim[1]), 0., 0., 0.,
        0., spacing(h.pixdim[2]), 0., 0.,
        0., 0., spacing(h.pixdim[3]), 0.,
        0., 0., 0., 1.,
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::Array4;
    use tempfile::tempdir;

    /// header with a 2 mm isotropic sform and a translated origin
    pub(crate) fn test_header() -> NiftiHeader {
        let mut h = NiftiHeader::default();
        h.sform_code = 1;
        h.qform_code = 0;
        h.pixdim = [1., 2., 2., 2., 3., 1., 1., 1.];
        h.srow_x = [2., 0., 0., -10.];
        h.srow_y = [0., 2., 0., 5.];
        h.srow_z = [0., 0., 2., 1.];
        h
    }

    pub(crate) fn write_test_volume(path: &Path, data: &Array3<f32>) {
        write_volume(path, &test_header(), data).unwrap();
    }

    #[test]
    fn extracts_first_frame_with_geometry() {
        let dir = tempdir().unwrap();
        let series_path = dir.path().join("series.nii.gz");
        let series = Array4::from_shape_fn((4, 5, 6, 3), |(x, y, z, t)| (x + 10 * y + 100 * z + 1000 * t) as f32);
        WriterOptions::new(&series_path).reference_header(&test_header()).write_nifti(&series).unwrap();

        let out = dir.path().join("ref.nii.gz");
        let shape = extract_reference_frame(&series_path, &out).unwrap();
        assert_eq!(shape, [4, 5, 6]);

        let frame = read_volume(&out).unwrap();
        assert_eq!(frame.shape(), [4, 5, 6]);
        assert_eq!(frame.data[[1, 2, 3]], 321.);
        assert_eq!(frame.header.srow_x, [2., 0., 0., -10.]);
        assert_eq!(frame.header.srow_y, [0., 2., 0., 5.]);
        assert_eq!(frame.header.srow_z, [0., 0., 2., 1.]);
        assert_eq!(&frame.header.pixdim[1..4], &[2., 2., 2.]);
    }

    #[test]
    fn masks_background() {
        let dir = tempdir().unwrap();
        let img_path = dir.path().join("img.nii.gz");
        let msk_path = dir.path().join("mask.nii.gz");
        let out = dir.path().join("masked.nii.gz");

        let img = Array3::from_elem((3, 3, 3), 5f32);
        let msk = Array3::from_shape_fn((3, 3, 3), |(x, _, _)| if x == 1 { 1f32 } else { 0f32 });
        write_test_volume(&img_path, &img);
        write_test_volume(&msk_path, &msk);

        apply_mask(&img_path, &msk_path, &out).unwrap();
        let masked = read_volume(&out).unwrap();
        assert_eq!(masked.data[[1, 0, 2]], 5.);
        assert_eq!(masked.data[[0, 1, 1]], 0.);
        assert_eq!(masked.data.sum(), 5. * 9.);
    }

    #[test]
    fn mask_shape_mismatch_is_an_error() {
        let dir = tempdir().unwrap();
        let img_path = dir.path().join("img.nii.gz");
        let msk_path = dir.path().join("mask.nii.gz");
        write_test_volume(&img_path, &Array3::zeros((3, 3, 3)));
        write_test_volume(&msk_path, &Array3::zeros((3, 3, 2)));
        assert!(matches!(
            apply_mask(&img_path, &msk_path, dir.path().join("o.nii.gz")),
            Err(PipelineError::Image { .. })
        ));
    }

    #[test]
    fn grid_round_trip() {
        let grid = Grid::from_header(&test_header(), [4, 5, 6]).unwrap();
        assert_eq!(grid.to_world([0., 0., 0.]), [-10., 5., 1.]);
        assert_eq!(grid.to_world([1., 2., 3.]), [-8., 9., 7.]);
        let v = grid.to_voxel([-8., 9., 7.]);
        assert!((v[0] - 1.).abs() < 1e-9 && (v[1] - 2.).abs() < 1e-9 && (v[2] - 3.).abs() < 1e-9);
        assert_eq!(grid.nearest_index([0.4, 1.6, 5.49]), Some([0, 2, 5]));
        assert_eq!(grid.nearest_index([-0.6, 0., 0.]), None);
        assert_eq!(grid.nearest_index([0., 0., 5.6]), None);
    }

    #[test]
    fn sform_wins_over_disagreeing_qform() {
        let mut h = test_header();
        assert!(qform_affine(&h).is_none());
        h.qform_code = 1;
        h.quatern_x = -10.;
        h.quatern_y = 5.;
        h.quatern_z = 1.;
        // identity rotation, 2 mm spacing: same space as the sform
        let (Some(sform), Some(qform)) = (sform_affine(&h), qform_affine(&h)) else { panic!("both forms set") };
        assert!(affines_agree(&sform, &qform));

        h.quatern_x = 30.;
        let qform = qform_affine(&h).unwrap();
        assert!(!affines_agree(&sform, &qform));
        let grid = Grid::from_header(&h, [2, 2, 2]).unwrap();
        assert_eq!(grid.to_world([0., 0., 0.]), [-10., 5., 1.]);
    }

    #[test]
    fn qform_affine_from_quaternion() {
        let mut h = NiftiHeader::default();
        h.sform_code = 0;
        h.qform_code = 1;
        h.pixdim = [1., 1., 2., 3., 1., 1., 1., 1.];
        // 180 degree rotation about z
        h.quatern_b = 0.;
        h.quatern_c = 0.;
        h.quatern_d = 1.;
        h.quatern_x = 4.;
        h.quatern_y = 5.;
        h.quatern_z = 6.;
        let grid = Grid::from_header(&h, [2, 2, 2]).unwrap();
        let p = grid.to_world([1., 1., 1.]);
        assert!((p[0] - 3.).abs() < 1e-9);
        assert!((p[1] - 3.).abs() < 1e-9);
        assert!((p[2] - 9.).abs() < 1e-9);
    }
}
