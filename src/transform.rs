//! Reader for the linear transform files written by ITK-based registration tools
//! (`*0GenericAffine.mat`, MATLAB level 4 format).
//!
//! A file holds a sequence of matrices, each preceded by a five-integer header:
//! `type, rows, cols, imaginary flag, name length`, then the NUL terminated name and the
//! values in column-major order. The transform parameters live in a variable named after the
//! ITK transform class (`AffineTransform_double_3_3`, `Euler3DTransform_double_3_3`, ...),
//! the rotation centre in a variable named `fixed`.
//!
//! ITK transforms act on physical points in LPS coordinates and map points of the fixed
//! (target) image into the moving image.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use nalgebra::{Matrix3, Vector3};

use crate::error::{PipelineError, Result};

/// a named matrix from a level 4 MAT file, flattened in storage order
#[derive(Debug, Clone, PartialEq)]
struct MatVariable {
    name: String,
    values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearTransform {
    pub matrix: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub center: Vector3<f64>,
}

impl LinearTransform {
    #[cfg(test)]
    pub(crate) fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
            translation: Vector3::zeros(),
            center: Vector3::zeros(),
        }
    }

    #[cfg(test)]
    pub(crate) fn translation(t: [f64; 3]) -> Self {
        Self { translation: Vector3::from(t), ..Self::identity() }
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        Self::from_mat_bytes(&bytes, path)
    }

    pub fn from_mat_bytes(bytes: &[u8], path: &Path) -> Result<Self> {
        let variables = read_variables(bytes, path)?;

        let center = match variables.iter().find(|v| v.name == "fixed") {
            Some(v) if v.values.len() >= 3 => Vector3::new(v.values[0], v.values[1], v.values[2]),
            Some(v) => return Err(PipelineError::transform(path, format!("'fixed' has {} values, expected 3", v.values.len()))),
            None => Vector3::zeros(),
        };
        // Euler3D stores its angle convention as a fourth fixed parameter
        let compute_zyx = variables
            .iter()
            .find(|v| v.name == "fixed")
            .and_then(|v| v.values.get(3))
            .is_some_and(|&flag| flag != 0.);

        let params = variables
            .iter()
            .find(|v| v.name != "fixed")
            .ok_or_else(|| PipelineError::transform(path, "no transform parameters found"))?;

        let (matrix, translation) = if params.name.starts_with("Euler3DTransform") {
            let p = expect_len(params, 6, path)?;
            (euler_matrix([p[0], p[1], p[2]], compute_zyx), Vector3::new(p[3], p[4], p[5]))
        } else if params.name.starts_with("AffineTransform") || params.name.starts_with("MatrixOffsetTransformBase") {
            let p = expect_len(params, 12, path)?;
            // parameters hold the matrix in row-major order followed by the translation
            (Matrix3::from_row_slice(&p[0..9]), Vector3::new(p[9], p[10], p[11]))
        } else {
            return Err(PipelineError::transform(path, format!("unsupported transform type '{}'", params.name)));
        };

        Ok(Self { matrix, translation, center })
    }

    /// encodes the transform as `AffineTransform_double_3_3` plus `fixed`, little-endian
    #[cfg(test)]
    pub(crate) fn to_mat_bytes(&self) -> Vec<u8> {
        let mut params = Vec::with_capacity(12);
        for r in 0..3 {
            for c in 0..3 {
                params.push(self.matrix[(r, c)]);
            }
        }
        params.extend(self.translation.iter());

        let mut buf = Vec::new();
        write_variable::<LittleEndian>(&mut buf, "AffineTransform_double_3_3", &params);
        write_variable::<LittleEndian>(&mut buf, "fixed", self.center.as_slice());
        buf
    }

    #[cfg(test)]
    pub(crate) fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_mat_bytes())?;
        Ok(())
    }

    /// maps a fixed-space physical point (LPS) to moving space
    pub fn apply_lps(&self, p: [f64; 3]) -> [f64; 3] {
        let x = Vector3::from(p);
        let y = self.matrix * (x - self.center) + self.translation + self.center;
        [y.x, y.y, y.z]
    }

    /// maps a fixed-space world point given in RAS (the NIfTI convention) to moving space RAS
    pub fn apply_ras(&self, p: [f64; 3]) -> [f64; 3] {
        let [x, y, z] = self.apply_lps([-p[0], -p[1], p[2]]);
        [-x, -y, z]
    }
}

fn expect_len<'a>(v: &'a MatVariable, n: usize, path: &Path) -> Result<&'a [f64]> {
    if v.values.len() != n {
        return Err(PipelineError::transform(
            path,
            format!("'{}' has {} parameters, expected {}", v.name, v.values.len(), n),
        ));
    }
    Ok(&v.values)
}

/// rotation matrix of ITK's Euler3DTransform, Z*X*Y by default or Z*Y*X
fn euler_matrix(angles: [f64; 3], compute_zyx: bool) -> Matrix3<f64> {
    let (sx, cx) = angles[0].sin_cos();
    let (sy, cy) = angles[1].sin_cos();
    let (sz, cz) = angles[2].sin_cos();
    let rx = Matrix3::new(1., 0., 0., 0., cx, -sx, 0., sx, cx);
    let ry = Matrix3::new(cy, 0., sy, 0., 1., 0., -sy, 0., cy);
    let rz = Matrix3::new(cz, -sz, 0., sz, cz, 0., 0., 0., 1.);
    if compute_zyx {
        rz * ry * rx
    } else {
        rz * rx * ry
    }
}

fn read_variables(bytes: &[u8], path: &Path) -> Result<Vec<MatVariable>> {
    let mut cursor = Cursor::new(bytes);
    let mut variables = Vec::new();
    while (cursor.position() as usize) < bytes.len() {
        let start = cursor.position();
        let le_type = cursor
            .read_i32::<LittleEndian>()
            .map_err(|_| PipelineError::transform(path, "truncated matrix header"))?;
        cursor.set_position(start);
        // the thousands digit of the type code gives the byte order, 0 for little-endian
        let var = if (0..1000).contains(&le_type) {
            read_variable::<LittleEndian>(&mut cursor, path)?
        } else {
            read_variable::<BigEndian>(&mut cursor, path)?
        };
        variables.push(var);
    }
    Ok(variables)
}

fn read_variable<B: ByteOrder>(cursor: &mut Cursor<&[u8]>, path: &Path) -> Result<MatVariable> {
    let truncated = |_| PipelineError::transform(path, "unexpected end of file");

    let mut header = [0i32; 5];
    cursor.read_i32_into::<B>(&mut header).map_err(truncated)?;
    let [mat_type, rows, cols, imag, name_len] = header;

    let machine = mat_type / 1000;
    let precision = (mat_type / 10) % 10;
    let kind = mat_type % 10;
    if !(0..=1).contains(&machine) || (mat_type / 100) % 10 != 0 || kind != 0 {
        return Err(PipelineError::transform(path, format!("unsupported matrix type code {mat_type}")));
    }
    if rows < 0 || cols < 0 || name_len <= 0 {
        return Err(PipelineError::transform(path, "invalid matrix header"));
    }

    let remaining = |cursor: &Cursor<&[u8]>| cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if name_len as usize > remaining(cursor) {
        return Err(PipelineError::transform(path, "matrix name longer than file"));
    }
    let mut name = vec![0u8; name_len as usize];
    cursor.read_exact(&mut name).map_err(truncated)?;
    let name = String::from_utf8_lossy(&name).trim_end_matches('\0').to_string();

    let width = match precision {
        0 => 8,
        1 => 4,
        _ => return Err(PipelineError::transform(path, format!("unsupported precision in type code {mat_type}"))),
    };
    let parts = if imag != 0 { 2 } else { 1 };
    let left = remaining(cursor);
    let n = (rows as usize)
        .checked_mul(cols as usize)
        .filter(|n| n.checked_mul(width * parts).is_some_and(|bytes| bytes <= left))
        .ok_or_else(|| PipelineError::transform(path, "matrix larger than file"))?;

    let mut values = vec![0f64; n];
    if precision == 0 {
        cursor.read_f64_into::<B>(&mut values).map_err(truncated)?;
    } else {
        let mut single = vec![0f32; n];
        cursor.read_f32_into::<B>(&mut single).map_err(truncated)?;
        values.iter_mut().zip(single).for_each(|(v, s)| *v = f64::from(s));
    }
    // imaginary parts are skipped
    cursor.set_position(cursor.position() + ((parts - 1) * n * width) as u64);
    Ok(MatVariable { name, values })
}

#[cfg(test)]
fn write_variable<B: ByteOrder>(buf: &mut Vec<u8>, name: &str, values: &[f64]) {
    use byteorder::WriteBytesExt;

    let header = [0, values.len() as i32, 1, 0, name.len() as i32 + 1];
    for h in header {
        // writing to a Vec cannot fail
        let _ = buf.write_i32::<B>(h);
    }
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    for &v in values {
        let _ = buf.write_f64::<B>(v);
    }
}

/// where registration writes its linear transform for an output prefix
pub fn generic_affine_path(prefix: &Path) -> PathBuf {
    let mut p = prefix.as_os_str().to_owned();
    p.push("0GenericAffine.mat");
    PathBuf::from(p)
}
