//! Field containers and intensity helpers.
//!
//! A [`FieldData`] holds one or more rays, each a stack of shape
//! `(wavelengths, 4, height, width)` over the components `(Ex, Hy, Ey, -Hx)`.
//! Intensities are the z-component of the Poynting vector. Polarizers are
//! Jones matrices lifted to 4x4, acting alike on the `(Ex, Ey)` and
//! `(Hy, -Hx)` pairs.

use ndarray::{Array1, Array2, Array3, Array4, Array5, ArrayView3, ArrayView4, Axis, Zip};
use num_complex::Complex64;

use crate::error::{Error, Result};
use crate::linalg::M4;
use crate::wave;


/// Pixel-sampled transverse field for one or more incident rays.
///
/// `field` has shape `(rays, wavelengths, 4, height, width)` with components
/// ordered `(Ex, Hy, Ey, -Hx)`. A Jones field uses the even slots only and
/// keeps the odd slots at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldData {
    pub field: Array5<Complex64>,
    pub wavelengths: Vec<f64>,
    pub pixelsize: f64,
}

impl FieldData {
    pub fn new(field: Array5<Complex64>, wavelengths: Vec<f64>, pixelsize: f64) -> Result<Self> {
        let data = FieldData {
            field,
            wavelengths,
            pixelsize,
        };
        data.validate()?;
        Ok(data)
    }

    /// Wraps a single-ray field of shape `(wavelengths, 4, height, width)`.
    pub fn single(field: Array4<Complex64>, wavelengths: Vec<f64>, pixelsize: f64) -> Result<Self> {
        FieldData::new(field.insert_axis(Axis(0)), wavelengths, pixelsize)
    }

    pub fn validate(&self) -> Result<()> {
        let shape = self.field.shape();
        if shape[1] != self.wavelengths.len() {
            return Err(Error::data(format!(
                "field has {} wavelength planes but {} wavelengths were given",
                shape[1],
                self.wavelengths.len()
            )));
        }
        if shape[2] != 4 {
            return Err(Error::shape(format!("field must have 4 components, got {}", shape[2])));
        }
        if !(self.pixelsize > 0.0) || !self.pixelsize.is_finite() {
            return Err(Error::parameter(
                "pixelsize",
                format!("must be positive, got {}", self.pixelsize),
            ));
        }
        Ok(())
    }

    pub fn nrays(&self) -> usize {
        self.field.shape()[0]
    }

    /// `(height, width)` of the field grid.
    pub fn grid(&self) -> (usize, usize) {
        (self.field.shape()[3], self.field.shape()[4])
    }

    pub fn wavenumbers(&self) -> Result<Vec<f64>> {
        wave::k0(&self.wavelengths, self.pixelsize)
    }

    pub fn ray(&self, i: usize) -> ArrayView4<'_, Complex64> {
        self.field.index_axis(Axis(0), i)
    }

    /// Reassembles per-ray fields into field data.
    pub fn from_rays(rays: Vec<Array4<Complex64>>, wavelengths: Vec<f64>, pixelsize: f64) -> Result<Self> {
        let views: Vec<_> = rays.iter().map(|r| r.view()).collect();
        let field = ndarray::stack(Axis(0), &views).map_err(|e| Error::shape(e.to_string()))?;
        FieldData::new(field, wavelengths, pixelsize)
    }
}

/// Poynting intensity `Re(Ex Hy* + Ey (-Hx)*)` of every pixel.
pub fn field2intensity(field: &ArrayView3<Complex64>) -> Array2<f64> {
    let (h, w) = (field.shape()[1], field.shape()[2]);
    let mut out = Array2::zeros((h, w));
    Zip::from(&mut out)
        .and(field.lanes(Axis(0)))
        .for_each(|o, v| *o = (v[0] * v[1].conj() + v[2] * v[3].conj()).re);
    out
}

/// Intensity summed over all pixels, one value per wavelength of a
/// `(wavelengths, 4, height, width)` stack.
pub fn total_intensity(stack: &ArrayView4<Complex64>) -> Array1<f64> {
    stack
        .outer_iter()
        .map(|plane| field2intensity(&plane).sum())
        .collect()
}

/// Normalized Jones vector.
pub fn jonesvec(pol: [Complex64; 2]) -> [Complex64; 2] {
    let norm = (pol[0].norm_sqr() + pol[1].norm_sqr()).sqrt();
    if norm == 0.0 {
        return pol;
    }
    [pol[0] / norm, pol[1] / norm]
}

/// Projector `v v^H` onto a Jones polarization state, acting identically on
/// the electric `(0, 2)` and magnetic `(1, 3)` component pairs.
pub fn polarizer(jones: [Complex64; 2]) -> M4 {
    let mut p = [[Complex64::new(0.0, 0.0); 2]; 2];
    for (i, row) in p.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v = jones[i] * jones[j].conj();
        }
    }
    let mut out = [[Complex64::new(0.0, 0.0); 4]; 4];
    for (i, row) in p.iter().enumerate() {
        for (j, v) in row.iter().enumerate() {
            out[2 * i][2 * j] = *v;
            out[2 * i + 1][2 * j + 1] = *v;
        }
    }
    out
}

pub fn apply_jones_matrix(jmat: &M4, field: &ArrayView3<Complex64>) -> Array3<Complex64> {
    let mut out = Array3::zeros(field.raw_dim());
    Zip::from(out.lanes_mut(Axis(0)))
        .and(field.lanes(Axis(0)))
        .for_each(|mut o, v| {
            for (i, row) in jmat.iter().enumerate() {
                o[i] = row[0] * v[0] + row[1] * v[1] + row[2] * v[2] + row[3] * v[3];
            }
        });
    out
}
