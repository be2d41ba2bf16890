//! Optical data: an ordered stack of layers, each with a thickness, three
//! principal dielectric values and the orientation of the dielectric frame.
//!
//! - Homogeneous data stores one value triple per layer, `(n, 3)`.
//! - Inhomogeneous data stores one triple per voxel, `(n, height, width, 3)`.
//!
//! Thickness is in pixel units, angles are `(yaw, theta, phi)` in radians.

use ndarray::{s, Array, Array1, Array2, Array4, ArrayD, ArrayView3, Axis, Dimension, Ix2, Ix4, IxDyn};
use num_complex::Complex64;

use crate::error::{Error, Result};

#[cfg(test)]
mod tests {
    use super::*;

    fn c(re: f64) -> Complex64 {
        Complex64::new(re, 0.0)
    }

    #[test]
    fn uniaxial_order_examples() {
        let eps = [c(1.0), c(2.0), c(3.0)];
        assert_eq!(uniaxial_order(0.0, eps), [c(2.0), c(2.0), c(2.0)]);
        let ordered = uniaxial_order(1.0, eps);
        for (v, e) in ordered.iter().zip([1.5, 1.5, 3.0]) {
            assert!((v - c(e)).norm() < 1e-12);
        }
    }

    #[test]
    fn refind_to_eps_squares() {
        let eps = refind2eps([c(1.5), c(1.5), c(1.6)]);
        assert!((eps[2] - c(2.56)).norm() < 1e-12);
    }

    #[test]
    fn single_layer_broadcasts_over_thickness() {
        let material = ArrayD::from_shape_vec(vec![3], vec![c(2.0), c(2.0), c(2.5)]).unwrap();
        let angles = ArrayD::from_shape_vec(vec![3], vec![0.0, 0.1, 0.2]).unwrap();
        let data = OpticalData::from_dyn(vec![1.0, 2.0, 3.0], material, angles, true).unwrap();
        assert_eq!(data.len(), 3);
        assert!(data.is_homogeneous());
        let layer = data.homogeneous_layer(2).unwrap();
        assert_eq!(layer.thickness, 3.0);
        assert_eq!(layer.epsa, [0.0, 0.1, 0.2]);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let material = Array2::from_elem((2, 3), c(2.0));
        let angles = Array2::zeros((2, 3));
        let err = OpticalData::homogeneous(vec![1.0, 1.0, 1.0], material, angles);
        assert!(matches!(err, Err(Error::InvalidData(_))));
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let material = Array4::from_elem((1, 4, 4, 3), c(2.0));
        let angles = Array4::zeros((1, 4, 5, 3));
        assert!(OpticalData::inhomogeneous(vec![1.0], material, angles).is_err());
    }

    #[test]
    fn negative_thickness_is_rejected() {
        let material = Array2::from_elem((1, 3), c(2.0));
        let angles = Array2::zeros((1, 3));
        assert!(OpticalData::homogeneous(vec![-1.0], material, angles).is_err());
    }

    #[test]
    fn effective_data_averages_all_voxels() {
        let mut material = Array4::from_elem((2, 2, 2, 3), c(2.0));
        material.slice_mut(s![1, .., .., ..]).fill(c(4.0));
        let angles = Array4::zeros((2, 2, 2, 3));
        let data = OpticalData::inhomogeneous(vec![1.0, 2.0], material, angles).unwrap();
        let eff = isotropic_effective_data(&data).unwrap();
        assert!(eff.is_homogeneous());
        for j in 0..2 {
            let layer = eff.homogeneous_layer(j).unwrap();
            assert!(layer.epsv.iter().all(|v| (v - c(3.0)).norm() < 1e-12));
            assert_eq!(layer.epsa, [0.0; 3]);
        }
        assert_eq!(eff.thickness, vec![1.0, 2.0]);
    }
}

/// Per-layer values, either one triple per layer or one triple per voxel.
#[derive(Debug, Clone, PartialEq)]
pub enum Voxels<T> {
    Homogeneous(Array2<T>),
    Inhomogeneous(Array4<T>),
}

impl<T> Voxels<T> {
    pub fn len(&self) -> usize {
        match self {
            Voxels::Homogeneous(a) => a.shape()[0],
            Voxels::Inhomogeneous(a) => a.shape()[0],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Voxels::Homogeneous(a) => a.shape(),
            Voxels::Inhomogeneous(a) => a.shape(),
        }
    }
}

impl<T: Copy> Voxels<T> {
    fn layer(&self, j: usize) -> LayerValues<'_, T> {
        match self {
            Voxels::Homogeneous(a) => LayerValues::Uniform([a[[j, 0]], a[[j, 1]], a[[j, 2]]]),
            Voxels::Inhomogeneous(a) => LayerValues::PerPixel(a.index_axis(Axis(0), j)),
        }
    }
}

/// Dielectric values (complex) of every layer.
pub type Material = Voxels<Complex64>;
/// Orientation angles `(yaw, theta, phi)` of every layer.
pub type Angles = Voxels<f64>;

/// Values of a single layer.
#[derive(Debug, Clone, Copy)]
pub enum LayerValues<'a, T> {
    Uniform([T; 3]),
    PerPixel(ArrayView3<'a, T>),
}

/// A borrowed view of one layer, with the thickness already signed for the
/// traversal direction.
#[derive(Debug, Clone, Copy)]
pub struct Layer<'a> {
    pub thickness: f64,
    pub epsv: LayerValues<'a, Complex64>,
    pub epsa: LayerValues<'a, f64>,
}

impl Layer<'_> {
    pub fn is_homogeneous(&self) -> bool {
        matches!(self.epsv, LayerValues::Uniform(_))
    }

    pub fn with_thickness(mut self, thickness: f64) -> Self {
        self.thickness = thickness;
        self
    }

    /// `(height, width)` of a per-voxel layer.
    pub fn grid(&self) -> Option<(usize, usize)> {
        match self.epsv {
            LayerValues::PerPixel(v) => Some((v.shape()[0], v.shape()[1])),
            LayerValues::Uniform(_) => None,
        }
    }
}

/// A layer with one dielectric triple, as used for effective layers and the
/// isotropic media around the stack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomogeneousLayer {
    pub thickness: f64,
    pub epsv: [Complex64; 3],
    pub epsa: [f64; 3],
}

impl HomogeneousLayer {
    /// Isotropic medium of refractive index `n`.
    pub fn isotropic(thickness: f64, n: f64) -> Self {
        let n = Complex64::new(n, 0.0);
        HomogeneousLayer {
            thickness,
            epsv: refind2eps([n, n, n]),
            epsa: [0.0; 3],
        }
    }

    pub fn with_thickness(mut self, thickness: f64) -> Self {
        self.thickness = thickness;
        self
    }

    pub fn as_layer(&self) -> Layer<'static> {
        Layer {
            thickness: self.thickness,
            epsv: LayerValues::Uniform(self.epsv),
            epsa: LayerValues::Uniform(self.epsa),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpticalData {
    pub thickness: Vec<f64>,
    pub material: Material,
    pub angles: Angles,
}

impl OpticalData {
    pub fn homogeneous(thickness: Vec<f64>, material: Array2<Complex64>, angles: Array2<f64>) -> Result<Self> {
        let data = OpticalData {
            thickness,
            material: Voxels::Homogeneous(material),
            angles: Voxels::Homogeneous(angles),
        };
        data.validate()?;
        Ok(data)
    }

    pub fn inhomogeneous(thickness: Vec<f64>, material: Array4<Complex64>, angles: Array4<f64>) -> Result<Self> {
        let data = OpticalData {
            thickness,
            material: Voxels::Inhomogeneous(material),
            angles: Voxels::Inhomogeneous(angles),
        };
        data.validate()?;
        Ok(data)
    }

    /// Builds optical data from dynamically shaped arrays. A single layer given
    /// without the leading layer axis, `(3,)` for homogeneous or `(h, w, 3)`
    /// for inhomogeneous data, is broadcast over all layers.
    pub fn from_dyn(
        thickness: Vec<f64>,
        material: ArrayD<Complex64>,
        angles: ArrayD<f64>,
        homogeneous: bool,
    ) -> Result<Self> {
        let n = thickness.len();
        if homogeneous {
            let material = broadcast_layers::<_, Ix2>(material, n, "material")?;
            let angles = broadcast_layers::<_, Ix2>(angles, n, "angles")?;
            OpticalData::homogeneous(thickness, material, angles)
        } else {
            let material = broadcast_layers::<_, Ix4>(material, n, "material")?;
            let angles = broadcast_layers::<_, Ix4>(angles, n, "angles")?;
            OpticalData::inhomogeneous(thickness, material, angles)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.thickness.len();
        if n == 0 {
            return Err(Error::data("optical data needs at least one layer"));
        }
        if let Some(d) = self.thickness.iter().find(|d| !d.is_finite() || **d < 0.0) {
            return Err(Error::data(format!("thickness must be finite and non-negative, got {}", d)));
        }
        if self.material.len() != n {
            return Err(Error::data(format!(
                "material length {} should match thickness length {}",
                self.material.len(),
                n
            )));
        }
        if self.angles.len() != n {
            return Err(Error::data(format!(
                "angles length {} should match thickness length {}",
                self.angles.len(),
                n
            )));
        }
        match (&self.material, &self.angles) {
            (Voxels::Homogeneous(_), Voxels::Homogeneous(_))
            | (Voxels::Inhomogeneous(_), Voxels::Inhomogeneous(_)) => {}
            _ => return Err(Error::data("material and angles must both be homogeneous or both inhomogeneous")),
        }
        if self.material.shape() != self.angles.shape() {
            return Err(Error::data(format!(
                "incompatible shapes for material {:?} and angles {:?}",
                self.material.shape(),
                self.angles.shape()
            )));
        }
        if *self.material.shape().last().unwrap_or(&0) != 3 {
            return Err(Error::data(format!(
                "material must hold three dielectric values per voxel, got shape {:?}",
                self.material.shape()
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.thickness.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thickness.is_empty()
    }

    pub fn is_homogeneous(&self) -> bool {
        matches!(self.material, Voxels::Homogeneous(_))
    }

    /// `(height, width)` of inhomogeneous data.
    pub fn grid(&self) -> Option<(usize, usize)> {
        match &self.material {
            Voxels::Inhomogeneous(a) => Some((a.shape()[1], a.shape()[2])),
            Voxels::Homogeneous(_) => None,
        }
    }

    pub fn layer(&self, j: usize) -> Layer<'_> {
        Layer {
            thickness: self.thickness[j],
            epsv: self.material.layer(j),
            epsa: self.angles.layer(j),
        }
    }

    pub fn homogeneous_layer(&self, j: usize) -> Result<HomogeneousLayer> {
        match (&self.material, &self.angles) {
            (Voxels::Homogeneous(m), Voxels::Homogeneous(a)) => Ok(HomogeneousLayer {
                thickness: self.thickness[j],
                epsv: [m[[j, 0]], m[[j, 1]], m[[j, 2]]],
                epsa: [a[[j, 0]], a[[j, 1]], a[[j, 2]]],
            }),
            _ => Err(Error::data("effective optical data must be homogeneous")),
        }
    }
}

fn broadcast_layers<T: Clone, D: Dimension>(values: ArrayD<T>, n: usize, name: &str) -> Result<Array<T, D>> {
    let ndim = values.ndim();
    let values = if Some(ndim + 1) == D::NDIM {
        let mut shape = vec![n];
        shape.extend_from_slice(values.shape());
        values
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| Error::data(format!("cannot broadcast {} over {} layers", name, n)))?
            .to_owned()
    } else {
        values
    };
    values
        .into_dimensionality::<D>()
        .map_err(|_| Error::data(format!("invalid dimensions of the {}: {}", name, ndim)))
}

/// Dielectric values from refractive indices.
pub fn refind2eps(refind: [Complex64; 3]) -> [Complex64; 3] {
    refind.map(|n| n * n)
}

/// Dielectric values of a uniaxial material with orientational order `order`,
/// given the values of the perfectly ordered material. `order == 0` returns
/// the isotropic average.
pub fn uniaxial_order(order: f64, eps: [Complex64; 3]) -> [Complex64; 3] {
    let m = (eps[0] + eps[1] + eps[2]) / 3.0;
    if order == 0.0 {
        return [m; 3];
    }
    let delta = eps[2] - (eps[0] + eps[1]) / 2.0;
    let eps1 = m - order * delta / 3.0;
    let eps3 = m + 2.0 * order * delta / 3.0;
    [eps1, eps1, eps3]
}

/// Homogeneous isotropic approximation of `data`: the isotropic average of
/// every voxel of every layer, the same for all layers, with zero angles and
/// the original thicknesses.
pub fn isotropic_effective_data(data: &OpticalData) -> Result<OpticalData> {
    let n = data.len();
    let (sum, count) = match &data.material {
        Voxels::Homogeneous(m) => sum_isotropic(m.rows().into_iter().map(|r| [r[0], r[1], r[2]])),
        Voxels::Inhomogeneous(m) => sum_isotropic(
            m.lanes(Axis(3)).into_iter().map(|r| [r[0], r[1], r[2]]),
        ),
    };
    if count == 0 {
        return Err(Error::data("optical data has no voxels"));
    }
    let mean = sum / count as f64;
    let material = Array2::from_elem((n, 3), mean);
    let angles = Array2::zeros((n, 3));
    OpticalData::homogeneous(data.thickness.clone(), material, angles)
}

fn sum_isotropic(values: impl Iterator<Item = [Complex64; 3]>) -> (Complex64, usize) {
    values.fold((Complex64::new(0.0, 0.0), 0), |(sum, count), eps| {
        (sum + uniaxial_order(0.0, eps)[0], count + 1)
    })
}

/// Stacks homogeneous layer triples, used by tests and callers that build
/// data layer by layer.
pub fn stack_layers(layers: &[HomogeneousLayer]) -> Result<OpticalData> {
    let n = layers.len();
    let mut material = Array2::zeros((n, 3));
    let mut angles = Array2::zeros((n, 3));
    for (j, layer) in layers.iter().enumerate() {
        material.slice_mut(s![j, ..]).assign(&Array1::from(layer.epsv.to_vec()));
        angles.slice_mut(s![j, ..]).assign(&Array1::from(layer.epsa.to_vec()));
    }
    OpticalData::homogeneous(layers.iter().map(|l| l.thickness).collect(), material, angles)
}
