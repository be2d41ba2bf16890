//! Plane-wave helpers: wavenumbers, the transverse wavevector of every FFT bin
//! and elementary waves synthesized from a single Fourier coefficient.

use std::f64::consts::PI;

use ndarray::Array2;
use num_complex::Complex64;

use crate::error::{Error, Result};


/// Sample frequencies of a length-`n` FFT in cycles per sample.
pub fn fftfreq(n: usize) -> Vec<f64> {
    let half = n.div_ceil(2);
    (0..n)
        .map(|i| {
            let k = if i < half { i as isize } else { i as isize - n as isize };
            k as f64 / n as f64
        })
        .collect()
}

/// Wavenumbers in inverse pixel units, `2 pi pixelsize / wavelength`.
pub fn k0(wavelengths: &[f64], pixelsize: f64) -> Result<Vec<f64>> {
    if !pixelsize.is_finite() || pixelsize <= 0.0 {
        return Err(Error::parameter("pixelsize", format!("must be positive, got {}", pixelsize)));
    }
    wavelengths
        .iter()
        .map(|&wl| {
            if wl > 0.0 && wl.is_finite() {
                Ok(2.0 * PI * pixelsize / wl)
            } else {
                Err(Error::parameter("wavelengths", format!("must be positive, got {}", wl)))
            }
        })
        .collect()
}

/// Transverse wavevector `(beta, phi)` of every FFT bin of a `(height, width)`
/// grid, with beta in units of `k`.
pub fn betaphi(shape: (usize, usize), k: f64) -> (Array2<f64>, Array2<f64>) {
    let (h, w) = shape;
    let yy = fftfreq(h);
    let xx = fftfreq(w);
    let k = k.abs();
    let beta = Array2::from_shape_fn((h, w), |(i, j)| {
        2.0 * PI * (xx[j] * xx[j] + yy[i] * yy[i]).sqrt() / k
    });
    let phi = Array2::from_shape_fn((h, w), |(i, j)| yy[i].atan2(xx[j]));
    (beta, phi)
}

/// Elementary plane wave whose 2D FFT is `amplitude` in bin `(i, j)` and zero
/// everywhere else.
pub fn eigenwave(shape: (usize, usize), i: usize, j: usize, amplitude: Complex64) -> Array2<Complex64> {
    let (h, w) = shape;
    let scale = amplitude / (h * w) as f64;
    Array2::from_shape_fn((h, w), |(y, x)| {
        let arg = 2.0 * PI * (((i * y) % h) as f64 / h as f64 + ((j * x) % w) as f64 / w as f64);
        scale * Complex64::from_polar(1.0, arg)
    })
}
