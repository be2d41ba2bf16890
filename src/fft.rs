//! Two-dimensional FFTs over the trailing `(height, width)` axes of a stack of
//! planes. The inverse transform is normalized by `1 / (height * width)`, so
//! `ifft2(fft2(x)) == x`.
//!
//! Plans come from one process-wide [`FftPlanner`], which keeps every plan it
//! has built, so each length and direction is planned once.

use std::sync::{Arc, Mutex, OnceLock};

use ndarray::{Array3, ArrayView3, ArrayViewMut3, Axis};
use num_complex::Complex64;
use rayon::prelude::*;
use rustfft::{Fft, FftDirection, FftPlanner};


/// Forward 2D FFT of every plane of `field`.
pub fn fft2(field: &ArrayView3<Complex64>) -> Array3<Complex64> {
    let mut out = field.to_owned();
    fft2_inplace(&mut out.view_mut());
    out
}

/// Normalized inverse 2D FFT of every plane of `field`.
pub fn ifft2(field: &ArrayView3<Complex64>) -> Array3<Complex64> {
    let mut out = field.to_owned();
    ifft2_inplace(&mut out.view_mut());
    out
}

pub fn fft2_inplace(field: &mut ArrayViewMut3<Complex64>) {
    transform(field, FftDirection::Forward);
}

pub fn ifft2_inplace(field: &mut ArrayViewMut3<Complex64>) {
    transform(field, FftDirection::Inverse);
    let (h, w) = (field.shape()[1], field.shape()[2]);
    if h * w > 0 {
        let scale = 1.0 / (h * w) as f64;
        field.par_mapv_inplace(|v| v * scale);
    }
}

fn transform(field: &mut ArrayViewMut3<Complex64>, direction: FftDirection) {
    let (h, w) = (field.shape()[1], field.shape()[2]);
    if h == 0 || w == 0 {
        return;
    }
    let (fft_rows, fft_cols) = plans(h, w, direction);

    field.axis_iter_mut(Axis(0)).into_par_iter().for_each(|mut plane| {
        let mut row_buf = vec![Complex64::new(0.0, 0.0); w];
        for mut row in plane.rows_mut() {
            for (b, v) in row_buf.iter_mut().zip(row.iter()) {
                *b = *v;
            }
            fft_rows.process(&mut row_buf);
            for (v, b) in row.iter_mut().zip(row_buf.iter()) {
                *v = *b;
            }
        }
        let mut col_buf = vec![Complex64::new(0.0, 0.0); h];
        for mut col in plane.columns_mut() {
            for (b, v) in col_buf.iter_mut().zip(col.iter()) {
                *b = *v;
            }
            fft_cols.process(&mut col_buf);
            for (v, b) in col.iter_mut().zip(col_buf.iter()) {
                *v = *b;
            }
        }
    });
}

/// Row and column plans for an `(h, w)` plane.
fn plans(h: usize, w: usize, direction: FftDirection) -> (Arc<dyn Fft<f64>>, Arc<dyn Fft<f64>>) {
    static PLANNER: OnceLock<Mutex<FftPlanner<f64>>> = OnceLock::new();
    let mut planner = PLANNER
        .get_or_init(|| Mutex::new(FftPlanner::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    (planner.plan_fft(w, direction), planner.plan_fft(h, direction))
}
