//! Fourier-domain application of matrix stacks to fields, and projections onto
//! transmitted or reflected light with optional intensity normalization.
//!
//! All functions work on one ray: a field stack of shape
//! `(wavelengths, 4, height, width)`.

use std::str::FromStr;

use ndarray::{Array2, Array3, Array4, ArrayView3, ArrayView4, Axis, Zip};
use num_complex::Complex64;
use serde::Deserialize;

use crate::cache::MatrixStack;
use crate::diffract::{self, Betamax, Context, Mode};
use crate::error::{Error, Result};
use crate::fft::{fft2, ifft2};
use crate::field::{apply_jones_matrix, field2intensity, jonesvec, polarizer};
use crate::linalg::dotmf;

type C = Complex64;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MatrixCache;
    use crate::field::total_intensity;
    use crate::optics::BerremanOptics;
    use rand::Rng;

    fn random_field(h: usize, w: usize, nwl: usize) -> Array4<C> {
        let mut rng = rand::rng();
        Array4::from_shape_fn((nwl, 4, h, w), |_| C::new(rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0)))
    }

    fn identity_stack(nwl: usize, h: usize, w: usize) -> MatrixStack {
        MatrixStack::from_shape_fn((nwl, h, w, 4, 4), |(_, _, _, i, j)| {
            if i == j {
                C::new(1.0, 0.0)
            } else {
                C::new(0.0, 0.0)
            }
        })
    }

    fn max_diff(a: &Array4<C>, b: &Array4<C>) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).norm()).fold(0.0, f64::max)
    }

    #[test]
    fn identity_diffraction_round_trips() {
        let field = random_field(6, 4, 2);
        let out = diffract(&field.view(), &identity_stack(2, 6, 4), None).unwrap();
        assert_eq!(out.shape(), field.shape());
        assert!(max_diff(&out, &field) < 1e-12);
    }

    #[test]
    fn diffract_then_inverse_recovers_field() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let ks = [10.0];
        let eps = [C::new(2.25, 0.0); 3];
        let dmat = diffract::diffraction_matrix(&ctx, (4, 4), &ks, 2.0, &eps, &[0.0; 3], Mode::Both, Betamax::Unlimited).unwrap();
        let inverse = MatrixStack::from_shape_vec(
            dmat.raw_dim(),
            crate::linalg::inv(&dmat.index_axis(Axis(0), 0)).unwrap().into_raw_vec_and_offset().0,
        )
        .unwrap();
        let field = random_field(4, 4, 1);
        let there = diffract(&field.view(), &dmat, None).unwrap();
        let back = diffract(&there.view(), &inverse, None).unwrap();
        assert!(max_diff(&back, &field) < 1e-8);
    }

    #[test]
    fn transmitted_plus_reflected_is_field() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let field = random_field(4, 6, 2);
        let ks = [0.9, 1.4];
        let t = transmitted_field(&ctx, &field.view(), &ks, 1.3, Betamax::Unlimited, None, None).unwrap();
        let r = reflected_field(&ctx, &field.view(), &ks, 1.3, Betamax::Unlimited, None).unwrap();
        assert!(max_diff(&(&t + &r), &field) < 1e-9);
    }

    #[test]
    fn total_norm_matches_reference_intensity() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let ks = [20.0];
        let field = random_field(4, 4, 1);
        let t = transmitted_field(&ctx, &field.view(), &ks, 1.0, Betamax::Unlimited, None, None).unwrap();
        let reference = t.mapv(|v| v * 0.5);
        let out = transmitted_field(
            &ctx,
            &field.view(),
            &ks,
            1.0,
            Betamax::Unlimited,
            Some(Norm::Total),
            Some(&reference.view()),
        )
        .unwrap();
        let i_ref = total_intensity(&reference.view())[0];
        let i_out = total_intensity(&out.view())[0];
        assert!(i_ref > 0.0);
        assert!((i_out - i_ref).abs() < 1e-9 * i_ref);
    }

    #[test]
    fn norm_factor_is_clamped() {
        assert_eq!(norm_factor(1.0, 0.0), 0.0);
        assert_eq!(norm_factor(4.0, 1.0), 1.0);
        assert_eq!(norm_factor(-4.0, 1.0), 1.0);
        assert!((norm_factor(1.0, 4.0) - 0.5).abs() < 1e-15);
    }

    #[test]
    fn local_norm_preserves_circular_intensities() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let ks = [1.0];
        // uniform forward x-polarized wave: projection keeps it
        let mut field = Array4::<C>::zeros((1, 4, 3, 3));
        field.index_axis_mut(Axis(1), 0).fill(C::new(1.0, 0.0));
        field.index_axis_mut(Axis(1), 1).fill(C::new(1.0, 0.0));
        let out = transmitted_field(&ctx, &field.view(), &ks, 1.0, Betamax::Hard(0.8), Some(Norm::Local), None).unwrap();
        assert!(max_diff(&out, &field) < 1e-9);
    }

    #[test]
    fn window_multiplies_output() {
        let field = random_field(2, 2, 1);
        let window = Array2::from_elem((2, 2), 0.5);
        let out = diffract(&field.view(), &identity_stack(1, 2, 2), Some(&window)).unwrap();
        assert!(max_diff(&out, &field.mapv(|v| v * 0.5)) < 1e-12);
    }

    #[test]
    fn norm_parsing() {
        assert_eq!("fft".parse::<Norm>().unwrap(), Norm::Fft);
        assert_eq!("local".parse::<Norm>().unwrap(), Norm::Local);
        assert_eq!("total".parse::<Norm>().unwrap(), Norm::Total);
        assert!("none".parse::<Norm>().is_err());
    }
}

/// Intensity normalization applied after a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Norm {
    /// Match the power of every frequency bin.
    Fft,
    /// Match the left and right circular intensities of every pixel.
    Local,
    /// Match the integrated intensity of every wavelength.
    Total,
}

impl FromStr for Norm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fft" => Ok(Norm::Fft),
            "local" => Ok(Norm::Local),
            "total" => Ok(Norm::Total),
            other => Err(Error::UnknownVariant {
                kind: "normalization",
                value: other.to_string(),
            }),
        }
    }
}

/// Amplitude factor that brings intensity `i_out` to `i_ref`, clamped to
/// `[0, 1]`. A zero denominator gives `0`.
pub fn norm_factor(i_ref: f64, i_out: f64) -> f64 {
    if i_out == 0.0 {
        return 0.0;
    }
    (i_ref / i_out).clamp(-1.0, 1.0).abs().sqrt()
}

fn check_stack(field: &ArrayView4<C>, dmat: &MatrixStack) -> Result<()> {
    let fs = field.shape();
    let ds = dmat.shape();
    if fs[1] != 4 {
        return Err(Error::shape(format!("field must have 4 components, got {}", fs[1])));
    }
    if ds[0] != fs[0] || ds[1] != fs[2] || ds[2] != fs[3] {
        return Err(Error::shape(format!(
            "matrix stack {:?} does not match field {:?}",
            &ds[..3],
            fs
        )));
    }
    Ok(())
}

fn apply_window(field: &mut Array4<C>, window: Option<&Array2<f64>>) -> Result<()> {
    if let Some(window) = window {
        if window.shape() != &field.shape()[2..] {
            return Err(Error::shape(format!(
                "window {:?} does not match field grid {:?}",
                window.shape(),
                &field.shape()[2..]
            )));
        }
        for mut plane in field.outer_iter_mut() {
            for mut comp in plane.outer_iter_mut() {
                comp.zip_mut_with(window, |v, w| *v *= *w);
            }
        }
    }
    Ok(())
}

fn transform(plane: &ArrayView3<C>, dmat: &ArrayView4<C>) -> Result<Array3<C>> {
    let f = fft2(plane);
    let f = dotmf(dmat, &f.view())?;
    Ok(ifft2(&f.view()))
}

/// Applies `dmat` to every frequency bin of `field` and multiplies the result
/// by `window`. Shape is preserved.
pub fn diffract(field: &ArrayView4<C>, dmat: &MatrixStack, window: Option<&Array2<f64>>) -> Result<Array4<C>> {
    check_stack(field, dmat)?;
    let mut out = Array4::zeros(field.raw_dim());
    for (wl, mut plane) in out.outer_iter_mut().enumerate() {
        plane.assign(&transform(&field.index_axis(Axis(0), wl), &dmat.index_axis(Axis(0), wl))?);
    }
    apply_window(&mut out, window)?;
    Ok(out)
}

fn diffract_normalized_fft(
    field: &ArrayView4<C>,
    dmat: &MatrixStack,
    reference: Option<&ArrayView4<C>>,
) -> Result<Array4<C>> {
    check_stack(field, dmat)?;
    let mut out = Array4::zeros(field.raw_dim());
    for (wl, mut plane) in out.outer_iter_mut().enumerate() {
        let f1 = fft2(&field.index_axis(Axis(0), wl));
        let i1 = match reference {
            Some(r) => field2intensity(&fft2(&r.index_axis(Axis(0), wl)).view()),
            None => field2intensity(&f1.view()),
        };
        let mut f2 = dotmf(&dmat.index_axis(Axis(0), wl), &f1.view())?;
        let i2 = field2intensity(&f2.view());
        let fact = Zip::from(&i1).and(&i2).map_collect(|&a, &b| norm_factor(a, b));
        for mut comp in f2.outer_iter_mut() {
            comp.zip_mut_with(&fact, |v, f| *v *= *f);
        }
        plane.assign(&ifft2(&f2.view()));
    }
    Ok(out)
}

fn diffract_normalized_local(
    field: &ArrayView4<C>,
    dmat: &MatrixStack,
    reference: Option<&ArrayView4<C>>,
) -> Result<Array4<C>> {
    check_stack(field, dmat)?;
    let one = C::new(1.0, 0.0);
    let lmat = polarizer(jonesvec([one, C::new(0.0, 1.0)]));
    let rmat = polarizer(jonesvec([one, C::new(0.0, -1.0)]));
    let mut out = Array4::zeros(field.raw_dim());
    for (wl, mut plane) in out.outer_iter_mut().enumerate() {
        let src = field.index_axis(Axis(0), wl);
        let base = match reference {
            Some(r) => r.index_axis(Axis(0), wl),
            None => src.view(),
        };
        let i1l = field2intensity(&apply_jones_matrix(&lmat, &base).view());
        let i1r = field2intensity(&apply_jones_matrix(&rmat, &base).view());
        let projected = transform(&src, &dmat.index_axis(Axis(0), wl))?;
        let mut outl = apply_jones_matrix(&lmat, &projected.view());
        let mut outr = apply_jones_matrix(&rmat, &projected.view());
        for (part, i1) in [(&mut outl, &i1l), (&mut outr, &i1r)] {
            let i2 = field2intensity(&part.view());
            let fact = Zip::from(i1).and(&i2).map_collect(|&a, &b| norm_factor(a, b));
            for mut comp in part.outer_iter_mut() {
                comp.zip_mut_with(&fact, |v, f| *v *= *f);
            }
        }
        plane.assign(&(outl + outr));
    }
    Ok(out)
}

fn diffract_normalized_total(
    field: &ArrayView4<C>,
    dmat: &MatrixStack,
    reference: Option<&ArrayView4<C>>,
) -> Result<Array4<C>> {
    check_stack(field, dmat)?;
    let mut out = Array4::zeros(field.raw_dim());
    for (wl, mut plane) in out.outer_iter_mut().enumerate() {
        let src = field.index_axis(Axis(0), wl);
        let i1 = match reference {
            Some(r) => field2intensity(&r.index_axis(Axis(0), wl)).sum(),
            None => field2intensity(&src).sum(),
        };
        let projected = transform(&src, &dmat.index_axis(Axis(0), wl))?;
        let i2 = field2intensity(&projected.view()).sum();
        let fact = norm_factor(i1, i2);
        plane.assign(&projected.mapv(|v| v * fact));
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn projected_field(
    ctx: &Context,
    field: &ArrayView4<C>,
    ks: &[f64],
    mode: Mode,
    n: f64,
    betamax: Betamax,
    norm: Option<Norm>,
    reference: Option<&ArrayView4<C>>,
) -> Result<Array4<C>> {
    if let Some(r) = reference {
        if r.shape() != field.shape() {
            return Err(Error::shape(format!(
                "reference {:?} does not match field {:?}",
                r.shape(),
                field.shape()
            )));
        }
    }
    let shape = (field.shape()[2], field.shape()[3]);
    let eps = [C::new(n * n, 0.0); 3];
    let pmat = diffract::projection_matrix(ctx, shape, ks, &eps, &[0.0; 3], mode, betamax)?;
    match norm {
        None => diffract(field, &pmat, None),
        Some(Norm::Fft) => diffract_normalized_fft(field, &pmat, reference),
        Some(Norm::Local) => diffract_normalized_local(field, &pmat, reference),
        Some(Norm::Total) => diffract_normalized_total(field, &pmat, reference),
    }
}

/// Forward propagating part of `field` in an isotropic medium of index `n`.
/// With a normalization, intensities are matched to `reference` when given and
/// to the input field otherwise.
pub fn transmitted_field(
    ctx: &Context,
    field: &ArrayView4<C>,
    ks: &[f64],
    n: f64,
    betamax: Betamax,
    norm: Option<Norm>,
    reference: Option<&ArrayView4<C>>,
) -> Result<Array4<C>> {
    projected_field(ctx, field, ks, Mode::Transmitted, n, betamax, norm, reference)
}

/// Backward propagating part of `field` in an isotropic medium of index `n`.
pub fn reflected_field(
    ctx: &Context,
    field: &ArrayView4<C>,
    ks: &[f64],
    n: f64,
    betamax: Betamax,
    norm: Option<Norm>,
) -> Result<Array4<C>> {
    projected_field(ctx, field, ks, Mode::Reflected, n, betamax, norm, None)
}

/// `field` diffracted over a distance `d` in an isotropic medium of index `n`.
pub fn diffracted_field(
    ctx: &Context,
    field: &ArrayView4<C>,
    ks: &[f64],
    d: f64,
    n: f64,
    mode: Mode,
    betamax: Betamax,
) -> Result<Array4<C>> {
    let shape = (field.shape()[2], field.shape()[3]);
    let eps = [C::new(n * n, 0.0); 3];
    let dmat = diffract::diffraction_matrix(ctx, shape, ks, d, &eps, &[0.0; 3], mode, betamax)?;
    diffract(field, &dmat, None)
}

/// Completes a Jones field (electric components in the even slots) with the
/// magnetic components of forward waves in a medium of index `n`.
pub fn jones2h(ctx: &Context, field: &ArrayView4<C>, ks: &[f64], n: f64, betamax: Betamax) -> Result<Array4<C>> {
    let shape = (field.shape()[2], field.shape()[3]);
    let dmat = diffract::jones2h_matrix(ctx, shape, ks, n, betamax)?;
    diffract(field, &dmat, None)
}
