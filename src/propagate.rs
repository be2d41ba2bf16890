//! Layer-by-layer field propagation.
//!
//! Two methods advance a field through one physical layer:
//! - [`propagate_field_effective`] diffracts through a homogeneous effective
//!   layer, corrected at the ray direction, and applies the exact local
//!   transfer of the physical layer pixel by pixel.
//! - [`propagate_field_full`] decomposes the field into plane waves and
//!   transfers every retained wave with its own eigenmodes. Slow, but exact
//!   within the plane-wave decomposition.
//!
//! Fields are stacks of shape `(wavelengths, 4, height, width)`. In Jones mode
//! the odd slots stay zero.

use std::sync::Arc;

use ndarray::{s, Array2, Array3, Array4, ArrayView4, Axis, Zip};
use num_complex::Complex64;
use rayon::prelude::*;

use crate::cache::MatrixStack;
use crate::data::{HomogeneousLayer, Layer, LayerValues};
use crate::diffract::{self, Betamax, Context};
use crate::error::{Error, Result};
use crate::fft::fft2;
use crate::fresnel;
use crate::linalg::{dotmdmf, dotmm, mul4, DiagonalRef, MatrixRef, M4};
use crate::optics::{Direction, Eigenmodes, LayerOptics};
use crate::project::diffract;
use crate::wave::{betaphi, eigenwave};

type C = Complex64;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MatrixCache;
    use crate::optics::BerremanOptics;

    fn c(re: f64, im: f64) -> C {
        C::new(re, im)
    }

    /// Forward x-polarized plane wave at normal incidence in a medium of
    /// index `n`.
    fn plane_wave(n: f64, nwl: usize, h: usize, w: usize) -> Array4<C> {
        let mut field = Array4::zeros((nwl, 4, h, w));
        field.index_axis_mut(Axis(1), 0).fill(c(1.0, 0.0));
        field.index_axis_mut(Axis(1), 1).fill(c(n, 0.0));
        field
    }

    fn step(diffraction: bool, jones: bool) -> StepOptions {
        StepOptions {
            beta: 0.0,
            phi: 0.0,
            nsteps: 1,
            diffraction,
            jones,
            betamax: Betamax::Hard(1.0),
        }
    }

    fn max_diff(a: &Array4<C>, b: &Array4<C>) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).norm()).fold(0.0, f64::max)
    }

    #[test]
    fn homogeneous_layer_applies_plane_wave_phase() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let n = 1.5;
        let d = 3.0;
        let ks = [0.7, 1.1];
        let layer = HomogeneousLayer::isotropic(d, n);
        let field = plane_wave(n, 2, 3, 3);
        for diffraction in [false, true] {
            let (out, _) = propagate_field_effective(
                &ctx,
                &field.view(),
                &ks,
                &layer.as_layer(),
                &layer,
                None,
                None,
                &step(diffraction, false),
            )
            .unwrap();
            for (wl, k) in ks.iter().enumerate() {
                let phase = C::new(0.0, k * d * n).exp();
                let expected = field.index_axis(Axis(0), wl).mapv(|v| v * phase);
                let got = out.index_axis(Axis(0), wl);
                let diff = expected.iter().zip(got.iter()).map(|(a, b)| (a - b).norm()).fold(0.0, f64::max);
                assert!(diff < 1e-10, "diffraction = {}", diffraction);
            }
        }
    }

    #[test]
    fn zero_thickness_is_identity() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let layer = HomogeneousLayer::isotropic(0.0, 1.3);
        let mut field = plane_wave(1.3, 1, 4, 4);
        field[[0, 2, 1, 2]] = c(0.3, -0.2);
        field[[0, 3, 1, 2]] = c(0.1, 0.4);
        let (out, _) =
            propagate_field_effective(&ctx, &field.view(), &[1.0], &layer.as_layer(), &layer, None, None, &step(false, false))
                .unwrap();
        assert!(max_diff(&out, &field) < 1e-12);
    }

    #[test]
    fn backward_step_undoes_forward_step() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let layer = HomogeneousLayer {
            thickness: 2.0,
            epsv: [c(2.25, 0.0), c(2.25, 0.0), c(2.6, 0.0)],
            epsa: [0.0, 0.6, 0.3],
        };
        let ks = [1.0];
        let mut field = plane_wave(1.5, 1, 2, 2);
        field[[0, 2, 0, 0]] = c(0.5, 0.5);
        let (there, modes) =
            propagate_field_effective(&ctx, &field.view(), &ks, &layer.as_layer(), &layer, None, None, &step(false, false))
                .unwrap();
        let back_layer = layer.with_thickness(-2.0);
        let (back, _) = propagate_field_effective(
            &ctx,
            &there.view(),
            &ks,
            &back_layer.as_layer(),
            &back_layer,
            None,
            Some(modes),
            &step(false, false),
        )
        .unwrap();
        assert!(max_diff(&back, &field) < 1e-9);
    }

    #[test]
    fn full_method_matches_effective_for_uniform_wave() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let layer = HomogeneousLayer::isotropic(2.5, 1.2);
        let ks = [4.0];
        let field = plane_wave(1.2, 1, 4, 4);
        let (effective, _) = propagate_field_effective(
            &ctx,
            &field.view(),
            &ks,
            &layer.as_layer(),
            &layer,
            None,
            None,
            &step(true, false),
        )
        .unwrap();
        let full = propagate_field_full(&ctx, &field.view(), &ks, &layer.as_layer(), None, 1, false, Betamax::Unlimited).unwrap();
        assert!(max_diff(&effective, &full) < 1e-9);
    }

    #[test]
    fn tilted_ray_through_homogeneous_layer_matches_full_method() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let layer = HomogeneousLayer {
            thickness: 2.5,
            epsv: [c(2.25, 0.0), c(2.25, 0.0), c(2.6, 0.0)],
            epsa: [0.0, 0.6, 0.3],
        };
        let ks = [4.0];
        let field = Array4::from_shape_fn((1, 4, 4, 4), |(_, comp, i, j)| {
            let x = (comp * 16 + i * 4 + j) as f64;
            c((0.7 * x).sin(), (1.3 * x).cos())
        });
        let options = StepOptions {
            beta: 0.4,
            phi: 0.3,
            nsteps: 2,
            betamax: Betamax::Unlimited,
            ..step(true, false)
        };
        let (effective, _) =
            propagate_field_effective(&ctx, &field.view(), &ks, &layer.as_layer(), &layer, None, None, &options).unwrap();
        let full = propagate_field_full(&ctx, &field.view(), &ks, &layer.as_layer(), None, 2, false, Betamax::Unlimited).unwrap();
        assert!(max_diff(&effective, &full) < 1e-9);
    }

    #[test]
    fn full_method_applies_tilted_phase() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let (n, d, k) = (1.2, 2.5, 4.0);
        let layer = HomogeneousLayer::isotropic(d, n);
        let mut field = Array4::zeros((1, 4, 4, 4));
        // s-polarized wave along x in bin (0, 1)
        field.index_axis_mut(Axis(1), 2).assign(&eigenwave((4, 4), 0, 1, c(16.0, 0.0)));
        let forward = crate::project::transmitted_field(&ctx, &field.view(), &[k], n, Betamax::Unlimited, None, None).unwrap();
        let full = propagate_field_full(&ctx, &forward.view(), &[k], &layer.as_layer(), None, 2, false, Betamax::Unlimited).unwrap();
        let beta = 2.0 * std::f64::consts::PI * 0.25 / k;
        let phase = C::new(0.0, k * d * (n * n - beta * beta).sqrt()).exp();
        assert!(max_diff(&full, &forward.mapv(|v| v * phase)) < 1e-9);
    }

    #[test]
    fn jones_mode_keeps_odd_slots_empty() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let layer = HomogeneousLayer::isotropic(1.0, 1.5);
        let input = HomogeneousLayer::isotropic(0.0, 1.0);
        let mut field = Array4::zeros((1, 4, 2, 2));
        field.index_axis_mut(Axis(1), 0).fill(c(1.0, 0.0));
        let (out, _) = propagate_field_effective(
            &ctx,
            &field.view(),
            &[1.0],
            &layer.as_layer(),
            &layer,
            Some(&input),
            None,
            &step(true, true),
        )
        .unwrap();
        assert!(out.index_axis(Axis(1), 1).iter().all(|v| v.norm() == 0.0));
        assert!(out.index_axis(Axis(1), 3).iter().all(|v| v.norm() == 0.0));
        // normal incidence Fresnel transmission 1 -> 1.5
        let t = 2.0 / 2.5;
        assert!((out[[0, 0, 0, 0]].norm() - t).abs() < 1e-10);
    }

    #[test]
    fn inhomogeneous_layer_uses_per_pixel_modes() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let mut epsv = Array3::from_elem((1, 2, 3), c(1.0, 0.0));
        epsv.slice_mut(s![0, 1, ..]).fill(c(4.0, 0.0));
        let epsa = Array3::zeros((1, 2, 3));
        let layer = Layer {
            thickness: 1.0,
            epsv: LayerValues::PerPixel(epsv.view()),
            epsa: LayerValues::PerPixel(epsa.view()),
        };
        let effective = HomogeneousLayer::isotropic(1.0, 1.0);
        let mut field = Array4::zeros((1, 4, 1, 2));
        field[[0, 0, 0, 0]] = c(1.0, 0.0);
        field[[0, 1, 0, 0]] = c(1.0, 0.0);
        field[[0, 0, 0, 1]] = c(1.0, 0.0);
        field[[0, 1, 0, 1]] = c(2.0, 0.0);
        let (out, modes) =
            propagate_field_effective(&ctx, &field.view(), &[1.0], &layer, &effective, None, None, &step(false, false))
                .unwrap();
        assert!(!modes.is_uniform());
        assert!((out[[0, 0, 0, 0]] - C::new(0.0, 1.0).exp()).norm() < 1e-10);
        assert!((out[[0, 0, 0, 1]] - C::new(0.0, 2.0).exp()).norm() < 1e-10);
    }

    #[test]
    fn mismatched_layer_grid_is_rejected() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let epsv = Array3::from_elem((3, 3, 3), c(1.0, 0.0));
        let epsa = Array3::zeros((3, 3, 3));
        let layer = Layer {
            thickness: 1.0,
            epsv: LayerValues::PerPixel(epsv.view()),
            epsa: LayerValues::PerPixel(epsa.view()),
        };
        let effective = HomogeneousLayer::isotropic(1.0, 1.0);
        let field = Array4::zeros((1, 4, 2, 2));
        let res = propagate_field_effective(&ctx, &field.view(), &[1.0], &layer, &effective, None, None, &step(false, false));
        assert!(matches!(res, Err(Error::InvalidShape(_))));
    }
}

/// Per-layer step settings shared by both propagators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOptions {
    /// Ray direction used for the local transfer and the correction.
    pub beta: f64,
    pub phi: f64,
    /// Number of sub-steps the layer is split into.
    pub nsteps: usize,
    pub diffraction: bool,
    /// Forward-only Jones propagation.
    pub jones: bool,
    pub betamax: Betamax,
}

/// Eigenmodes of a physical layer at a fixed direction, either shared by the
/// whole layer (`(1, 1)` grid) or given per pixel.
#[derive(Debug, Clone)]
pub struct LayerModes {
    /// `(h, w, 4)`
    pub alpha: Array3<C>,
    /// `(h, w, 4, 4)`
    pub f: Array4<C>,
    pub fi: Array4<C>,
}

impl LayerModes {
    /// Decomposes `layer` at `(beta, phi)`.
    pub fn new(optics: &dyn LayerOptics, layer: &Layer, beta: f64, phi: f64, jones: bool) -> Result<Self> {
        Self::from_fn(layer, |epsv, epsa| {
            if jones {
                optics.jones_eigen_decompose(beta, phi, epsv, epsa)
            } else {
                optics.eigen_decompose(beta, phi, epsv, epsa)
            }
        })
    }

    fn from_fn<F>(layer: &Layer, modes: F) -> Result<Self>
    where
        F: Fn(&[C; 3], &[f64; 3]) -> Eigenmodes + Sync,
    {
        let grid: Array2<Eigenmodes> = match (layer.epsv, layer.epsa) {
            (LayerValues::Uniform(e), LayerValues::Uniform(a)) => Array2::from_elem((1, 1), modes(&e, &a)),
            (LayerValues::PerPixel(e), LayerValues::PerPixel(a)) => {
                if e.shape() != a.shape() {
                    return Err(Error::shape(format!(
                        "layer material {:?} and angles {:?} differ in shape",
                        e.shape(),
                        a.shape()
                    )));
                }
                Zip::from(e.lanes(Axis(2)))
                    .and(a.lanes(Axis(2)))
                    .par_map_collect(|e, a| modes(&[e[0], e[1], e[2]], &[a[0], a[1], a[2]]))
            }
            _ => return Err(Error::data("layer material and angles must both be uniform or both per pixel")),
        };
        let (h, w) = grid.dim();
        Ok(LayerModes {
            alpha: Array3::from_shape_fn((h, w, 4), |(i, j, k)| grid[[i, j]].alpha[k]),
            f: Array4::from_shape_fn((h, w, 4, 4), |(i, j, k, l)| grid[[i, j]].f[k][l]),
            fi: Array4::from_shape_fn((h, w, 4, 4), |(i, j, k, l)| grid[[i, j]].fi[k][l]),
        })
    }

    pub fn is_uniform(&self) -> bool {
        self.f.shape()[0] == 1 && self.f.shape()[1] == 1
    }

    fn check_grid(&self, h: usize, w: usize) -> Result<()> {
        if self.is_uniform() || (self.f.shape()[0] == h && self.f.shape()[1] == w) {
            Ok(())
        } else {
            Err(Error::shape(format!(
                "layer grid {:?} does not match field grid ({}, {})",
                &self.f.shape()[..2],
                h,
                w
            )))
        }
    }

    fn matrix<'a>(&self, a: &'a Array4<C>) -> MatrixRef<'a> {
        if self.is_uniform() {
            MatrixRef::Uniform(a.slice(s![0, 0, .., ..]))
        } else {
            MatrixRef::PerPixel(a.view())
        }
    }

    /// Phase diagonals `exp(i k d alpha)` for every wavelength, shape
    /// `(wavelengths, h, w, 4)`.
    pub fn phase(&self, optics: &dyn LayerOptics, ks: &[f64], d: f64) -> Array4<C> {
        let (h, w, _) = self.alpha.dim();
        let mut out = Array4::zeros((ks.len(), h, w, 4));
        for (mut plane, &k) in out.outer_iter_mut().zip(ks) {
            Zip::from(plane.lanes_mut(Axis(2)))
                .and(self.alpha.lanes(Axis(2)))
                .for_each(|mut p, a| {
                    let diag = optics.phase_diagonal(&[a[0], a[1], a[2], a[3]], k * d);
                    for (pk, dk) in p.iter_mut().zip(diag) {
                        *pk = dk;
                    }
                });
        }
        out
    }

    /// Local transfer `f p fi` of every wavelength of `field`.
    pub fn transfer(&self, phase: &Array4<C>, field: &ArrayView4<C>) -> Result<Array4<C>> {
        let mut out = Array4::zeros(field.raw_dim());
        for (wl, mut plane) in out.outer_iter_mut().enumerate() {
            let p = if self.is_uniform() {
                DiagonalRef::Uniform(phase.slice(s![wl, 0, 0, ..]))
            } else {
                DiagonalRef::PerPixel(phase.index_axis(Axis(0), wl))
            };
            let res = dotmdmf(self.matrix(&self.f), p, self.matrix(&self.fi), &field.index_axis(Axis(0), wl))?;
            plane.assign(&res);
        }
        Ok(out)
    }
}

fn grid_of(field: &ArrayView4<C>) -> Result<(usize, usize)> {
    let shape = field.shape();
    if shape[1] != 4 {
        return Err(Error::shape(format!("field must have 4 components, got {}", shape[1])));
    }
    Ok((shape[2], shape[3]))
}

fn check_ks(field: &ArrayView4<C>, ks: &[f64]) -> Result<()> {
    if field.shape()[0] != ks.len() {
        return Err(Error::shape(format!(
            "field has {} wavelengths but {} wavenumbers were given",
            field.shape()[0],
            ks.len()
        )));
    }
    Ok(())
}

/// Element-wise product `a b` of two matrix stacks.
fn compose(a: &MatrixStack, b: &MatrixStack) -> Result<MatrixStack> {
    let mut out = MatrixStack::zeros(a.raw_dim());
    for (wl, mut plane) in out.outer_iter_mut().enumerate() {
        let ab = dotmm(
            MatrixRef::PerPixel(a.index_axis(Axis(0), wl)),
            MatrixRef::PerPixel(b.index_axis(Axis(0), wl)),
        )?;
        plane.assign(&ab);
    }
    Ok(out)
}

/// Advances `field` through one physical `layer`, diffracting through the
/// homogeneous `effective_layer`.
///
/// The layer thickness carries the traversal direction: for `d > 0` each
/// sub-step diffracts first and then applies the local transfer, for `d <= 0`
/// the order is reversed. In Jones mode `input_layer` adds the Fresnel
/// transmission from that medium into the effective layer, composed into the
/// first sub-step only. Previously computed `modes` of the same layer and
/// direction are reused when given; the modes used are returned.
#[allow(clippy::too_many_arguments)]
pub fn propagate_field_effective(
    ctx: &Context,
    field: &ArrayView4<C>,
    ks: &[f64],
    layer: &Layer,
    effective_layer: &HomogeneousLayer,
    input_layer: Option<&HomogeneousLayer>,
    modes: Option<LayerModes>,
    step: &StepOptions,
) -> Result<(Array4<C>, LayerModes)> {
    let shape = grid_of(field)?;
    check_ks(field, ks)?;
    let nsteps = step.nsteps.max(1);
    let d = layer.thickness / nsteps as f64;
    let d_eff = effective_layer.thickness / nsteps as f64;

    let modes = match modes {
        Some(modes) => modes,
        None => LayerModes::new(ctx.optics, layer, step.beta, step.phi, step.jones)?,
    };
    modes.check_grid(shape.0, shape.1)?;
    let phase = modes.phase(ctx.optics, ks, d);

    let dmat0 = if step.diffraction {
        Some(diffract::corrected_diffraction_matrix(
            ctx,
            shape,
            ks,
            step.beta,
            step.phi,
            d_eff,
            &effective_layer.epsv,
            &effective_layer.epsa,
            step.betamax,
            step.jones,
        )?)
    } else {
        None
    };
    let mut rmat = match input_layer {
        Some(input) if step.jones => Some(diffract::jones_transmission_matrix(
            ctx,
            shape,
            ks,
            (&input.epsv, &input.epsa),
            (&effective_layer.epsv, &effective_layer.epsa),
            step.betamax,
        )?),
        _ => None,
    };

    let mut field = field.to_owned();
    for _ in 0..nsteps {
        let dmat: Option<Arc<MatrixStack>> = match (rmat.take(), &dmat0) {
            (Some(r), Some(d0)) => Some(Arc::new(compose(d0, &r)?)),
            (Some(r), None) => Some(r),
            (None, d0) => d0.clone(),
        };
        field = match dmat {
            Some(dmat) if layer.thickness > 0.0 => {
                let diffracted = diffract(&field.view(), &dmat, None)?;
                modes.transfer(&phase, &diffracted.view())?
            }
            Some(dmat) => {
                let local = modes.transfer(&phase, &field.view())?;
                diffract(&local.view(), &dmat, None)?
            }
            None => modes.transfer(&phase, &field.view())?,
        };
    }
    Ok((field, modes))
}

/// Couples a Jones field from `layer_in` into `layer_out` at every frequency
/// bin.
pub fn transmit_jones(
    ctx: &Context,
    field: &ArrayView4<C>,
    ks: &[f64],
    layer_in: &HomogeneousLayer,
    layer_out: &HomogeneousLayer,
    betamax: Betamax,
) -> Result<Array4<C>> {
    let shape = grid_of(field)?;
    check_ks(field, ks)?;
    let dmat = diffract::jones_transmission_matrix(
        ctx,
        shape,
        ks,
        (&layer_in.epsv, &layer_in.epsa),
        (&layer_out.epsv, &layer_out.epsa),
        betamax,
    )?;
    diffract(field, &dmat, None)
}

/// Field-space Jones transmission from a homogeneous medium into a layer
/// voxel, embedded in the even slots.
fn input_coupler(optics: &dyn LayerOptics, input: &HomogeneousLayer, beta: f64, phi: f64, epsv: &[C; 3], epsa: &[f64; 3]) -> M4 {
    let fin = optics.eigen_decompose(beta, phi, &input.epsv, &input.epsa);
    let fout = optics.eigen_decompose(beta, phi, epsv, epsa);
    let t = optics.transmission_matrix(&fin.f, &fout.f, Direction::Forward);
    fresnel::jones_coupler(&t, &fin.f, &fout.f, Direction::Forward)
}

/// Transfers `field` through `layer` one plane wave at a time.
///
/// Every bin with `beta` inside the cutoff is synthesized as an elementary
/// wave from its Fourier coefficient, transferred with the eigenmodes of the
/// layer at that bin's direction and summed. With `input_layer` (Jones mode
/// only) the Fresnel transmission into the layer is composed during the first
/// sub-step.
#[allow(clippy::too_many_arguments)]
pub fn propagate_field_full(
    ctx: &Context,
    field: &ArrayView4<C>,
    ks: &[f64],
    layer: &Layer,
    input_layer: Option<&HomogeneousLayer>,
    nsteps: usize,
    jones: bool,
    betamax: Betamax,
) -> Result<Array4<C>> {
    let (h, w) = grid_of(field)?;
    check_ks(field, ks)?;
    if let Some((lh, lw)) = layer.grid() {
        if (lh, lw) != (h, w) {
            return Err(Error::shape(format!(
                "layer grid ({}, {}) does not match field grid ({}, {})",
                lh, lw, h, w
            )));
        }
    }
    let nsteps = nsteps.max(1);
    let d = layer.thickness / nsteps as f64;
    let optics = ctx.optics;

    let mut field = field.to_owned();
    for step in 0..nsteps {
        let input = if jones && step == 0 { input_layer } else { None };
        let mut out = Array4::zeros(field.raw_dim());
        for (wl, mut plane) in out.outer_iter_mut().enumerate() {
            let spectrum = fft2(&field.index_axis(Axis(0), wl));
            let (beta, phi) = betaphi((h, w), ks[wl]);
            let bins: Vec<(usize, usize)> = beta
                .indexed_iter()
                .filter(|(_, b)| betamax.keeps(**b))
                .map(|(ij, _)| ij)
                .collect();
            let sum = bins
                .par_iter()
                .map(|&(i, j)| -> Result<Array3<C>> {
                    let (b, p) = (beta[[i, j]], phi[[i, j]]);
                    let mut modes = LayerModes::new(optics, layer, b, p, jones)?;
                    if let Some(input) = input {
                        let coupler = LayerModes::from_fn(layer, |epsv, epsa| {
                            let mut m = Eigenmodes::zeros();
                            m.fi = input_coupler(optics, input, b, p, epsv, epsa);
                            m
                        })?;
                        modes.fi = couple(&modes.fi, &coupler.fi);
                    }
                    let phase = modes.phase(optics, &ks[wl..=wl], d);
                    let mut wave = Array3::zeros((4, h, w));
                    for (comp, mut slot) in wave.outer_iter_mut().enumerate() {
                        slot.assign(&eigenwave((h, w), i, j, spectrum[[comp, i, j]]));
                    }
                    let wave = wave.insert_axis(Axis(0));
                    let moved = modes.transfer(&phase, &wave.view())?;
                    Ok(moved.index_axis_move(Axis(0), 0))
                })
                .try_reduce(|| Array3::zeros((4, h, w)), |a, b| Ok(a + b))?;
            plane.assign(&sum);
        }
        field = out;
    }
    Ok(field)
}

/// Element-wise product `fi c` of two mode grids of the same layer.
fn couple(fi: &Array4<C>, coupler: &Array4<C>) -> Array4<C> {
    let at = |a: &Array4<C>, i: usize, j: usize| crate::linalg::load(&a.slice(s![i, j, .., ..]));
    crate::linalg::map_grid(fi.shape(), |i, j| mul4(&at(fi, i, j), &at(coupler, i, j)))
}
