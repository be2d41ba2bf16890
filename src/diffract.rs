//! Diffraction, projection and correction matrices.
//!
//! **Context**: Free propagation through a homogeneous slab is diagonal in
//! the transverse Fourier domain. For every FFT bin `(beta, phi)` the slab's
//! eigenmodes give a 4x4 matrix `f exp(i k d alpha) fi` that advances the
//! plane wave of that bin. Bins with `beta >= betamax` are discarded.
//!
//! **How it Works**: Every builder evaluates the layer eigenmodes per bin and
//! per wavelength, combines them into a matrix grid of shape
//! `(wavelengths, height, width, 4, 4)` and stores it in a [`MatrixCache`]
//! under its full parameter tuple. Jones matrices use the same 4x4 layout with
//! only the even rows and columns populated.

use std::f64::consts::PI;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::Array5;
use num_complex::Complex64;
use serde::Deserialize;

use crate::cache::{MatrixCache, MatrixKey, MatrixKind, MatrixStack};
use crate::error::{Error, Result};
use crate::fresnel;
use crate::linalg::{inv2, map_grid, mul2, mul4, mul4d, M4};
use crate::optics::{BerremanOptics, Direction, Eigenmodes, LayerOptics};
use crate::wave::betaphi;

type C = Complex64;


/// Which half of the mode spectrum a matrix keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Mode {
    /// Forward modes only.
    #[serde(rename = "t")]
    Transmitted,
    /// Backward modes only.
    #[serde(rename = "r")]
    Reflected,
    /// All modes.
    #[serde(rename = "b")]
    Both,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "t" => Ok(Mode::Transmitted),
            "r" => Ok(Mode::Reflected),
            "b" => Ok(Mode::Both),
            other => Err(Error::UnknownVariant {
                kind: "mode",
                value: other.to_string(),
            }),
        }
    }
}

impl Mode {
    fn tag(&self) -> u64 {
        match self {
            Mode::Transmitted => 0,
            Mode::Reflected => 1,
            Mode::Both => 2,
        }
    }
}

/// Cutoff on `beta` above which plane waves are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub enum Betamax {
    /// Keep every bin.
    Unlimited,
    /// Discard bins with `beta >= value`.
    Hard(f64),
    /// Discard bins with `beta >= end` and taper the mode fields with a Tukey
    /// window between `start` and `end`.
    Tapered { start: f64, end: f64 },
}

impl Default for Betamax {
    fn default() -> Self {
        Betamax::Hard(crate::settings::BETAMAX)
    }
}

impl Betamax {
    pub fn cutoff(&self) -> f64 {
        match *self {
            Betamax::Unlimited => f64::INFINITY,
            Betamax::Hard(b) => b,
            Betamax::Tapered { end, .. } => end,
        }
    }

    pub fn keeps(&self, beta: f64) -> bool {
        beta < self.cutoff()
    }

    /// Taper factor at `beta`; `1` everywhere for a hard cutoff.
    pub fn window(&self, beta: f64) -> f64 {
        match *self {
            Betamax::Tapered { start, end } => tukey(beta, (end - start) / end, end),
            _ if self.keeps(beta) => 1.0,
            _ => 0.0,
        }
    }

    fn key(&self, key: MatrixKey) -> MatrixKey {
        match *self {
            Betamax::Unlimited => key.tag(0),
            Betamax::Hard(b) => key.tag(1).float(b),
            Betamax::Tapered { start, end } => key.tag(2).float(start).float(end),
        }
    }
}

/// Tukey window of radius `rmax` with cosine fraction `alpha`.
pub fn tukey(r: f64, alpha: f64, rmax: f64) -> f64 {
    let flat = rmax * (1.0 - alpha);
    if r < flat {
        1.0
    } else if r < rmax {
        0.5 * (1.0 + (PI * (r - flat) / (alpha * rmax)).cos())
    } else {
        0.0
    }
}

/// Layer optics and matrix cache used by the builders.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub optics: &'a dyn LayerOptics,
    pub cache: &'a MatrixCache,
}

impl<'a> Context<'a> {
    pub fn new(optics: &'a dyn LayerOptics, cache: &'a MatrixCache) -> Self {
        Context { optics, cache }
    }
}

impl Default for Context<'static> {
    fn default() -> Self {
        Context {
            optics: &BerremanOptics,
            cache: MatrixCache::global(),
        }
    }
}

impl std::fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("cache", self.cache).finish()
    }
}

/// `exp(i kd alpha)`, with backward slots zeroed for [`Mode::Transmitted`] and
/// forward slots zeroed for [`Mode::Reflected`].
pub fn phase_matrix(optics: &dyn LayerOptics, alpha: &[C; 4], kd: f64, mode: Mode) -> [C; 4] {
    let mut p = optics.phase_diagonal(alpha, kd);
    let zero = C::new(0.0, 0.0);
    match mode {
        Mode::Transmitted => {
            p[1] = zero;
            p[3] = zero;
        }
        Mode::Reflected => {
            p[0] = zero;
            p[2] = zero;
        }
        Mode::Both => {}
    }
    p
}

/// Eigenmodes of a homogeneous layer at one frequency bin, masked beyond the
/// cutoff and tapered when requested.
fn bin_modes(
    optics: &dyn LayerOptics,
    beta: f64,
    phi: f64,
    epsv: &[C; 3],
    epsa: &[f64; 3],
    betamax: Betamax,
    jones: bool,
) -> Eigenmodes {
    if !betamax.keeps(beta) {
        return Eigenmodes::zeros();
    }
    let mut modes = if jones {
        optics.jones_eigen_decompose(beta, phi, epsv, epsa)
    } else {
        optics.eigen_decompose(beta, phi, epsv, epsa)
    };
    let w = betamax.window(beta);
    if w != 1.0 {
        for row in modes.f.iter_mut() {
            for v in row.iter_mut() {
                *v *= w;
            }
        }
    }
    modes
}

/// Eigenmodes `(alpha, f, fi)` of a homogeneous layer for every bin of every
/// wavelength; bins beyond the cutoff are zero.
pub fn diffraction_alphaffi(
    optics: &dyn LayerOptics,
    shape: (usize, usize),
    ks: &[f64],
    epsv: &[C; 3],
    epsa: &[f64; 3],
    betamax: Betamax,
) -> Vec<ndarray::Array2<Eigenmodes>> {
    ks.iter()
        .map(|&k| {
            let (beta, phi) = betaphi(shape, k);
            ndarray::Zip::from(&beta)
                .and(&phi)
                .par_map_collect(|&b, &p| bin_modes(optics, b, p, epsv, epsa, betamax, false))
        })
        .collect()
}

/// Builds a matrix stack from a per-bin closure `f(wavelength, beta, phi)`.
fn grid_stack<F>(shape: (usize, usize), ks: &[f64], f: F) -> MatrixStack
where
    F: Fn(usize, f64, f64) -> M4 + Sync,
{
    let (h, w) = shape;
    let mut out = Array5::zeros((ks.len(), h, w, 4, 4));
    for (wl, (&k, mut plane)) in ks.iter().zip(out.outer_iter_mut()).enumerate() {
        let (beta, phi) = betaphi(shape, k);
        let grid = map_grid(&[h, w], |i, j| f(wl, beta[[i, j]], phi[[i, j]]));
        plane.assign(&grid);
    }
    out
}

fn layer_key(key: MatrixKey, ks: &[f64], epsv: &[C; 3], epsa: &[f64; 3], betamax: Betamax) -> MatrixKey {
    betamax.key(key.floats(ks).complex(epsv).floats(epsa))
}

fn check_ks(ks: &[f64]) -> Result<()> {
    if ks.is_empty() {
        return Err(Error::parameter("wavenumbers", "at least one wavenumber is required"));
    }
    Ok(())
}

/// Matrix that propagates every plane wave through a homogeneous slab of
/// thickness `d` and keeps the modes selected by `mode`.
#[allow(clippy::too_many_arguments)]
pub fn diffraction_matrix(
    ctx: &Context,
    shape: (usize, usize),
    ks: &[f64],
    d: f64,
    epsv: &[C; 3],
    epsa: &[f64; 3],
    mode: Mode,
    betamax: Betamax,
) -> Result<Arc<MatrixStack>> {
    check_ks(ks)?;
    let key = layer_key(MatrixKey::new(MatrixKind::Diffraction, shape).float(d), ks, epsv, epsa, betamax)
        .tag(mode.tag());
    ctx.cache.get_or_try_insert(key, || {
        Ok(grid_stack(shape, ks, |wl, beta, phi| {
            let m = bin_modes(ctx.optics, beta, phi, epsv, epsa, betamax, false);
            let p = phase_matrix(ctx.optics, &m.alpha, ks[wl] * d, mode);
            mul4(&mul4d(&m.f, &p), &m.fi)
        }))
    })
}

/// Projection onto the modes selected by `mode`, a diffraction matrix of zero
/// thickness.
pub fn projection_matrix(
    ctx: &Context,
    shape: (usize, usize),
    ks: &[f64],
    epsv: &[C; 3],
    epsa: &[f64; 3],
    mode: Mode,
    betamax: Betamax,
) -> Result<Arc<MatrixStack>> {
    check_ks(ks)?;
    let key = layer_key(MatrixKey::new(MatrixKind::Projection, shape), ks, epsv, epsa, betamax).tag(mode.tag());
    ctx.cache.get_or_try_insert(key, || {
        Ok(grid_stack(shape, ks, |_, beta, phi| {
            let m = bin_modes(ctx.optics, beta, phi, epsv, epsa, betamax, false);
            let p = phase_matrix(ctx.optics, &m.alpha, 0.0, mode);
            mul4(&mul4d(&m.f, &p), &m.fi)
        }))
    })
}

/// Jones analogue of [`diffraction_matrix`] for forward propagation.
pub fn jones_diffraction_matrix(
    ctx: &Context,
    shape: (usize, usize),
    ks: &[f64],
    d: f64,
    epsv: &[C; 3],
    epsa: &[f64; 3],
    betamax: Betamax,
) -> Result<Arc<MatrixStack>> {
    check_ks(ks)?;
    let key = layer_key(MatrixKey::new(MatrixKind::JonesDiffraction, shape).float(d), ks, epsv, epsa, betamax);
    ctx.cache.get_or_try_insert(key, || {
        Ok(grid_stack(shape, ks, |wl, beta, phi| {
            let m = bin_modes(ctx.optics, beta, phi, epsv, epsa, betamax, true);
            let p = phase_matrix(ctx.optics, &m.alpha, ks[wl] * d, Mode::Transmitted);
            mul4(&mul4d(&m.f, &p), &m.fi)
        }))
    })
}

/// Per-bin Jones transmission of forward light from the `input` medium into
/// the `output` medium, each given as `(epsv, epsa)`.
pub fn jones_transmission_matrix(
    ctx: &Context,
    shape: (usize, usize),
    ks: &[f64],
    input: (&[C; 3], &[f64; 3]),
    output: (&[C; 3], &[f64; 3]),
    betamax: Betamax,
) -> Result<Arc<MatrixStack>> {
    check_ks(ks)?;
    let key = layer_key(
        MatrixKey::new(MatrixKind::JonesTransmission, shape)
            .complex(input.0)
            .floats(input.1),
        ks,
        output.0,
        output.1,
        betamax,
    );
    ctx.cache.get_or_try_insert(key, || {
        Ok(grid_stack(shape, ks, |_, beta, phi| {
            if !betamax.keeps(beta) {
                return [[C::new(0.0, 0.0); 4]; 4];
            }
            let fin = ctx.optics.eigen_decompose(beta, phi, input.0, input.1);
            let fout = ctx.optics.eigen_decompose(beta, phi, output.0, output.1);
            let t = ctx.optics.transmission_matrix(&fin.f, &fout.f, Direction::Forward);
            let j = fresnel::jones_coupler(&t, &fin.f, &fout.f, Direction::Forward);
            let w = betamax.window(beta);
            j.map(|row| row.map(|v| v * w))
        }))
    })
}

/// Single matrix per wavelength, `f exp(-i k d alpha) fi` at the ray
/// direction, that removes the homogeneous phase of the effective layer.
/// Stored with a `(1, 1)` grid.
pub fn correction_matrix(
    ctx: &Context,
    beta: f64,
    phi: f64,
    ks: &[f64],
    d: f64,
    epsv: &[C; 3],
    epsa: &[f64; 3],
) -> Result<Arc<MatrixStack>> {
    correction(ctx, beta, phi, ks, d, epsv, epsa, false)
}

/// Jones analogue of [`correction_matrix`].
pub fn jones_correction_matrix(
    ctx: &Context,
    beta: f64,
    phi: f64,
    ks: &[f64],
    d: f64,
    epsv: &[C; 3],
    epsa: &[f64; 3],
) -> Result<Arc<MatrixStack>> {
    correction(ctx, beta, phi, ks, d, epsv, epsa, true)
}

#[allow(clippy::too_many_arguments)]
fn correction(
    ctx: &Context,
    beta: f64,
    phi: f64,
    ks: &[f64],
    d: f64,
    epsv: &[C; 3],
    epsa: &[f64; 3],
    jones: bool,
) -> Result<Arc<MatrixStack>> {
    check_ks(ks)?;
    let kind = if jones {
        MatrixKind::JonesCorrection
    } else {
        MatrixKind::Correction
    };
    let key = MatrixKey::new(kind, (1, 1))
        .float(beta)
        .float(phi)
        .float(d)
        .floats(ks)
        .complex(epsv)
        .floats(epsa);
    ctx.cache.get_or_try_insert(key, || {
        let m = if jones {
            ctx.optics.jones_eigen_decompose(beta, phi, epsv, epsa)
        } else {
            ctx.optics.eigen_decompose(beta, phi, epsv, epsa)
        };
        let mut out = Array5::zeros((ks.len(), 1, 1, 4, 4));
        for (wl, &k) in ks.iter().enumerate() {
            let p = ctx.optics.phase_diagonal(&m.alpha, -k * d);
            let c = mul4(&mul4d(&m.f, &p), &m.fi);
            for (i, row) in c.iter().enumerate() {
                for (j, v) in row.iter().enumerate() {
                    out[[wl, 0, 0, i, j]] = *v;
                }
            }
        }
        Ok(out)
    })
}

/// Diffraction matrix of the effective layer combined with its correction at
/// the ray direction: `C D` for `d > 0` and `D C` otherwise.
///
/// The correction always acts next to the local transfer of the physical
/// layer, so for a homogeneous layer the step reduces to `D` at every bin.
#[allow(clippy::too_many_arguments)]
pub fn corrected_diffraction_matrix(
    ctx: &Context,
    shape: (usize, usize),
    ks: &[f64],
    beta: f64,
    phi: f64,
    d: f64,
    epsv: &[C; 3],
    epsa: &[f64; 3],
    betamax: Betamax,
    jones: bool,
) -> Result<Arc<MatrixStack>> {
    check_ks(ks)?;
    let kind = if jones {
        MatrixKind::CorrectedJonesDiffraction
    } else {
        MatrixKind::CorrectedDiffraction
    };
    let key = layer_key(
        MatrixKey::new(kind, shape).float(beta).float(phi).float(d),
        ks,
        epsv,
        epsa,
        betamax,
    );
    ctx.cache.get_or_try_insert(key, || {
        let (dmat, cmat) = if jones {
            (
                jones_diffraction_matrix(ctx, shape, ks, d, epsv, epsa, betamax)?,
                jones_correction_matrix(ctx, beta, phi, ks, d, epsv, epsa)?,
            )
        } else {
            (
                diffraction_matrix(ctx, shape, ks, d, epsv, epsa, Mode::Both, betamax)?,
                correction_matrix(ctx, beta, phi, ks, d, epsv, epsa)?,
            )
        };
        let mut out = Array5::zeros(dmat.raw_dim());
        for wl in 0..ks.len() {
            let c = crate::linalg::load(&cmat.slice(ndarray::s![wl, 0, 0, .., ..]));
            let grid = map_grid(&[shape.0, shape.1], |i, j| {
                let dm = crate::linalg::load(&dmat.slice(ndarray::s![wl, i, j, .., ..]));
                if d > 0.0 {
                    mul4(&c, &dm)
                } else {
                    mul4(&dm, &c)
                }
            });
            out.index_axis_mut(ndarray::Axis(0), wl).assign(&grid);
        }
        Ok(out)
    })
}

/// Per-bin matrix that completes a Jones field `(Ex, -, Ey, -)` with the
/// magnetic components of forward waves in an isotropic medium of index `n`.
/// The electric components pass unchanged; bins beyond the cutoff get no
/// magnetic part.
pub fn jones2h_matrix(
    ctx: &Context,
    shape: (usize, usize),
    ks: &[f64],
    n: f64,
    betamax: Betamax,
) -> Result<Arc<MatrixStack>> {
    check_ks(ks)?;
    let key = betamax.key(MatrixKey::new(MatrixKind::Jones2H, shape).float(n).floats(ks));
    let eps = [C::new(n * n, 0.0); 3];
    ctx.cache.get_or_try_insert(key, || {
        Ok(grid_stack(shape, ks, |_, beta, phi| {
            let one = C::new(1.0, 0.0);
            let zero = C::new(0.0, 0.0);
            let mut out = [[zero; 4]; 4];
            out[0][0] = one;
            out[2][2] = one;
            if !betamax.keeps(beta) {
                return out;
            }
            let m = ctx.optics.eigen_decompose(beta, phi, &eps, &[0.0; 3]);
            let a = [[m.f[0][0], m.f[0][2]], [m.f[2][0], m.f[2][2]]];
            let b = [[m.f[1][0], m.f[1][2]], [m.f[3][0], m.f[3][2]]];
            let dm = mul2(&b, &inv2(&a));
            out[1][0] = dm[0][0];
            out[1][2] = dm[0][1];
            out[3][0] = dm[1][0];
            out[3][2] = dm[1][1];
            out
        }))
    })
}
