//! Eigenmodes of a homogeneous anisotropic slab.
//!
//! **Context**: Inside a slab whose dielectric tensor does not vary along `z`,
//! a plane wave with transverse wavevector `(beta, phi)` is a superposition of
//! four eigenmodes. The tangential field `psi = (Ex, Hy, Ey, -Hx)` obeys
//! `d psi / dz = i k0 D psi`, where `D` is the Berreman matrix, and each
//! eigenvector of `D` propagates as `exp(i k0 alpha z)`.
//!
//! **How it Works**: [`BerremanOptics`] rotates the dielectric tensor into the
//! plane of incidence (so the transverse wavevector lies along `x`), builds
//! `D`, and solves it:
//! - decoupled tensors (no `y` coupling) split into two 2x2 blocks that are
//!   solved in closed form, which covers isotropic media exactly
//! - coupled tensors are solved numerically: the roots of the characteristic
//!   quartic give `alpha`, and a fully pivoted elimination of
//!   `D - alpha I` gives each eigenvector. Near-degenerate roots share a
//!   two-dimensional eigenspace split into p-like and s-like modes. Should
//!   that still fail, the `y` coupling is dropped and the closed form is used.
//!
//! Modes are ordered forward `(0, 2)` and backward `(1, 3)`, with the p-like
//! mode before the s-like one, normalized to unit Poynting flux and rotated
//! back to the lab frame.

use nalgebra::{Matrix3, Matrix4, Rotation3, Vector3};
use num_complex::Complex64;

use crate::linalg::{dotmr2, embed_even, inv2, inv4, M4};

type C = Complex64;


/// Traversal direction through the stack and incidence side at an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    /// Direction of pass `i`: even passes go forward.
    pub fn of_pass(i: usize) -> Self {
        if i % 2 == 0 {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Backward => -1.0,
        }
    }
}

/// Propagation constants `alpha`, the mode matrix `f` (columns are the mode
/// fields) and its inverse `fi`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Eigenmodes {
    pub alpha: [C; 4],
    pub f: M4,
    pub fi: M4,
}

impl Eigenmodes {
    /// Modes of a masked-out frequency bin.
    pub fn zeros() -> Self {
        let z = C::new(0.0, 0.0);
        Eigenmodes {
            alpha: [z; 4],
            f: [[z; 4]; 4],
            fi: [[z; 4]; 4],
        }
    }
}

/// Layer eigenmode capability used by the propagation engine.
pub trait LayerOptics: Send + Sync {
    /// Eigenmodes of a homogeneous slab with principal dielectric values
    /// `epsv` and frame angles `epsa = (yaw, theta, phi)`.
    fn eigen_decompose(&self, beta: f64, phi: f64, epsv: &[C; 3], epsa: &[f64; 3]) -> Eigenmodes;

    /// Jones analogue: the electric block of the forward modes and its inverse,
    /// embedded in the even rows and columns.
    fn jones_eigen_decompose(&self, beta: f64, phi: f64, epsv: &[C; 3], epsa: &[f64; 3]) -> Eigenmodes {
        jones_modes(&self.eigen_decompose(beta, phi, epsv, epsa))
    }

    /// `exp(i kd alpha)` for every mode.
    fn phase_diagonal(&self, alpha: &[C; 4], kd: f64) -> [C; 4] {
        alpha.map(|a| (C::new(0.0, kd) * a).exp())
    }

    /// Mode-space coupler between two eigenmode bases.
    fn transmission_matrix(&self, fin: &M4, fout: &M4, direction: Direction) -> M4 {
        crate::fresnel::transmission_matrix(fin, fout, direction)
    }
}

/// Jones modes from full eigenmodes.
pub fn jones_modes(modes: &Eigenmodes) -> Eigenmodes {
    let j = [[modes.f[0][0], modes.f[0][2]], [modes.f[2][0], modes.f[2][2]]];
    Eigenmodes {
        alpha: modes.alpha,
        f: embed_even(&j),
        fi: embed_even(&inv2(&j)),
    }
}

/// Berreman 4x4 solver.
#[derive(Debug, Clone, Copy, Default)]
pub struct BerremanOptics;

impl LayerOptics for BerremanOptics {
    fn eigen_decompose(&self, beta: f64, phi: f64, epsv: &[C; 3], epsa: &[f64; 3]) -> Eigenmodes {
        let eps = rotated_tensor(epsv, epsa, phi);
        if !is_decoupled(&eps) {
            if let Some(modes) = coupled_modes(beta, &eps).map(|(alpha, local)| lab_frame(alpha, &local, phi)) {
                if is_finite(&modes) {
                    return modes;
                }
            }
        }
        let (alpha, local) = decoupled_modes(beta, &eps);
        lab_frame(alpha, &local, phi)
    }
}

fn lab_frame(alpha: [C; 4], local: &M4, phi: f64) -> Eigenmodes {
    let f = dotmr2(local, (phi.cos(), phi.sin()));
    let fi = inv4(&f);
    Eigenmodes { alpha, f, fi }
}

fn is_finite(modes: &Eigenmodes) -> bool {
    modes.alpha.iter().all(|v| v.is_finite())
        && modes.f.iter().chain(modes.fi.iter()).flatten().all(|v| v.is_finite())
}

/// Rotation of the dielectric frame, `Rz(phi) Ry(theta) Rz(yaw)`.
pub fn rotation_matrix(epsa: &[f64; 3]) -> Matrix3<f64> {
    let [yaw, theta, phi] = *epsa;
    let rz = |a: f64| Rotation3::from_axis_angle(&Vector3::z_axis(), a);
    let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), theta);
    (rz(phi) * ry * rz(yaw)).into_inner()
}

/// Dielectric tensor in the frame where the transverse wavevector, at azimuth
/// `phi`, lies along `x`.
pub fn rotated_tensor(epsv: &[C; 3], epsa: &[f64; 3], phi: f64) -> Matrix3<C> {
    let frame = Rotation3::from_axis_angle(&Vector3::z_axis(), -phi).into_inner() * rotation_matrix(epsa);
    Matrix3::from_fn(|i, j| {
        (0..3).fold(C::new(0.0, 0.0), |acc, k| acc + epsv[k] * frame[(i, k)] * frame[(j, k)])
    })
}

/// Berreman matrix for a transverse wavevector `beta` along `x`.
pub fn berreman_matrix(beta: f64, eps: &Matrix3<C>) -> Matrix4<C> {
    let (xx, xy, xz) = (eps[(0, 0)], eps[(0, 1)], eps[(0, 2)]);
    let (yx, yy, yz) = (eps[(1, 0)], eps[(1, 1)], eps[(1, 2)]);
    let (zx, zy, zz) = (eps[(2, 0)], eps[(2, 1)], eps[(2, 2)]);
    let b = C::new(beta, 0.0);
    let zero = C::new(0.0, 0.0);
    let one = C::new(1.0, 0.0);
    Matrix4::new(
        -b * zx / zz, one - b * b / zz, -b * zy / zz, zero,
        xx - xz * zx / zz, -xz * b / zz, xy - xz * zy / zz, zero,
        zero, zero, zero, one,
        yx - yz * zx / zz, -yz * b / zz, yy - yz * zy / zz - b * b, zero,
    )
}

fn is_decoupled(eps: &Matrix3<C>) -> bool {
    let scale = eps.iter().map(|v| v.norm()).fold(0.0, f64::max).max(1.0);
    let tol = 1e-13 * scale;
    [eps[(0, 1)], eps[(1, 0)], eps[(1, 2)], eps[(2, 1)]]
        .iter()
        .all(|v| v.norm() <= tol)
}

/// Decaying (or, when lossless, positive) propagation along `+z`.
fn is_forward(alpha: C) -> bool {
    let tol = 1e-7 * (1.0 + alpha.norm());
    if alpha.im.abs() > tol {
        alpha.im > 0.0
    } else {
        alpha.re >= 0.0
    }
}

/// Orders two roots as `(forward, backward)`.
fn order_pair(a: C, b: C) -> (C, C) {
    match (is_forward(a), is_forward(b)) {
        (true, false) => (a, b),
        (false, true) => (b, a),
        _ => {
            if a.re + a.im >= b.re + b.im {
                (a, b)
            } else {
                (b, a)
            }
        }
    }
}

/// Scales a mode so that its (unconjugated) flux `psi0 psi1 + psi2 psi3` is
/// `+1` for forward and `-1` for backward modes. For lossless propagating
/// modes this is unit Poynting flux with a fixed phase.
fn normalize(v: [C; 4], forward: bool) -> [C; 4] {
    let p = v[0] * v[1] + v[2] * v[3];
    let p = if forward { p } else { -p };
    let norm = v.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    let scale = if p.norm() > 1e-14 * norm * norm {
        C::new(1.0, 0.0) / p.sqrt()
    } else if norm > 0.0 {
        C::new(1.0 / norm, 0.0)
    } else {
        C::new(0.0, 0.0)
    };
    v.map(|c| c * scale)
}

fn set_column(f: &mut M4, k: usize, v: [C; 4]) {
    for (i, c) in v.into_iter().enumerate() {
        f[i][k] = c;
    }
}

/// Closed-form modes of a tensor without `y` coupling. The p block acts on
/// `(Ex, Hy)`, the s block on `(Ey, -Hx)`.
fn decoupled_modes(beta: f64, eps: &Matrix3<C>) -> ([C; 4], M4) {
    let delta = berreman_matrix(beta, eps);
    let zero = C::new(0.0, 0.0);
    let mut f = [[zero; 4]; 4];

    let (a, b, c, d) = (delta[(0, 0)], delta[(0, 1)], delta[(1, 0)], delta[(1, 1)]);
    let mean = (a + d) / 2.0;
    let disc = (((a - d) / 2.0).powi(2) + b * c).sqrt();
    let (pf, pb) = order_pair(mean + disc, mean - disc);
    for (k, lambda, forward) in [(0, pf, true), (1, pb, false)] {
        let (u0, u1) = (b, lambda - a);
        let (w0, w1) = (lambda - d, c);
        let v = if u0.norm() + u1.norm() >= w0.norm() + w1.norm() {
            [u0, u1, zero, zero]
        } else {
            [w0, w1, zero, zero]
        };
        set_column(&mut f, k, normalize(v, forward));
    }

    let alpha = (delta[(3, 2)]).sqrt();
    let (sf, sb) = order_pair(alpha, -alpha);
    set_column(&mut f, 2, normalize([zero, zero, C::new(1.0, 0.0), sf], true));
    set_column(&mut f, 3, normalize([zero, zero, C::new(1.0, 0.0), sb], false));
    ([pf, pb, sf, sb], f)
}

/// Numerical modes of a coupled tensor.
fn coupled_modes(beta: f64, eps: &Matrix3<C>) -> Option<([C; 4], M4)> {
    let delta = berreman_matrix(beta, eps);
    let eigenvalues = quartic_roots(&characteristic_polynomial(&delta))?;
    let mut forward: Vec<C> = Vec::with_capacity(2);
    let mut backward: Vec<C> = Vec::with_capacity(2);
    for &l in eigenvalues.iter() {
        if is_forward(l) {
            forward.push(l);
        } else {
            backward.push(l);
        }
    }
    if forward.len() != 2 {
        let mut all = eigenvalues.to_vec();
        all.sort_by(|x, y| (y.re + y.im).total_cmp(&(x.re + x.im)));
        forward = all[..2].to_vec();
        backward = all[2..].to_vec();
    }

    let zero = C::new(0.0, 0.0);
    let mut f = [[zero; 4]; 4];
    let mut alpha = [zero; 4];
    for (pair, is_fwd, slots) in [(&forward, true, (0, 2)), (&backward, false, (1, 3))] {
        let ((lp, p), (ls, s)) = mode_pair(&delta, pair[0], pair[1])?;
        alpha[slots.0] = lp;
        alpha[slots.1] = ls;
        set_column(&mut f, slots.0, normalize(p, is_fwd));
        set_column(&mut f, slots.1, normalize(s, is_fwd));
    }
    Some((alpha, f))
}

/// Coefficients `c[0] + c[1] x + c[2] x^2 + c[3] x^3 + x^4` of
/// `det(x I - m)`, by the Faddeev-LeVerrier recursion.
fn characteristic_polynomial(m: &Matrix4<C>) -> [C; 5] {
    let mut c = [C::new(0.0, 0.0); 5];
    c[4] = C::new(1.0, 0.0);
    let mut aux = Matrix4::<C>::zeros();
    for k in 1..=4 {
        aux = m * aux + Matrix4::from_diagonal_element(c[5 - k]);
        c[4 - k] = -(m * aux).trace() / k as f64;
    }
    c
}

/// Value, first and second derivative of the polynomial `c` at `x`.
fn horner(c: &[C; 5], x: C) -> (C, C, C) {
    let zero = C::new(0.0, 0.0);
    let (mut p, mut dp, mut ddp) = (zero, zero, zero);
    for &a in c.iter().rev() {
        ddp = ddp * x + dp * 2.0;
        dp = dp * x + p;
        p = p * x + a;
    }
    (p, dp, ddp)
}

/// Roots of a monic quartic by simultaneous Durand-Kerner iteration. Pairs
/// of nearly equal roots are re-split around the nearby root of the
/// derivative, `m +- sqrt(-2 p(m) / p''(m))`; the others get a Newton polish.
fn quartic_roots(c: &[C; 5]) -> Option<[C; 4]> {
    let radius = 1.0 + c[..4].iter().map(|a| a.norm()).fold(0.0, f64::max);
    let seed = C::new(0.4, 0.9);
    let mut z = [0, 1, 2, 3].map(|k| seed.powi(k) * radius);
    for _ in 0..500 {
        let mut largest = 0.0f64;
        for i in 0..4 {
            let (p, _, _) = horner(c, z[i]);
            let d = (0..4)
                .filter(|&j| j != i)
                .fold(C::new(1.0, 0.0), |acc, j| acc * (z[i] - z[j]));
            if d.norm() == 0.0 {
                continue;
            }
            let step = p / d;
            z[i] -= step;
            largest = largest.max(step.norm());
        }
        if largest <= 1e-12 * radius {
            break;
        }
    }

    let mut clustered = [false; 4];
    for i in 0..4 {
        for j in i + 1..4 {
            if clustered[i] || clustered[j] || (z[i] - z[j]).norm() > 1e-4 * (1.0 + z[i].norm()) {
                continue;
            }
            let mut m = (z[i] + z[j]) / 2.0;
            for _ in 0..3 {
                let (_, dp, ddp) = horner(c, m);
                if ddp.norm() > 0.0 {
                    m -= dp / ddp;
                }
            }
            let (p, _, ddp) = horner(c, m);
            let half = if ddp.norm() > 0.0 {
                (-p * 2.0 / ddp).sqrt()
            } else {
                C::new(0.0, 0.0)
            };
            z[i] = m + half;
            z[j] = m - half;
            clustered[i] = true;
            clustered[j] = true;
        }
    }
    for (root, _) in z.iter_mut().zip(clustered).filter(|(_, done)| !*done) {
        for _ in 0..2 {
            let (p, dp, _) = horner(c, *root);
            if dp.norm() > 1e-12 * radius {
                *root -= p / dp;
            }
        }
    }
    z.iter().all(|r| r.is_finite()).then_some(z)
}

type Mode = (C, [C; 4]);

/// Eigenvectors of two roots, returned as `(p-like, s-like)`. Roots closer
/// than `1e-6` (relative) share a two-dimensional eigenspace.
fn mode_pair(delta: &Matrix4<C>, l1: C, l2: C) -> Option<(Mode, Mode)> {
    let degenerate = (l1 - l2).norm() <= 1e-6 * (1.0 + l1.norm());
    let (u, v) = if degenerate {
        let basis = null_vectors(delta, (l1 + l2) / 2.0, 2)?;
        let (u, v) = (basis[0], basis[1]);
        // combinations without Ey and without Ex
        let p = [0, 1, 2, 3].map(|i| v[2] * u[i] - u[2] * v[i]);
        let s = [0, 1, 2, 3].map(|i| v[0] * u[i] - u[0] * v[i]);
        (p, s)
    } else {
        (null_vectors(delta, l1, 1)?[0], null_vectors(delta, l2, 1)?[0])
    };
    let weight = |x: &[C; 4]| (x[0].norm_sqr() + x[1].norm_sqr(), x[2].norm_sqr() + x[3].norm_sqr());
    let (up, us) = weight(&u);
    let (vp, vs) = weight(&v);
    if up * vs >= vp * us {
        Some(((l1, u), (l2, v)))
    } else {
        Some(((l2, v), (l1, u)))
    }
}

/// Basis of the `count`-dimensional null space of `delta - lambda I`, by
/// Gaussian elimination with full pivoting down to rank `4 - count`.
fn null_vectors(delta: &Matrix4<C>, lambda: C, count: usize) -> Option<Vec<[C; 4]>> {
    let m = delta - Matrix4::from_diagonal_element(lambda);
    let mut a = [0, 1, 2, 3].map(|i| [0, 1, 2, 3].map(|j| m[(i, j)]));
    let mut perm = [0, 1, 2, 3];
    let rank = 4 - count;
    for k in 0..rank {
        let mut pivot = (0.0, k, k);
        for (i, row) in a.iter().enumerate().skip(k) {
            for (j, v) in row.iter().enumerate().skip(k) {
                if v.norm() > pivot.0 {
                    pivot = (v.norm(), i, j);
                }
            }
        }
        let (size, pi, pj) = pivot;
        if size == 0.0 {
            return None;
        }
        a.swap(k, pi);
        for row in a.iter_mut() {
            row.swap(k, pj);
        }
        perm.swap(k, pj);
        for i in k + 1..4 {
            let factor = a[i][k] / a[k][k];
            for j in k..4 {
                let v = a[k][j];
                a[i][j] -= factor * v;
            }
        }
    }
    let vectors = (rank..4)
        .map(|free| {
            let mut y = [C::new(0.0, 0.0); 4];
            y[free] = C::new(1.0, 0.0);
            for k in (0..rank).rev() {
                let s = (k + 1..4).fold(C::new(0.0, 0.0), |acc, j| acc + a[k][j] * y[j]);
                y[k] = -s / a[k][k];
            }
            let mut x = [C::new(0.0, 0.0); 4];
            for (i, &p) in perm.iter().enumerate() {
                x[p] = y[i];
            }
            x
        })
        .collect();
    Some(vectors)
}
