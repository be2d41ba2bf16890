//! Dense 4x4 complex linear algebra on single matrices, per-pixel matrix grids
//! and 4-component fields.
//!
//! Layouts:
//! - single matrix: `Array2`, shape `(4, 4)`
//! - matrix grid: `Array4`, shape `(height, width, 4, 4)`, one matrix per pixel
//!   or per frequency bin
//! - diagonal: `Array1`, shape `(4,)`; diagonal grid: `Array3`, `(height, width, 4)`
//! - field: `Array3`, shape `(4, height, width)`
//!
//! Every function checks that the matrix dimension is at least 4 and returns
//! [`Error::InvalidShape`] otherwise. Batched operations are data parallel over
//! the pixel grid.

use ndarray::{
    s, Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3, ArrayView4, Axis, Zip,
};
use num_complex::Complex64;
use rayon::prelude::*;

use crate::error::{Error, Result};

pub type C = Complex64;
/// Fixed 4x4 block used in the inner loops.
pub type M4 = [[C; 4]; 4];
/// Fixed 4-vector used in the inner loops.
pub type V4 = [C; 4];

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_matrix(rng: &mut impl Rng) -> Array2<C> {
        Array2::from_shape_fn((4, 4), |_| {
            C::new(rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0))
        })
    }

    fn random_grid(rng: &mut impl Rng, h: usize, w: usize) -> Array4<C> {
        Array4::from_shape_fn((h, w, 4, 4), |_| {
            C::new(rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0))
        })
    }

    fn max_abs_diff<D: ndarray::Dimension>(a: &ndarray::Array<C, D>, b: &ndarray::Array<C, D>) -> f64 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).norm())
            .fold(0.0, f64::max)
    }

    #[test]
    fn inverse_of_identity() {
        let eye = Array2::<C>::eye(4);
        let inv = inv4x4(&eye.view()).unwrap();
        assert!(max_abs_diff(&inv, &eye) < 1e-14);
    }

    #[test]
    fn inverse_times_matrix_is_identity() {
        let mut rng = rand::rng();
        for _ in 0..20 {
            let m = random_matrix(&mut rng);
            let mi = inv4x4(&m.view()).unwrap();
            let prod = dotmm1(&m.view(), &mi.view()).unwrap();
            assert!(max_abs_diff(&prod, &Array2::eye(4)) < 1e-9);
        }
    }

    #[test]
    fn double_inverse_round_trip() {
        let mut rng = rand::rng();
        let grid = random_grid(&mut rng, 3, 5);
        let back = inv(&inv(&grid.view()).unwrap().view()).unwrap();
        assert!(max_abs_diff(&back, &grid) < 1e-8);
    }

    #[test]
    fn singular_element_is_all_nan() {
        let mut rng = rand::rng();
        let mut grid = random_grid(&mut rng, 2, 2);
        // two equal rows make element (1, 0) singular
        let row = grid.slice(s![1, 0, 0, ..]).to_owned();
        grid.slice_mut(s![1, 0, 1, ..]).assign(&row);
        let out = inv(&grid.view()).unwrap();
        assert!(out.slice(s![1, 0, .., ..]).iter().all(|v| v.re.is_nan() && v.im.is_nan()));
        assert!(out.slice(s![0, 0, .., ..]).iter().all(|v| v.is_finite()));
        assert!(out.slice(s![1, 1, .., ..]).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn zero_matrix_inverse_is_nan() {
        let zero = Array2::<C>::zeros((4, 4));
        let out = inv4x4(&zero.view()).unwrap();
        assert!(out.iter().all(|v| v.re.is_nan()));
    }

    #[test]
    fn dotmdm_matches_composition() {
        let mut rng = rand::rng();
        let a = random_matrix(&mut rng);
        let b = random_matrix(&mut rng);
        let d = Array1::from_shape_fn(4, |i| C::new(i as f64 + 1.0, -0.5));
        let fused = dotmdm1(&a.view(), &d.view(), &b.view()).unwrap();
        let ad = dotmd1(&a.view(), &d.view()).unwrap();
        let expected = dotmm1(&ad.view(), &b.view()).unwrap();
        assert!(max_abs_diff(&fused, &expected) < 1e-12);
    }

    #[test]
    fn dotmm_broadcasts_a_uniform_operand() {
        let mut rng = rand::rng();
        let grid = random_grid(&mut rng, 3, 2);
        let single = random_matrix(&mut rng);
        let left = dotmm(MatrixRef::Uniform(single.view()), MatrixRef::PerPixel(grid.view())).unwrap();
        let right = dotmm(MatrixRef::PerPixel(grid.view()), MatrixRef::Uniform(single.view())).unwrap();
        for i in 0..3 {
            for j in 0..2 {
                let g = grid.slice(s![i, j, .., ..]);
                let expected = dotmm1(&single.view(), &g).unwrap();
                assert!(max_abs_diff(&left.slice(s![i, j, .., ..]).to_owned(), &expected) < 1e-12);
                let expected = dotmm1(&g, &single.view()).unwrap();
                assert!(max_abs_diff(&right.slice(s![i, j, .., ..]).to_owned(), &expected) < 1e-12);
            }
        }
        assert!(matches!(
            dotmm(MatrixRef::Uniform(single.view()), MatrixRef::Uniform(single.view())),
            Err(Error::InvalidShape(_))
        ));
    }

    #[test]
    fn transmit_matches_dotmdmf() {
        let mut rng = rand::rng();
        let (h, w) = (4, 3);
        let a = random_grid(&mut rng, h, w);
        let b = random_grid(&mut rng, h, w);
        let d = Array3::from_shape_fn((h, w, 4), |(i, j, k)| C::new(0.1 * (i + j + k) as f64, 0.0));
        let field = Array3::from_shape_fn((4, h, w), |(k, i, j)| C::new(k as f64, (i * j) as f64));
        let kd = 1234.5;
        let out = transmit(&a.view(), &d.view(), &b.view(), &field.view(), kd).unwrap();
        let phase = d.mapv(|v| C::new(0.0, kd * v.re).exp());
        let expected = dotmdmf(
            MatrixRef::PerPixel(a.view()),
            DiagonalRef::PerPixel(phase.view()),
            MatrixRef::PerPixel(b.view()),
            &field.view(),
        )
        .unwrap();
        assert!(max_abs_diff(&out, &expected) < 1e-9);
    }

    #[test]
    fn transmit_stays_bounded_for_large_kd() {
        let eye = Array4::from_shape_fn((1, 1, 4, 4), |(_, _, i, j)| {
            if i == j { C::new(1.0, 0.0) } else { C::new(0.0, 0.0) }
        });
        let d = Array3::from_elem((1, 1, 4), C::new(1.5, 0.3));
        let field = Array3::from_elem((4, 1, 1), C::new(1.0, 0.0));
        let out = transmit(&eye.view(), &d.view(), &eye.view(), &field.view(), 1e4).unwrap();
        for v in out.iter() {
            assert!((v.norm() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn dotm1f_applies_uniform_matrix() {
        let mut m = Array2::<C>::zeros((4, 4));
        m[[0, 1]] = C::new(1.0, 0.0);
        m[[1, 0]] = C::new(1.0, 0.0);
        m[[2, 2]] = C::new(2.0, 0.0);
        let field = Array3::from_shape_fn((4, 2, 2), |(k, _, _)| C::new(k as f64 + 1.0, 0.0));
        let out = dotm1f(&m.view(), &field.view()).unwrap();
        assert_eq!(out[[0, 1, 1]], C::new(2.0, 0.0));
        assert_eq!(out[[1, 0, 0]], C::new(1.0, 0.0));
        assert_eq!(out[[2, 0, 1]], C::new(6.0, 0.0));
        assert_eq!(out[[3, 1, 0]], C::new(0.0, 0.0));
    }

    #[test]
    fn small_matrices_are_rejected() {
        let m = Array2::<C>::eye(2);
        assert!(matches!(inv4x4(&m.view()), Err(Error::InvalidShape(_))));
        let grid = Array4::<C>::zeros((2, 2, 3, 3));
        let field = Array3::<C>::zeros((4, 2, 2));
        assert!(dotmf(&grid.view(), &field.view()).is_err());
    }

    #[test]
    fn mismatched_grid_is_rejected() {
        let grid = Array4::<C>::zeros((2, 3, 4, 4));
        let field = Array3::<C>::zeros((4, 3, 2));
        assert!(matches!(dotmf(&grid.view(), &field.view()), Err(Error::InvalidShape(_))));
    }
}

/// A matrix operand that is either shared by every pixel or given per pixel.
#[derive(Debug, Clone, Copy)]
pub enum MatrixRef<'a> {
    Uniform(ArrayView2<'a, C>),
    PerPixel(ArrayView4<'a, C>),
}

/// A diagonal operand that is either shared by every pixel or given per pixel.
#[derive(Debug, Clone, Copy)]
pub enum DiagonalRef<'a> {
    Uniform(ArrayView1<'a, C>),
    PerPixel(ArrayView3<'a, C>),
}

impl MatrixRef<'_> {
    fn check(&self, h: usize, w: usize) -> Result<()> {
        match self {
            MatrixRef::Uniform(m) => check_matrix(m.shape()),
            MatrixRef::PerPixel(g) => {
                check_grid(g.shape())?;
                check_grid_extent(g.shape(), h, w)
            }
        }
    }

    #[inline]
    fn at(&self, i: usize, j: usize) -> M4 {
        match self {
            MatrixRef::Uniform(m) => load(m),
            MatrixRef::PerPixel(g) => load(&g.slice(s![i, j, .., ..])),
        }
    }
}

impl DiagonalRef<'_> {
    fn check(&self, h: usize, w: usize) -> Result<()> {
        let shape = match self {
            DiagonalRef::Uniform(d) => d.shape(),
            DiagonalRef::PerPixel(d) => {
                if d.shape()[0] != h || d.shape()[1] != w {
                    return Err(Error::shape(format!(
                        "diagonal grid {:?} does not match field grid ({}, {})",
                        d.shape(),
                        h,
                        w
                    )));
                }
                &d.shape()[2..]
            }
        };
        if shape[0] < 4 {
            return Err(Error::shape(format!(
                "diagonal length must be at least 4, got {}",
                shape[0]
            )));
        }
        Ok(())
    }

    #[inline]
    fn at(&self, i: usize, j: usize) -> V4 {
        match self {
            DiagonalRef::Uniform(d) => [d[0], d[1], d[2], d[3]],
            DiagonalRef::PerPixel(d) => [d[[i, j, 0]], d[[i, j, 1]], d[[i, j, 2]], d[[i, j, 3]]],
        }
    }
}

fn check_matrix(shape: &[usize]) -> Result<()> {
    if shape.len() != 2 || shape[0] < 4 || shape[1] < 4 {
        return Err(Error::shape(format!(
            "expected a matrix of at least 4x4, got {:?}",
            shape
        )));
    }
    Ok(())
}

fn check_grid(shape: &[usize]) -> Result<()> {
    check_matrix(&shape[2..])
}

fn check_grid_extent(shape: &[usize], h: usize, w: usize) -> Result<()> {
    if shape[0] != h || shape[1] != w {
        return Err(Error::shape(format!(
            "matrix grid {:?} does not match grid ({}, {})",
            &shape[..2],
            h,
            w
        )));
    }
    Ok(())
}

fn check_field(shape: &[usize]) -> Result<()> {
    if shape[0] < 4 {
        return Err(Error::shape(format!(
            "field must have at least 4 components, got {}",
            shape[0]
        )));
    }
    Ok(())
}

#[inline]
pub fn load(m: &ArrayView2<C>) -> M4 {
    let mut out = [[C::new(0.0, 0.0); 4]; 4];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v = m[[i, j]];
        }
    }
    out
}

#[inline]
pub fn to_array(m: &M4) -> Array2<C> {
    Array2::from_shape_fn((4, 4), |(i, j)| m[i][j])
}

#[inline]
fn store(m: &M4, out: &mut [C]) {
    for i in 0..4 {
        for j in 0..4 {
            out[4 * i + j] = m[i][j];
        }
    }
}

/// Closed-form cofactor inverse. A zero determinant gives NaN in every entry.
pub fn inv4(src: &M4) -> M4 {
    let mut dst = [[C::new(0.0, 0.0); 4]; 4];

    let tmp0 = src[2][2] * src[3][3];
    let tmp1 = src[3][2] * src[2][3];
    let tmp2 = src[1][2] * src[3][3];
    let tmp3 = src[3][2] * src[1][3];
    let tmp4 = src[1][2] * src[2][3];
    let tmp5 = src[2][2] * src[1][3];
    let tmp6 = src[0][2] * src[3][3];
    let tmp7 = src[3][2] * src[0][3];
    let tmp8 = src[0][2] * src[2][3];
    let tmp9 = src[2][2] * src[0][3];
    let tmp10 = src[0][2] * src[1][3];
    let tmp11 = src[1][2] * src[0][3];

    dst[0][0] = tmp0 * src[1][1] + tmp3 * src[2][1] + tmp4 * src[3][1]
        - tmp1 * src[1][1]
        - tmp2 * src[2][1]
        - tmp5 * src[3][1];
    dst[0][1] = tmp1 * src[0][1] + tmp6 * src[2][1] + tmp9 * src[3][1]
        - tmp0 * src[0][1]
        - tmp7 * src[2][1]
        - tmp8 * src[3][1];
    dst[0][2] = tmp2 * src[0][1] + tmp7 * src[1][1] + tmp10 * src[3][1]
        - tmp3 * src[0][1]
        - tmp6 * src[1][1]
        - tmp11 * src[3][1];
    dst[0][3] = tmp5 * src[0][1] + tmp8 * src[1][1] + tmp11 * src[2][1]
        - tmp4 * src[0][1]
        - tmp9 * src[1][1]
        - tmp10 * src[2][1];
    dst[1][0] = tmp1 * src[1][0] + tmp2 * src[2][0] + tmp5 * src[3][0]
        - tmp0 * src[1][0]
        - tmp3 * src[2][0]
        - tmp4 * src[3][0];
    dst[1][1] = tmp0 * src[0][0] + tmp7 * src[2][0] + tmp8 * src[3][0]
        - tmp1 * src[0][0]
        - tmp6 * src[2][0]
        - tmp9 * src[3][0];
    dst[1][2] = tmp3 * src[0][0] + tmp6 * src[1][0] + tmp11 * src[3][0]
        - tmp2 * src[0][0]
        - tmp7 * src[1][0]
        - tmp10 * src[3][0];
    dst[1][3] = tmp4 * src[0][0] + tmp9 * src[1][0] + tmp10 * src[2][0]
        - tmp5 * src[0][0]
        - tmp8 * src[1][0]
        - tmp11 * src[2][0];

    let tmp0 = src[2][0] * src[3][1];
    let tmp1 = src[3][0] * src[2][1];
    let tmp2 = src[1][0] * src[3][1];
    let tmp3 = src[3][0] * src[1][1];
    let tmp4 = src[1][0] * src[2][1];
    let tmp5 = src[2][0] * src[1][1];
    let tmp6 = src[0][0] * src[3][1];
    let tmp7 = src[3][0] * src[0][1];
    let tmp8 = src[0][0] * src[2][1];
    let tmp9 = src[2][0] * src[0][1];
    let tmp10 = src[0][0] * src[1][1];
    let tmp11 = src[1][0] * src[0][1];

    dst[2][0] = tmp0 * src[1][3] + tmp3 * src[2][3] + tmp4 * src[3][3]
        - (tmp1 * src[1][3] + tmp2 * src[2][3] + tmp5 * src[3][3]);
    dst[2][1] = tmp1 * src[0][3] + tmp6 * src[2][3] + tmp9 * src[3][3]
        - (tmp0 * src[0][3] + tmp7 * src[2][3] + tmp8 * src[3][3]);
    dst[2][2] = tmp2 * src[0][3] + tmp7 * src[1][3] + tmp10 * src[3][3]
        - (tmp3 * src[0][3] + tmp6 * src[1][3] + tmp11 * src[3][3]);
    dst[2][3] = tmp5 * src[0][3] + tmp8 * src[1][3] + tmp11 * src[2][3]
        - (tmp4 * src[0][3] + tmp9 * src[1][3] + tmp10 * src[2][3]);
    dst[3][0] = tmp2 * src[2][2] + tmp5 * src[3][2] + tmp1 * src[1][2]
        - (tmp4 * src[3][2] + tmp0 * src[1][2] + tmp3 * src[2][2]);
    dst[3][1] = tmp8 * src[3][2] + tmp0 * src[0][2] + tmp7 * src[2][2]
        - (tmp6 * src[2][2] + tmp9 * src[3][2] + tmp1 * src[0][2]);
    dst[3][2] = tmp6 * src[1][2] + tmp11 * src[3][2] + tmp3 * src[0][2]
        - (tmp10 * src[3][2] + tmp2 * src[0][2] + tmp7 * src[1][2]);
    dst[3][3] = tmp10 * src[2][2] + tmp4 * src[0][2] + tmp9 * src[1][2]
        - (tmp8 * src[1][2] + tmp11 * src[2][2] + tmp5 * src[0][2]);

    let det = src[0][0] * dst[0][0] + src[1][0] * dst[0][1] + src[2][0] * dst[0][2]
        + src[3][0] * dst[0][3];

    let scale = if det == C::new(0.0, 0.0) {
        C::new(f64::NAN, f64::NAN)
    } else {
        C::new(1.0, 0.0) / det
    };
    for row in dst.iter_mut() {
        for v in row.iter_mut() {
            *v *= scale;
        }
    }
    dst
}

#[inline]
pub fn mul4(a: &M4, b: &M4) -> M4 {
    let mut out = [[C::new(0.0, 0.0); 4]; 4];
    for i in 0..4 {
        for j in 0..4 {
            out[i][j] = a[i][0] * b[0][j] + a[i][1] * b[1][j] + a[i][2] * b[2][j] + a[i][3] * b[3][j];
        }
    }
    out
}

#[inline]
pub fn mul4d(a: &M4, d: &V4) -> M4 {
    let mut out = *a;
    for row in out.iter_mut() {
        for (v, dk) in row.iter_mut().zip(d) {
            *v *= dk;
        }
    }
    out
}

#[inline]
pub fn mul4v(a: &M4, v: &V4) -> V4 {
    [
        a[0][0] * v[0] + a[0][1] * v[1] + a[0][2] * v[2] + a[0][3] * v[3],
        a[1][0] * v[0] + a[1][1] * v[1] + a[1][2] * v[2] + a[1][3] * v[3],
        a[2][0] * v[0] + a[2][1] * v[1] + a[2][2] * v[2] + a[2][3] * v[3],
        a[3][0] * v[0] + a[3][1] * v[1] + a[3][2] * v[2] + a[3][3] * v[3],
    ]
}

/// Inverse of a single 4x4 matrix.
pub fn inv4x4(m: &ArrayView2<C>) -> Result<Array2<C>> {
    check_matrix(m.shape())?;
    Ok(to_array(&inv4(&load(m))))
}

/// Element-wise inverse of a matrix grid.
pub fn inv(grid: &ArrayView4<C>) -> Result<Array4<C>> {
    check_grid(grid.shape())?;
    Ok(map_grid(grid.shape(), |i, j| inv4(&load(&grid.slice(s![i, j, .., ..])))))
}

/// Product of two single matrices.
pub fn dotmm1(a: &ArrayView2<C>, b: &ArrayView2<C>) -> Result<Array2<C>> {
    check_matrix(a.shape())?;
    check_matrix(b.shape())?;
    Ok(to_array(&mul4(&load(a), &load(b))))
}

/// Element-wise product of matrix operands over a grid. At least one of the
/// operands must be a grid; it defines the grid extent.
pub fn dotmm<'a>(a: MatrixRef<'a>, b: MatrixRef<'a>) -> Result<Array4<C>> {
    let (h, w) = match (&a, &b) {
        (MatrixRef::PerPixel(g), _) | (_, MatrixRef::PerPixel(g)) => (g.shape()[0], g.shape()[1]),
        _ => {
            return Err(Error::shape(
                "dotmm needs at least one per-pixel operand; use dotmm1 for single matrices",
            ))
        }
    };
    a.check(h, w)?;
    b.check(h, w)?;
    Ok(map_grid(&[h, w], |i, j| mul4(&a.at(i, j), &b.at(i, j))))
}

/// `a * diag(d)` for a single matrix.
pub fn dotmd1(a: &ArrayView2<C>, d: &ArrayView1<C>) -> Result<Array2<C>> {
    check_matrix(a.shape())?;
    DiagonalRef::Uniform(d.view()).check(0, 0)?;
    Ok(to_array(&mul4d(&load(a), &[d[0], d[1], d[2], d[3]])))
}

/// `a * diag(d) * b` for single matrices.
pub fn dotmdm1(a: &ArrayView2<C>, d: &ArrayView1<C>, b: &ArrayView2<C>) -> Result<Array2<C>> {
    let ad = dotmd1(a, d)?;
    dotmm1(&ad.view(), b)
}

/// `a * diag(d) * b` evaluated per pixel of a grid.
pub fn dotmdm(a: MatrixRef, d: DiagonalRef, b: MatrixRef, h: usize, w: usize) -> Result<Array4<C>> {
    a.check(h, w)?;
    d.check(h, w)?;
    b.check(h, w)?;
    Ok(map_grid(&[h, w], |i, j| {
        mul4(&mul4d(&a.at(i, j), &d.at(i, j)), &b.at(i, j))
    }))
}

/// Matrix times vector.
pub fn dotmv(a: &ArrayView2<C>, v: &ArrayView1<C>) -> Result<Array1<C>> {
    check_matrix(a.shape())?;
    if v.len() < 4 {
        return Err(Error::shape(format!("vector length must be at least 4, got {}", v.len())));
    }
    let out = mul4v(&load(a), &[v[0], v[1], v[2], v[3]]);
    Ok(Array1::from(out.to_vec()))
}

/// Applies a per-pixel matrix grid to a field.
pub fn dotmf(a: &ArrayView4<C>, field: &ArrayView3<C>) -> Result<Array3<C>> {
    apply(MatrixRef::PerPixel(a.view()), field)
}

/// Applies one matrix to every pixel of a field.
pub fn dotm1f(a: &ArrayView2<C>, field: &ArrayView3<C>) -> Result<Array3<C>> {
    apply(MatrixRef::Uniform(a.view()), field)
}

/// Applies a matrix operand to a field.
pub fn apply(a: MatrixRef, field: &ArrayView3<C>) -> Result<Array3<C>> {
    check_field(field.shape())?;
    let (h, w) = (field.shape()[1], field.shape()[2]);
    a.check(h, w)?;
    let mut out = Array3::<C>::zeros(field.raw_dim());
    Zip::indexed(out.lanes_mut(Axis(0)))
        .and(field.lanes(Axis(0)))
        .par_for_each(|(i, j), mut o, f| {
            let r = mul4v(&a.at(i, j), &[f[0], f[1], f[2], f[3]]);
            for k in 0..4 {
                o[k] = r[k];
            }
        });
    Ok(out)
}

/// Fused `a * diag(d) * b * field`.
pub fn dotmdmf(a: MatrixRef, d: DiagonalRef, b: MatrixRef, field: &ArrayView3<C>) -> Result<Array3<C>> {
    check_field(field.shape())?;
    let (h, w) = (field.shape()[1], field.shape()[2]);
    a.check(h, w)?;
    d.check(h, w)?;
    b.check(h, w)?;
    let mut out = Array3::<C>::zeros(field.raw_dim());
    Zip::indexed(out.lanes_mut(Axis(0)))
        .and(field.lanes(Axis(0)))
        .par_for_each(|(i, j), mut o, f| {
            let v = mul4v(&b.at(i, j), &[f[0], f[1], f[2], f[3]]);
            let dv = d.at(i, j);
            let v = [v[0] * dv[0], v[1] * dv[1], v[2] * dv[2], v[3] * dv[3]];
            let r = mul4v(&a.at(i, j), &v);
            for k in 0..4 {
                o[k] = r[k];
            }
        });
    Ok(out)
}

/// Fused `a * diag(exp(i kd Re(d))) * b * field`, evaluated per pixel.
///
/// Only the real part of `d` enters the phase, so the phase factors have unit
/// magnitude for any `kd`.
pub fn transmit(
    a: &ArrayView4<C>,
    d: &ArrayView3<C>,
    b: &ArrayView4<C>,
    field: &ArrayView3<C>,
    kd: f64,
) -> Result<Array3<C>> {
    check_field(field.shape())?;
    let (h, w) = (field.shape()[1], field.shape()[2]);
    let (a, b) = (MatrixRef::PerPixel(a.view()), MatrixRef::PerPixel(b.view()));
    let d = DiagonalRef::PerPixel(d.view());
    a.check(h, w)?;
    b.check(h, w)?;
    d.check(h, w)?;
    let mut out = Array3::<C>::zeros(field.raw_dim());
    Zip::indexed(out.lanes_mut(Axis(0)))
        .and(field.lanes(Axis(0)))
        .par_for_each(|(i, j), mut o, f| {
            let v = mul4v(&b.at(i, j), &[f[0], f[1], f[2], f[3]]);
            let dv = d.at(i, j);
            let mut p = [C::new(0.0, 0.0); 4];
            for k in 0..4 {
                p[k] = v[k] * C::from_polar(1.0, kd * dv[k].re);
            }
            let r = mul4v(&a.at(i, j), &p);
            for k in 0..4 {
                o[k] = r[k];
            }
        });
    Ok(out)
}

/// Rotates a mode matrix by an in-plane rotation `(cos, sin)`. The rotation
/// acts identically on the (0, 2) and (1, 3) slot pairs.
pub fn dotmr2(a: &M4, rot: (f64, f64)) -> M4 {
    let (c, s) = rot;
    let mut out = [[C::new(0.0, 0.0); 4]; 4];
    for j in 0..4 {
        out[0][j] = a[0][j] * c - a[2][j] * s;
        out[2][j] = a[0][j] * s + a[2][j] * c;
        out[1][j] = a[1][j] * c - a[3][j] * s;
        out[3][j] = a[1][j] * s + a[3][j] * c;
    }
    out
}

/// Builds a `(h, w, 4, 4)` grid from a per-pixel closure, in parallel.
pub fn map_grid<F>(shape: &[usize], f: F) -> Array4<C>
where
    F: Fn(usize, usize) -> M4 + Sync,
{
    let (h, w) = (shape[0], shape[1]);
    let mut out = Array4::<C>::zeros((h, w, 4, 4));
    if let Some(data) = out.as_slice_mut() {
        data.par_chunks_mut(16).enumerate().for_each(|(p, chunk)| {
            store(&f(p / w, p % w), chunk);
        });
    }
    out
}

/// Embeds a 2x2 block into the even rows and columns of a 4x4 matrix.
pub fn embed_even(j: &[[C; 2]; 2]) -> M4 {
    let mut out = [[C::new(0.0, 0.0); 4]; 4];
    out[0][0] = j[0][0];
    out[0][2] = j[0][1];
    out[2][0] = j[1][0];
    out[2][2] = j[1][1];
    out
}

/// Closed-form 2x2 inverse with the same NaN policy as [`inv4`].
pub fn inv2(m: &[[C; 2]; 2]) -> [[C; 2]; 2] {
    let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    let scale = if det == C::new(0.0, 0.0) {
        C::new(f64::NAN, f64::NAN)
    } else {
        C::new(1.0, 0.0) / det
    };
    [
        [m[1][1] * scale, -m[0][1] * scale],
        [-m[1][0] * scale, m[0][0] * scale],
    ]
}

#[inline]
pub fn mul2(a: &[[C; 2]; 2], b: &[[C; 2]; 2]) -> [[C; 2]; 2] {
    [
        [
            a[0][0] * b[0][0] + a[0][1] * b[1][0],
            a[0][0] * b[0][1] + a[0][1] * b[1][1],
        ],
        [
            a[1][0] * b[0][0] + a[1][1] * b[1][0],
            a[1][0] * b[0][1] + a[1][1] * b[1][1],
        ],
    ]
}
