//! Interface couplers between two eigenmode bases.
//!
//! At an interface the tangential field `(Ex, Hy, Ey, -Hx)` is continuous, so
//! mode amplitudes on the two sides are related by `S = fout^-1 fin`. Imposing
//! that no light arrives from the far side gives the Fresnel-like
//! transmission of the incident modes:
//! - forward incidence: `T = S_ee - S_eo S_oo^-1 S_oe`
//! - backward incidence: `T = S_oo - S_oe S_ee^-1 S_eo`
//!
//! where `e` are the forward (even) and `o` the backward (odd) mode slots.

use num_complex::Complex64;

use crate::linalg::{embed_even, inv2, inv4, mul2, mul4, M4};
use crate::optics::Direction;

type M2 = [[Complex64; 2]; 2];


/// Mode-space transmission matrix from `fin` to `fout` for light incident in
/// `direction`. The result is embedded in the even slots for forward and in the
/// odd slots for backward incidence.
pub fn transmission_matrix(fin: &M4, fout: &M4, direction: Direction) -> M4 {
    let s = mul4(&inv4(fout), fin);
    let (a, b) = match direction {
        Direction::Forward => (0, 1),
        Direction::Backward => (1, 0),
    };
    let block = |r: usize, c: usize| -> M2 {
        [
            [s[r][c], s[r][c + 2]],
            [s[r + 2][c], s[r + 2][c + 2]],
        ]
    };
    let s_aa = block(a, a);
    let s_ab = block(a, b);
    let s_bb = block(b, b);
    let s_ba = block(b, a);
    let coupling = mul2(&mul2(&s_ab, &inv2(&s_bb)), &s_ba);
    let mut out = [[Complex64::new(0.0, 0.0); 4]; 4];
    for i in 0..2 {
        for j in 0..2 {
            out[2 * i + a][2 * j + a] = s_aa[i][j] - coupling[i][j];
        }
    }
    out
}

/// Field-space Jones transmission `J_out T J_in^-1` between two media, where
/// `J` is the electric block of the incident modes. Embedded in the even rows
/// and columns of a 4x4 matrix.
pub fn jones_transmission(fin: &M4, fout: &M4, direction: Direction) -> M4 {
    jones_coupler(&transmission_matrix(fin, fout, direction), fin, fout, direction)
}

/// Converts a mode-space transmission matrix `t` into its field-space Jones
/// form.
pub fn jones_coupler(t: &M4, fin: &M4, fout: &M4, direction: Direction) -> M4 {
    let c = match direction {
        Direction::Forward => 0,
        Direction::Backward => 1,
    };
    let jones = |f: &M4| -> M2 { [[f[0][c], f[0][c + 2]], [f[2][c], f[2][c + 2]]] };
    let t2 = [[t[c][c], t[c][c + 2]], [t[c + 2][c], t[c + 2][c + 2]]];
    embed_even(&mul2(&mul2(&jones(fout), &t2), &inv2(&jones(fin))))
}
