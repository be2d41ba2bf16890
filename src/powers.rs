//! Energy bookkeeping for a transfer.
//!
//! Powers are integrated z-components of the Poynting vector, one value per
//! wavelength, summed over rays:
//! - input: forward part of the input field in the input medium
//! - transmitted: forward part of the output field in the output medium
//! - reflected: backward part of the updated input field, as a positive number
//!
//! The remainder, [`Powers::missing`], is absorbed light plus numerical loss
//! from the cutoff and the normalization.

use itertools::{izip, Itertools};
use std::{
    fmt,
    ops::{Add, AddAssign},
};


/// Per-wavelength power budget.
#[derive(Debug, Clone, PartialEq)]
pub struct Powers {
    pub input: Vec<f64>,
    pub transmitted: Vec<f64>,
    pub reflected: Vec<f64>,
}

fn zip_with(a: &[f64], b: &[f64], f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    a.iter().zip_eq(b).map(|(x, y)| f(*x, *y)).collect()
}

impl Add for Powers {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            input: zip_with(&self.input, &other.input, |a, b| a + b),
            transmitted: zip_with(&self.transmitted, &other.transmitted, |a, b| a + b),
            reflected: zip_with(&self.reflected, &other.reflected, |a, b| a + b),
        }
    }
}

impl AddAssign for Powers {
    fn add_assign(&mut self, other: Self) {
        *self = self.clone() + other;
    }
}

impl Powers {
    /// Zero powers for `nwavelengths` wavelengths.
    pub fn new(nwavelengths: usize) -> Self {
        Self {
            input: vec![0.0; nwavelengths],
            transmitted: vec![0.0; nwavelengths],
            reflected: vec![0.0; nwavelengths],
        }
    }

    /// Power missing from the budget.
    pub fn missing(&self) -> Vec<f64> {
        izip!(&self.input, &self.transmitted, &self.reflected)
            .map(|(i, t, r)| i - (t + r))
            .collect()
    }
}

impl fmt::Display for Powers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Powers:")?;
        let missing = self.missing();
        for wl in 0..self.input.len() {
            writeln!(f, "  Wavelength {}:", wl)?;
            writeln!(f, "    Input:         {:.6}", self.input[wl])?;
            writeln!(f, "    Transmitted:   {:.6}", self.transmitted[wl])?;
            writeln!(f, "    Reflected:     {:.6}", self.reflected[wl])?;
            writeln!(f, "    Other:         {:.6}", missing[wl])?;
        }
        Ok(())
    }
}
