//! Multi-pass transfer of field data through optical data.
//!
//! Even passes go forward through the stack, odd passes backward. After a
//! forward pass the transmitted light is accumulated into the output field;
//! after a backward pass the returned light updates the input field, rescaled
//! to the power of the original input, and its complement seeds the next
//! forward pass. With `npass == 1` the transfer runs once in Jones mode unless
//! interference is requested.

use std::str::FromStr;

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, Array4, ArrayView4, Axis};
use num_complex::Complex64;
use rayon::prelude::*;
use serde::Deserialize;

use crate::data::{isotropic_effective_data, HomogeneousLayer, OpticalData};
use crate::diffract::{Betamax, Context};
use crate::error::{Error, Result};
use crate::field::{total_intensity, FieldData};
use crate::optics::Direction;
use crate::powers::Powers;
use crate::project::{jones2h, reflected_field, transmitted_field, Norm};
use crate::propagate::{propagate_field_effective, propagate_field_full, transmit_jones, LayerModes, StepOptions};

type C = Complex64;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MatrixCache;
    use crate::data::stack_layers;
    use crate::optics::BerremanOptics;
    use ndarray::Array5;

    fn c(re: f64) -> C {
        C::new(re, 0.0)
    }

    fn plane_wave_data(n: f64, h: usize, w: usize) -> FieldData {
        let mut field = Array5::zeros((1, 1, 4, h, w));
        field.slice_mut(ndarray::s![0, 0, 0, .., ..]).fill(c(1.0));
        field.slice_mut(ndarray::s![0, 0, 1, .., ..]).fill(c(n));
        FieldData::new(field, vec![500.0], 100.0).unwrap()
    }

    #[test]
    fn method_parsing() {
        assert_eq!("effective".parse::<Method>().unwrap(), Method::Effective);
        assert_eq!("full".parse::<Method>().unwrap(), Method::Full);
        assert!(matches!("fast".parse::<Method>(), Err(Error::UnknownVariant { .. })));
    }

    #[test]
    fn rejects_bad_options() {
        let data = stack_layers(&[HomogeneousLayer::isotropic(1.0, 1.5)]).unwrap();
        let field = plane_wave_data(1.0, 2, 2);
        let bad = [
            TransferOptions { npass: 0, ..Default::default() },
            TransferOptions { nstep: vec![0], ..Default::default() },
            TransferOptions { nstep: vec![1, 1], ..Default::default() },
            TransferOptions { nin: 0.0, ..Default::default() },
            TransferOptions { beta: vec![0.0, 0.1], ..Default::default() },
            TransferOptions { window: Some(Array2::ones((3, 3))), ..Default::default() },
        ];
        for options in bad {
            assert!(options.validate(&field, &data).is_err(), "{:?}", options);
        }
    }

    #[test]
    fn reuses_layer_modes_across_passes() {
        let cache = MatrixCache::new();
        let ctx = Context::new(&BerremanOptics, &cache);
        let data = stack_layers(&[
            HomogeneousLayer::isotropic(2.0, 1.5),
            HomogeneousLayer::isotropic(1.0, 1.6),
        ])
        .unwrap();
        let field = plane_wave_data(1.0, 4, 4);
        let options = TransferOptions {
            npass: 3,
            nin: 1.0,
            nout: 1.0,
            ..Default::default()
        };
        let res = transfer_field_with(&ctx, &field, &data, &options).unwrap();
        assert_eq!(res.field_out.field.shape(), field.field.shape());
        assert!(res.field_out.field.iter().all(|v| v.is_finite()));
        assert!(res.powers.reflected[0] > 0.0);
    }
}

/// Layer propagation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Diffraction through homogeneous effective layers plus exact local
    /// transfer.
    #[default]
    Effective,
    /// Plane wave by plane wave transfer.
    Full,
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "effective" => Ok(Method::Effective),
            "full" => Ok(Method::Full),
            other => Err(Error::UnknownVariant {
                kind: "method",
                value: other.to_string(),
            }),
        }
    }
}

/// Parameters of [`transfer_field`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOptions {
    /// Ray directions, one value for all rays or one per ray.
    pub beta: Vec<f64>,
    pub phi: Vec<f64>,
    /// Refractive index of the input medium.
    pub nin: f64,
    /// Refractive index of the output medium.
    pub nout: f64,
    pub npass: usize,
    /// Sub-steps per layer, one value for all layers or one per layer.
    pub nstep: Vec<usize>,
    pub diffraction: bool,
    /// Fresnel reflections at the effective layer interfaces (single-pass
    /// Jones mode only).
    pub reflections: bool,
    /// Forced on for `npass > 1`.
    pub interference: bool,
    pub norm: Norm,
    /// Normalize against a reference field propagated alongside.
    pub reference: bool,
    /// Multiplied into the transmitted field after every forward pass.
    pub window: Option<Array2<f64>>,
    pub betamax: Betamax,
    /// Transfer rays one at a time instead of in parallel.
    pub split: bool,
    pub method: Method,
    /// Homogeneous data used for diffraction; the isotropic average of the
    /// optical data when absent.
    pub effective_data: Option<OpticalData>,
    pub verbose: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            beta: vec![0.0],
            phi: vec![0.0],
            nin: 1.0,
            nout: 1.0,
            npass: 1,
            nstep: vec![1],
            diffraction: true,
            reflections: true,
            interference: false,
            norm: Norm::Fft,
            reference: false,
            window: None,
            betamax: Betamax::default(),
            split: false,
            method: Method::Effective,
            effective_data: None,
            verbose: false,
        }
    }
}

fn broadcast<T: Copy>(values: &[T], i: usize) -> T {
    if values.len() == 1 {
        values[0]
    } else {
        values[i]
    }
}

impl TransferOptions {
    /// Checks the options against the data before any numerical work.
    pub fn validate(&self, field: &FieldData, data: &OpticalData) -> Result<()> {
        field.validate()?;
        data.validate()?;
        let nrays = field.nrays();
        for (name, len) in [("beta", self.beta.len()), ("phi", self.phi.len())] {
            if len != 1 && len != nrays {
                return Err(Error::parameter(
                    name,
                    format!("expected 1 or {} values, got {}", nrays, len),
                ));
            }
        }
        if self.npass == 0 {
            return Err(Error::parameter("npass", "must be at least 1"));
        }
        if self.nstep.len() != 1 && self.nstep.len() != data.len() {
            return Err(Error::parameter(
                "nstep",
                format!("expected 1 or {} values, got {}", data.len(), self.nstep.len()),
            ));
        }
        if self.nstep.contains(&0) {
            return Err(Error::parameter("nstep", "must be at least 1"));
        }
        if self.nin.is_nan() || self.nin <= 0.0 || self.nout.is_nan() || self.nout <= 0.0 {
            return Err(Error::parameter("nin/nout", "refractive indices must be positive"));
        }
        let cutoff = self.betamax.cutoff();
        if cutoff.is_nan() || cutoff <= 0.0 {
            return Err(Error::parameter("betamax", "must be positive"));
        }
        let grid = field.grid();
        if let Some(layer_grid) = data.grid() {
            if layer_grid != grid {
                return Err(Error::shape(format!(
                    "optical data grid {:?} does not match field grid {:?}",
                    layer_grid, grid
                )));
            }
        }
        if let Some(window) = &self.window {
            if window.dim() != grid {
                return Err(Error::shape(format!(
                    "window {:?} does not match field grid {:?}",
                    window.dim(),
                    grid
                )));
            }
        }
        if let Some(eff) = &self.effective_data {
            eff.validate()?;
            if !eff.is_homogeneous() {
                return Err(Error::data("effective optical data must be homogeneous"));
            }
            if eff.len() != data.len() {
                return Err(Error::data(format!(
                    "effective data has {} layers, optical data has {}",
                    eff.len(),
                    data.len()
                )));
            }
        }
        Ok(())
    }
}

/// Output of [`transfer_field`].
#[derive(Debug, Clone)]
pub struct TransferResult {
    /// Transmitted field.
    pub field_out: FieldData,
    /// Input field, with reflected light added when `npass > 1`.
    pub field_in: FieldData,
    pub powers: Powers,
}

/// Transfers `field` through `data` with the default layer optics and the
/// process-wide matrix cache.
pub fn transfer_field(field: &FieldData, data: &OpticalData, options: &TransferOptions) -> Result<TransferResult> {
    transfer_field_with(&Context::default(), field, data, options)
}

/// Transfers `field` through `data` using `ctx`.
pub fn transfer_field_with(
    ctx: &Context,
    field: &FieldData,
    data: &OpticalData,
    options: &TransferOptions,
) -> Result<TransferResult> {
    options.validate(field, data)?;
    let ks = field.wavenumbers()?;
    let effective = match &options.effective_data {
        Some(eff) => eff.clone(),
        None => isotropic_effective_data(data)?,
    };
    let nrays = field.nrays();
    log::info!(
        "transferring {} ray(s), {} wavelength(s) through {} layer(s)",
        nrays,
        ks.len(),
        data.len()
    );
    if options.npass > 1 && options.npass % 2 == 0 {
        log::warn!(
            "npass = {} is even; the last pass returns reflected light and the transmitted field is not updated",
            options.npass
        );
    }

    let run = |i: usize, progress: bool| -> Result<(Array4<C>, Array4<C>, Powers)> {
        let ray = RayTransfer {
            ctx,
            ks: &ks,
            data,
            effective: &effective,
            options,
            beta: broadcast(&options.beta, i),
            phi: broadcast(&options.phi, i),
        };
        ray.run(&field.ray(i), progress)
    };

    let results: Vec<(Array4<C>, Array4<C>, Powers)> = if options.split || nrays == 1 {
        (0..nrays)
            .map(|i| {
                if options.split {
                    log::info!("ray {}/{}", i + 1, nrays);
                }
                run(i, options.verbose)
            })
            .collect::<Result<_>>()?
    } else {
        (0..nrays).into_par_iter().map(|i| run(i, false)).collect::<Result<_>>()?
    };

    let mut powers = Powers::new(ks.len());
    let mut outs = Vec::with_capacity(nrays);
    let mut ins = Vec::with_capacity(nrays);
    for (out, inp, p) in results {
        outs.push(out);
        ins.push(inp);
        powers += p;
    }
    let field_out = FieldData::from_rays(outs, field.wavelengths.clone(), field.pixelsize)?;
    let field_in = FieldData::from_rays(ins, field.wavelengths.clone(), field.pixelsize)?;
    if field_out.field.iter().any(|v| !v.is_finite()) {
        log::warn!("output field contains non-finite values; consider a lower betamax");
    }
    log::debug!("{}", powers);
    Ok(TransferResult {
        field_out,
        field_in,
        powers,
    })
}

fn scale_wavelengths(field: &mut Array4<C>, factors: &[f64]) {
    for (mut plane, &f) in field.outer_iter_mut().zip(factors) {
        plane.mapv_inplace(|v| v * f);
    }
}

fn zero_odd_slots(field: &mut Array4<C>) {
    for k in [1, 3] {
        field.index_axis_mut(Axis(1), k).fill(C::new(0.0, 0.0));
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] {bar:40.green/blue} {pos:>5}/{len:5} {msg} ETA: {eta_precise}",
    )
    .map(|s| s.progress_chars("█▇▆▅▄▃▂▁"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message("layer");
    pb
}

/// Transfer of one ray: a field of shape `(wavelengths, 4, h, w)`.
struct RayTransfer<'a> {
    ctx: &'a Context<'a>,
    ks: &'a [f64],
    data: &'a OpticalData,
    effective: &'a OpticalData,
    options: &'a TransferOptions,
    beta: f64,
    phi: f64,
}

impl RayTransfer<'_> {
    fn step(&self, j: usize, jones: bool) -> StepOptions {
        StepOptions {
            beta: self.beta,
            phi: self.phi,
            nsteps: broadcast(&self.options.nstep, j),
            diffraction: self.options.diffraction,
            jones,
            betamax: self.options.betamax,
        }
    }

    fn transmitted(&self, field: &Array4<C>, n: f64, norm: Option<Norm>, reference: Option<&Array4<C>>) -> Result<Array4<C>> {
        let reference = reference.map(|r| r.view());
        transmitted_field(self.ctx, &field.view(), self.ks, n, self.options.betamax, norm, reference.as_ref())
    }

    /// Returns the output field, the updated input field and the powers.
    fn run(&self, field0: &ArrayView4<C>, show_progress: bool) -> Result<(Array4<C>, Array4<C>, Powers)> {
        let opts = self.options;
        let ctx = self.ctx;
        let ks = self.ks;
        let n = self.data.len();
        let npass = opts.npass;
        let interference = opts.interference || npass > 1;
        let jones = !interference;
        let reflections = opts.reflections && !interference;

        let field0 = field0.to_owned();
        let mut field = field0.clone();
        if jones {
            field = self.transmitted(&field, opts.nin, None, None)?;
            zero_odd_slots(&mut field);
        }
        let mut reference = if opts.reference { Some(field.clone()) } else { None };
        let i0 = total_intensity(&self.transmitted(&field0, opts.nin, None, None)?.view()).to_vec();

        let medium_out = HomogeneousLayer::isotropic(0.0, opts.nout);
        let mut input_layer = if reflections {
            Some(HomogeneousLayer::isotropic(0.0, opts.nin))
        } else {
            None
        };
        let mut modes: Vec<Option<LayerModes>> = vec![None; n];
        let mut field_out = Array4::<C>::zeros(field0.raw_dim());
        let mut field_in = Array4::<C>::zeros(field0.raw_dim());

        let pb = show_progress.then(|| progress_bar(npass * n));

        for i in 0..npass {
            let direction = Direction::of_pass(i);
            log::debug!("pass {}/{} ({:?})", i + 1, npass, direction);
            if let Some(pb) = &pb {
                pb.set_message(format!("pass {}/{}", i + 1, npass));
            }
            let order: Vec<usize> = match direction {
                Direction::Forward => (0..n).collect(),
                Direction::Backward => (0..n).rev().collect(),
            };
            for j in order {
                let sign = direction.sign();
                let layer = self.data.layer(j);
                let layer = layer.with_thickness(layer.thickness * sign);
                let eff = self.effective.homogeneous_layer(j)?;
                let eff = eff.with_thickness(eff.thickness * sign);

                if let Some(r) = reference.as_mut() {
                    if direction == Direction::Forward && interference {
                        let mut rj = r.clone();
                        zero_odd_slots(&mut rj);
                        let (r2, _) =
                            propagate_field_effective(ctx, &rj.view(), ks, &layer, &eff, None, None, &self.step(j, true))?;
                        *r = jones2h(ctx, &r2.view(), ks, opts.nout, opts.betamax)?;
                    }
                }

                field = match opts.method {
                    Method::Effective => {
                        let (out, m) = propagate_field_effective(
                            ctx,
                            &field.view(),
                            ks,
                            &layer,
                            &eff,
                            input_layer.as_ref(),
                            modes[j].take(),
                            &self.step(j, jones),
                        )?;
                        modes[j] = Some(m);
                        out
                    }
                    Method::Full => {
                        let step = self.step(j, jones);
                        propagate_field_full(
                            ctx,
                            &field.view(),
                            ks,
                            &layer,
                            input_layer.as_ref(),
                            step.nsteps,
                            jones,
                            opts.betamax,
                        )?
                    }
                };
                if input_layer.is_some() {
                    input_layer = Some(eff.with_thickness(0.0));
                }
                if let Some(pb) = &pb {
                    pb.inc(1);
                }
            }
            if let Some(last) = &input_layer {
                field = transmit_jones(ctx, &field.view(), ks, last, &medium_out, opts.betamax)?;
            }

            if npass > 1 {
                if direction == Direction::Forward {
                    if i != npass - 1 {
                        log::debug!("normalizing transmissions");
                        if let Some(r) = reference.as_mut() {
                            let f = (opts.nin / opts.nout).sqrt();
                            r.mapv_inplace(|v| v * f);
                        }
                        field = self.transmitted(&field, opts.nout, Some(opts.norm), reference.as_ref())?;
                        if let Some(window) = &opts.window {
                            for mut plane in field.outer_iter_mut() {
                                for mut comp in plane.outer_iter_mut() {
                                    comp.zip_mut_with(window, |v, w| *v *= *w);
                                }
                            }
                        }
                    }
                    field_out += &field;
                    field = field_out.clone();
                } else {
                    field_in.assign(&field);
                    if i != npass - 1 {
                        log::debug!("normalizing reflections");
                        field = self.transmitted(&field, opts.nin, None, None)?;
                        let i0f = total_intensity(&field.view());
                        let factors: Vec<f64> = i0
                            .iter()
                            .zip(i0f.iter())
                            .map(|(a, b)| if *b == 0.0 { 1.0 } else { (a / b).abs().sqrt() })
                            .collect();
                        scale_wavelengths(&mut field, &factors);
                        scale_wavelengths(&mut field_out, &factors);
                        scale_wavelengths(&mut field_in, &factors);
                        field = &field0 - &field;
                        field_in += &field;
                        if reference.is_some() {
                            reference = Some(field.clone());
                        }
                    }
                }
            } else {
                field_out = if jones {
                    let mut out = jones2h(ctx, &field.view(), ks, opts.nout, opts.betamax)?;
                    if !reflections {
                        let f = (opts.nin / opts.nout).sqrt();
                        out.mapv_inplace(|v| v * f);
                    }
                    out
                } else {
                    field.clone()
                };
                field_in.assign(&field0);
            }
        }
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }

        let transmitted = total_intensity(&self.transmitted(&field_out, opts.nout, None, None)?.view()).to_vec();
        let reflected = reflected_field(ctx, &field_in.view(), ks, opts.nin, opts.betamax, None)?;
        let reflected = total_intensity(&reflected.view()).iter().map(|v| -v).collect();
        let powers = Powers {
            input: i0,
            transmitted,
            reflected,
        };
        Ok((field_out, field_in, powers))
    }
}
