//! Propagation of polarized light through layered, optically anisotropic media
//! with the 4x4 diffractive transfer matrix method.
//!
//! The entry point is [`transfer::transfer_field`], which moves [`FieldData`]
//! through [`OpticalData`] in one or more forward and backward passes. The
//! building blocks are public as well: eigenmodes ([`optics`]), diffraction
//! matrices ([`diffract`]), Fourier-space projections ([`project`]) and
//! single-layer propagation ([`propagate`]).

pub mod cache;
pub mod data;
pub mod diffract;
pub mod error;
pub mod fft;
pub mod field;
pub mod fresnel;
pub mod linalg;
pub mod optics;
pub mod powers;
pub mod project;
pub mod propagate;
pub mod settings;
pub mod transfer;
pub mod wave;

pub use data::OpticalData;
pub use error::{Error, Result};
pub use field::FieldData;
pub use project::{reflected_field, transmitted_field, Norm};
pub use transfer::{transfer_field, transfer_field_with, Method, TransferOptions, TransferResult};
