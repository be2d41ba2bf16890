use anyhow::{ensure, Context as _, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::diffract::Betamax;
use crate::project::Norm;
use crate::transfer::{Method, TransferOptions};

/// Default cutoff on `beta`; plane waves at or above it are discarded.
pub const BETAMAX: f64 = 0.9;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_loads() {
        let settings = load_default_config().unwrap();
        assert_eq!(settings.npass, 1);
        let options = settings.options().unwrap();
        assert_eq!(options.norm, Norm::Fft);
        assert_eq!(options.method, Method::Effective);
        assert_eq!(options.betamax, Betamax::Hard(BETAMAX));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut settings = load_default_config().unwrap();
        settings.npass = 0;
        assert!(validate_config(&settings).is_err());
        settings.npass = 3;
        settings.nin = -1.0;
        assert!(validate_config(&settings).is_err());
    }

    #[test]
    fn taper_and_strings_map_to_enums() {
        let mut settings = load_default_config().unwrap();
        settings.betamax_taper = Some(0.8);
        settings.norm = "total".to_string();
        settings.method = "full".to_string();
        let options = settings.options().unwrap();
        assert_eq!(options.betamax, Betamax::Tapered { start: 0.8, end: BETAMAX });
        assert_eq!(options.norm, Norm::Total);
        assert_eq!(options.method, Method::Full);
        settings.norm = "peak".to_string();
        assert!(settings.options().is_err());
    }
}

/// Scalar transfer parameters read from configuration files.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TransferSettings {
    pub beta: f64,
    pub phi: f64,
    pub nin: f64,
    pub nout: f64,
    pub npass: usize,
    pub nstep: usize,
    pub diffraction: bool,
    pub reflections: bool,
    pub interference: bool,
    /// One of `fft`, `local`, `total`.
    pub norm: String,
    pub reference: bool,
    pub betamax: f64,
    /// Start of a Tukey taper below `betamax`. No taper when absent.
    #[serde(default)]
    pub betamax_taper: Option<f64>,
    pub split: bool,
    /// One of `effective`, `full`.
    pub method: String,
    #[serde(default)]
    pub verbose: bool,
}

impl TransferSettings {
    /// Transfer options with the string settings parsed.
    pub fn options(&self) -> crate::error::Result<TransferOptions> {
        let betamax = match self.betamax_taper {
            Some(start) => Betamax::Tapered {
                start,
                end: self.betamax,
            },
            None => Betamax::Hard(self.betamax),
        };
        Ok(TransferOptions {
            beta: vec![self.beta],
            phi: vec![self.phi],
            nin: self.nin,
            nout: self.nout,
            npass: self.npass,
            nstep: vec![self.nstep],
            diffraction: self.diffraction,
            reflections: self.reflections,
            interference: self.interference,
            norm: self.norm.parse::<Norm>()?,
            reference: self.reference,
            window: None,
            betamax,
            split: self.split,
            method: self.method.parse::<Method>()?,
            effective_data: None,
            verbose: self.verbose,
        })
    }
}

pub fn load_default_config() -> Result<TransferSettings> {
    let root = retrieve_project_root()?;
    let default_config_file = root.join("config/default.toml");

    let settings = Config::builder()
        .add_source(File::from(default_config_file).required(true))
        .build()
        .context("Error loading configuration")?;

    let config: TransferSettings = settings
        .try_deserialize()
        .context("Error deserializing configuration")?;

    validate_config(&config)?;

    Ok(config)
}

/// Loads `config/default.toml`, overridden by `config/local.toml` when present
/// and by `LAYERLIGHT_*` environment variables.
pub fn load_config() -> Result<TransferSettings> {
    let root = retrieve_project_root()?;

    let default_config_file = root.join("config/default.toml");
    let local_config = root.join("config/local.toml");

    let mut builder = Config::builder().add_source(File::from(default_config_file).required(true));
    if local_config.exists() {
        log::info!("Using local configuration: {:?}", local_config);
        builder = builder.add_source(File::from(local_config).required(true));
    }

    let settings = builder
        .add_source(Environment::with_prefix("layerlight"))
        .build()
        .context("Error loading configuration")?;

    let config: TransferSettings = settings
        .try_deserialize()
        .context("Error deserializing configuration")?;

    validate_config(&config)?;

    log::debug!("{:#?}", config);

    Ok(config)
}

/// Retrieve the project root directory.
/// This function tries to find the project root directory in different ways:
/// 1. If the CARGO_MANIFEST_DIR environment variable is set, use it.
/// 2. If the LAYERLIGHT_ROOT_DIR environment variable is set, use it.
/// 3. If the "config" subdirectory is found in the executable directory or any of its parents, use it.
fn retrieve_project_root() -> Result<PathBuf> {
    if let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR") {
        return Ok(PathBuf::from(manifest_dir));
    }
    if let Ok(path) = env::var("LAYERLIGHT_ROOT_DIR") {
        return Ok(PathBuf::from(path));
    }
    let exe_path = env::current_exe().context("Failed to get current executable path")?;
    let mut current_dir = exe_path
        .parent()
        .context("Failed to get executable directory")?
        .to_path_buf();
    loop {
        if current_dir.join("config").is_dir() {
            return Ok(current_dir);
        }
        match current_dir.parent() {
            Some(parent) => current_dir = parent.to_path_buf(),
            None => anyhow::bail!("Could not find project root directory"),
        }
    }
}

pub fn validate_config(config: &TransferSettings) -> Result<()> {
    ensure!(config.npass >= 1, "npass must be at least 1");
    ensure!(config.nstep >= 1, "nstep must be at least 1");
    ensure!(
        config.nin > 0.0 && config.nout > 0.0,
        "Refractive indices must be greater than 0"
    );
    ensure!(config.betamax > 0.0, "betamax must be greater than 0");
    if let Some(start) = config.betamax_taper {
        ensure!(
            start > 0.0 && start < config.betamax,
            "betamax_taper must lie between 0 and betamax"
        );
    }
    ensure!(
        config.beta.abs() < config.nin,
        "beta must be smaller than the input refractive index"
    );
    Ok(())
}
