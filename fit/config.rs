//! # Engine Configuration
//!
//! Immutable configuration values for both engines. Every field has a default, so a
//! TOML file only needs to name what it changes:
//!
//! ```toml
//! engine = "gibbs"
//! n_iter = 2000
//! burnin = 0.25
//! sampler = "sld"
//! ```
//!
//! Configurations are validated once, before any region is touched.

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown ridge algorithm '{0}', expected one of 'mackay', 'em' or 'fixed'")]
    UnknownAlgorithm(String),
    #[error("Unknown block sampler '{0}', expected one of 'rue', 'bhat' or 'sld'")]
    UnknownSampler(String),
    #[error(
        "Inconsistent sampling schedule: n_iter = {n_iter}, n_slice = {n_slice} and burn-in = {burnin} leave no retained draws (need n_iter - n_slice > burn-in)"
    )]
    InconsistentSchedule {
        n_iter: usize,
        n_slice: usize,
        burnin: usize,
    },
    #[error("'{name}' must be positive, found {value}")]
    NonPositive { name: &'static str, value: f64 },
    #[error("'{name}' must lie in {expected}, found {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        expected: &'static str,
    },
    #[error("The fixed ridge algorithm needs a heritability value 'h2'")]
    MissingHeritability,
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Hyperparameter update rule of the ridge engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum RidgeAlgo {
    MacKay,
    #[default]
    Em,
    Fixed,
}

impl FromStr for RidgeAlgo {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mackay" => Ok(Self::MacKay),
            "em" => Ok(Self::Em),
            "fixed" => Ok(Self::Fixed),
            _ => Err(ConfigError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl TryFrom<String> for RidgeAlgo {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for RidgeAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MacKay => f.write_str("mackay"),
            Self::Em => f.write_str("em"),
            Self::Fixed => f.write_str("fixed"),
        }
    }
}

/// Strategy for drawing one region's effects from its conditional normal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SamplerKind {
    /// Cholesky factor of `D + diag(1/psi)` and two triangular solves.
    #[default]
    Rue,
    /// Data augmentation on the square-root factor of `D`.
    Bhat,
    /// Precision matrix and its square root.
    Sld,
}

impl FromStr for SamplerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rue" => Ok(Self::Rue),
            "bhat" => Ok(Self::Bhat),
            "sld" => Ok(Self::Sld),
            _ => Err(ConfigError::UnknownSampler(s.to_string())),
        }
    }
}

impl TryFrom<String> for SamplerKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rue => f.write_str("rue"),
            Self::Bhat => f.write_str("bhat"),
            Self::Sld => f.write_str("sld"),
        }
    }
}

/// The ridge engine's behaviour once `algo` and `h2` have been reconciled.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RidgeMode {
    MacKay,
    Em,
    Fixed { h2: f64 },
}

impl RidgeMode {
    pub fn learns(self) -> bool {
        !matches!(self, Self::Fixed { .. })
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RidgeConfig {
    pub n_iter: usize,
    pub tol: f64,
    pub algo: RidgeAlgo,
    /// Supplying a heritability forces the fixed algorithm.
    pub h2: Option<f64>,
    pub h2start: f64,
    /// Fraction of eigenvalue mass retained per region.
    pub frac: f64,
    pub alpha_1: f64,
    pub alpha_2: f64,
    pub lambda_1: f64,
    pub lambda_2: f64,
    /// Rescale `mlambda` and `alpha` after every update so that Var(y) = 1.
    pub vary_constraint: bool,
    pub shuffle: bool,
    pub compute_score: bool,
    /// Treat a negative residual sum of squares as fatal.
    pub strict_rmse: bool,
    pub seed: Option<u64>,
}

impl Default for RidgeConfig {
    fn default() -> Self {
        Self {
            n_iter: 600,
            tol: 1e-6,
            algo: RidgeAlgo::Em,
            h2: None,
            h2start: 0.02,
            frac: 0.98,
            alpha_1: 1e-6,
            alpha_2: 1e-6,
            lambda_1: 1e-6,
            lambda_2: 1e-6,
            vary_constraint: true,
            shuffle: false,
            compute_score: false,
            strict_rmse: false,
            seed: None,
        }
    }
}

impl RidgeConfig {
    pub fn mode(&self) -> Result<RidgeMode, ConfigError> {
        match (self.h2, self.algo) {
            (Some(h2), _) => Ok(RidgeMode::Fixed { h2 }),
            (None, RidgeAlgo::Fixed) => Err(ConfigError::MissingHeritability),
            (None, RidgeAlgo::MacKay) => Ok(RidgeMode::MacKay),
            (None, RidgeAlgo::Em) => Ok(RidgeMode::Em),
        }
    }

    pub fn validate(&self) -> Result<RidgeMode, ConfigError> {
        positive("n_iter", self.n_iter as f64)?;
        positive("tol", self.tol)?;
        if let Some(h2) = self.h2 {
            within("h2", h2, "(0, 1]", h2 > 0.0 && h2 <= 1.0)?;
        }
        within(
            "h2start",
            self.h2start,
            "(0, 1)",
            self.h2start > 0.0 && self.h2start < 1.0,
        )?;
        within("frac", self.frac, "(0, 1]", self.frac > 0.0 && self.frac <= 1.0)?;
        for (name, value) in [
            ("alpha_1", self.alpha_1),
            ("alpha_2", self.alpha_2),
            ("lambda_1", self.lambda_1),
            ("lambda_2", self.lambda_2),
        ] {
            within(name, value, "[0, inf)", value.is_finite() && value >= 0.0)?;
        }
        self.mode()
    }
}

/// Burn-in length, either as a count of iterations or as a fraction of `n_iter`.
/// Values below one are fractions; larger values are truncated to a count.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum BurnIn {
    Iterations(usize),
    Fraction(f64),
}

impl BurnIn {
    pub fn iterations(self, n_iter: usize) -> usize {
        match self {
            Self::Iterations(count) => count,
            Self::Fraction(fraction) if fraction < 1.0 => (fraction * n_iter as f64) as usize,
            Self::Fraction(count) => count as usize,
        }
    }
}

impl Default for BurnIn {
    fn default() -> Self {
        Self::Fraction(0.5)
    }
}

impl FromStr for BurnIn {
    type Err = std::num::ParseFloatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f64 = s.trim().parse()?;
        Ok(if value >= 1.0 && value.fract() == 0.0 {
            Self::Iterations(value as usize)
        } else {
            Self::Fraction(value)
        })
    }
}

/// Which Gibbs iterations contribute to the posterior means. Iterations are numbered
/// from one; iteration `i` is retained when `i > burnin` and `i % slice == 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PosteriorSchedule {
    pub burnin: usize,
    pub slice: usize,
    pub retained: usize,
}

impl PosteriorSchedule {
    pub fn retains(&self, iteration: usize) -> bool {
        iteration > self.burnin && iteration % self.slice == 0
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GibbsConfig {
    pub n_iter: usize,
    pub burnin: BurnIn,
    pub n_slice: usize,
    pub a: f64,
    pub b: f64,
    /// Global shrinkage; learned from the data when absent.
    pub phi: Option<f64>,
    /// Upper bound applied to every local variance draw.
    pub clip: Option<f64>,
    pub sampler: SamplerKind,
    pub shuffle: bool,
    pub compute_score: bool,
    pub seed: Option<u64>,
}

impl Default for GibbsConfig {
    fn default() -> Self {
        Self {
            n_iter: 1000,
            burnin: BurnIn::default(),
            n_slice: 1,
            a: 1.0,
            b: 0.5,
            phi: None,
            clip: Some(1.0),
            sampler: SamplerKind::Rue,
            shuffle: false,
            compute_score: false,
            seed: None,
        }
    }
}

impl GibbsConfig {
    pub fn validate(&self) -> Result<PosteriorSchedule, ConfigError> {
        positive("n_iter", self.n_iter as f64)?;
        positive("n_slice", self.n_slice as f64)?;
        positive("a", self.a)?;
        positive("b", self.b)?;
        if let Some(phi) = self.phi {
            positive("phi", phi)?;
        }
        if let Some(clip) = self.clip {
            positive("clip", clip)?;
        }
        if let BurnIn::Fraction(fraction) = self.burnin {
            within(
                "burnin",
                fraction,
                "[0, inf)",
                fraction.is_finite() && fraction >= 0.0,
            )?;
        }
        self.schedule()
    }

    pub fn schedule(&self) -> Result<PosteriorSchedule, ConfigError> {
        let burnin = self.burnin.iterations(self.n_iter);
        let inconsistent = ConfigError::InconsistentSchedule {
            n_iter: self.n_iter,
            n_slice: self.n_slice,
            burnin,
        };
        if self.n_slice == 0 || self.n_iter <= self.n_slice || self.n_iter - self.n_slice <= burnin
        {
            return Err(inconsistent);
        }
        let retained = self.n_iter / self.n_slice - burnin / self.n_slice;
        Ok(PosteriorSchedule {
            burnin,
            slice: self.n_slice,
            retained,
        })
    }
}

/// A complete engine choice as read from a configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum EngineConfig {
    Ridge(RidgeConfig),
    Gibbs(GibbsConfig),
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Ridge(config) => config.validate().map(|_| ()),
            Self::Gibbs(config) => config.validate().map(|_| ()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ridge(_) => "ridge",
            Self::Gibbs(_) => "gibbs",
        }
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { name, value })
    }
}

fn within(
    name: &'static str,
    value: f64,
    expected: &'static str,
    inside: bool,
) -> Result<(), ConfigError> {
    if inside {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value,
            expected,
        })
    }
}
