use crate::config::ConfigError;
use crate::gig::GigError;
use crate::region::{BundleError, RegionError};
use crate::weights::WeightsError;
use ndarray_linalg::error::LinalgError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;

/// Every way a fit can fail. Recoverable conditions (negative residuals outside strict
/// mode, non-convergence) are reported in the fit result instead.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Region data error: {0}")]
    Region(#[from] RegionError),
    #[error("Region bundle error: {0}")]
    Bundle(#[from] BundleError),
    #[error("Local variance draw failed: {0}")]
    Gig(#[from] GigError),
    #[error("Weight table error: {0}")]
    Weights(#[from] WeightsError),
    #[error("{operation} failed for region {region}: {source}")]
    Linalg {
        region: usize,
        operation: &'static str,
        #[source]
        source: LinalgError,
    },
    #[error("No usable decomposition is available for region {region}")]
    MissingDecomposition { region: usize },
    #[error("Could not build the {what} distribution: {reason}")]
    Distribution { what: &'static str, reason: String },
    #[error("Residual sum of squares became negative ({rmse:.6e}) at iteration {iteration}")]
    NegativeResidual { iteration: usize, rmse: f64 },
    #[error("Fit cancelled after {completed} completed iterations")]
    Cancelled { completed: usize },
}

impl FitError {
    pub(crate) fn linalg(region: usize, operation: &'static str) -> impl FnOnce(LinalgError) -> Self {
        move |source| Self::Linalg {
            region,
            operation,
            source,
        }
    }

    pub(crate) fn distribution<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> Self {
        move |err| Self::Distribution {
            what,
            reason: err.to_string(),
        }
    }
}

/// Master random source for one fit. Without a seed the stream is drawn from entropy.
pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Order in which regions are visited in one outer iteration.
pub(crate) fn visitation_order(count: usize, shuffle: bool, rng: &mut StdRng) -> Vec<usize> {
    let mut order: Vec<usize> = (0..count).collect();
    if shuffle {
        order.shuffle(rng);
    }
    order
}
