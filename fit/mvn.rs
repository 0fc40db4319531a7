//! # Block Samplers
//!
//! Each region's effects are drawn from the conditional normal
//!
//! ```text
//! beta_i | psi, sigma ~ N(A⁻¹ beta_mrg_i, (sigma / n) A⁻¹),   A = D_i + diag(1 / psi_i)
//! ```
//!
//! Three strategies produce exactly this distribution from different forms of the LD
//! block, so the Gibbs engine picks one per fit and never mixes them.

use crate::region::{MatrixForm, RegionStore};
use crate::types::FitError;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::{Cholesky, Diag, Solve, SolveTriangular, UPLO};
use rand::Rng;
use rand_distr::StandardNormal;

/// Everything a sampler needs about one region besides its LD matrix.
#[derive(Clone, Copy, Debug)]
pub struct BlockInput<'a> {
    pub region: usize,
    /// Regional marginal effects.
    pub marginal: ArrayView1<'a, f64>,
    /// Regional local variances.
    pub psi: ArrayView1<'a, f64>,
    pub sigma: f64,
    pub n: f64,
}

#[derive(Clone, Debug)]
pub struct BlockDraw {
    pub beta: Array1<f64>,
    /// `betaᵀ (D_i + diag(1/psi_i)) beta`.
    pub quad: f64,
}

pub trait BlockSampler: Sync {
    fn name(&self) -> &'static str;

    fn draw<S, R>(&self, store: &S, input: &BlockInput<'_>, rng: &mut R) -> Result<BlockDraw, FitError>
    where
        S: RegionStore + ?Sized,
        R: Rng + ?Sized;
}

fn standard_normals<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Array1<f64> {
    Array1::from_shape_simple_fn(len, || rng.sample(StandardNormal))
}

/// `betaᵀ D beta + Σ beta_j² / psi_j`.
fn penalized_quadratic(dense: &Array2<f64>, beta: &Array1<f64>, psi: ArrayView1<'_, f64>) -> f64 {
    let ridge: f64 = beta.iter().zip(psi).map(|(b, p)| b * b / p).sum();
    beta.dot(&dense.dot(beta)) + ridge
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RueSampler;

impl BlockSampler for RueSampler {
    fn name(&self) -> &'static str {
        "rue"
    }

    fn draw<S, R>(&self, store: &S, input: &BlockInput<'_>, rng: &mut R) -> Result<BlockDraw, FitError>
    where
        S: RegionStore + ?Sized,
        R: Rng + ?Sized,
    {
        let region = input.region;
        let mut precision = store.region_matrix(region, MatrixForm::Dense)?.into_owned();
        precision
            .diag_mut()
            .zip_mut_with(&input.psi, |d, &p| *d += 1.0 / p);

        let lower = precision
            .cholesky(UPLO::Lower)
            .map_err(FitError::linalg(region, "Cholesky factorization"))?;
        let noise = standard_normals(input.psi.len(), rng);
        let whitened = lower
            .solve_triangular(UPLO::Lower, Diag::NonUnit, &input.marginal.to_owned())
            .map_err(FitError::linalg(region, "forward substitution"))?
            + noise * (input.sigma / input.n).sqrt();
        let beta = lower
            .t()
            .solve_triangular(UPLO::Upper, Diag::NonUnit, &whitened)
            .map_err(FitError::linalg(region, "back substitution"))?;

        let quad = beta.dot(&precision.dot(&beta));
        Ok(BlockDraw { beta, quad })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BhatSampler;

impl BlockSampler for BhatSampler {
    fn name(&self) -> &'static str {
        "bhat"
    }

    fn draw<S, R>(&self, store: &S, input: &BlockInput<'_>, rng: &mut R) -> Result<BlockDraw, FitError>
    where
        S: RegionStore + ?Sized,
        R: Rng + ?Sized,
    {
        let region = input.region;
        let dense = store.region_matrix(region, MatrixForm::Dense)?.into_owned();
        let factor = store.region_matrix(region, MatrixForm::Sqrt)?;
        let (sigma, n) = (input.sigma, input.n);

        let prior_var = input.psi.mapv(|p| p * sigma / n);
        let u = prior_var.mapv(f64::sqrt) * standard_normals(prior_var.len(), rng);
        let seed = standard_normals(factor.nrows(), rng);

        let rhs = input.marginal.mapv(|b| b / sigma)
            - dense.dot(&u) / sigma
            - factor.t().dot(&seed) / (sigma.sqrt() * n.sqrt());
        let mut system = &dense * &prior_var / sigma;
        system.diag_mut().mapv_inplace(|d| d + 1.0 / n);
        let solved = system
            .solve_into(rhs)
            .map_err(FitError::linalg(region, "augmented system solve"))?;
        let beta = u + prior_var * solved;

        let quad = penalized_quadratic(&dense, &beta, input.psi);
        Ok(BlockDraw { beta, quad })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SldSampler;

impl BlockSampler for SldSampler {
    fn name(&self) -> &'static str {
        "sld"
    }

    fn draw<S, R>(&self, store: &S, input: &BlockInput<'_>, rng: &mut R) -> Result<BlockDraw, FitError>
    where
        S: RegionStore + ?Sized,
        R: Rng + ?Sized,
    {
        let region = input.region;
        let dense = store.region_matrix(region, MatrixForm::Dense)?.into_owned();
        let precision = store.region_matrix(region, MatrixForm::Precision)?;
        let precision_sqrt = store.region_matrix(region, MatrixForm::PrecisionSqrt)?;
        let (sigma, n) = (input.sigma, input.n);

        let prior_var = input.psi.mapv(|p| p * sigma / n);
        let u = prior_var.mapv(f64::sqrt) * standard_normals(prior_var.len(), rng);
        let k = precision_sqrt.dot(&standard_normals(precision_sqrt.ncols(), rng));

        let rhs = precision.dot(&input.marginal) - &u - k * (sigma.sqrt() / n.sqrt());
        let mut system = precision.mapv(|v| v * sigma / n);
        system.diag_mut().zip_mut_with(&prior_var, |d, &t| *d += t);
        let solved = system
            .solve_into(rhs)
            .map_err(FitError::linalg(region, "precision system solve"))?;
        let beta = u + prior_var * solved;

        let quad = penalized_quadratic(&dense, &beta, input.psi);
        Ok(BlockDraw { beta, quad })
    }
}
