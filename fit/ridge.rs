//! # Empirical-Bayes Ridge
//!
//! Point estimate of the joint effects under `beta ~ N(0, I / mlambda)` and residual
//! precision `alpha`, with both hyperparameters learned by type-II maximum likelihood.
//! Each outer iteration solves every region in closed form on its cached truncated
//! eigenbasis, then updates `mlambda` and `alpha` with either the MacKay fixed-point or
//! the EM rule. With a supplied heritability both stay constant and each region is
//! solved directly against its dense LD block.

use crate::cache::{CacheEntry, RegionCache};
use crate::config::{RidgeConfig, RidgeMode};
use crate::progress::{EngineKind, FitObserver, IterationReport};
use crate::region::{MatrixForm, RegionStore};
use crate::types::{FitError, seeded_rng, visitation_order};
use ndarray::{Array1, ArrayView1, Zip, s};
use ndarray_linalg::Solve;
use rayon::prelude::*;
use std::f64::consts::PI;

#[derive(Clone, Debug)]
pub struct RidgeFit {
    pub beta: Array1<f64>,
    pub mode: RidgeMode,
    pub h2: f64,
    pub alpha: f64,
    pub mlambda: f64,
    /// Effective number of parameters at the last iteration.
    pub gamma: f64,
    /// Var(y) implied by the genetic component, `p / (h2 mlambda)`.
    pub vary0: f64,
    /// Var(y) implied by the residual component, `1 / ((1 - h2) alpha)`.
    pub vary1: f64,
    pub iterations: usize,
    pub converged: bool,
    pub final_delta: f64,
    /// Iterations whose residual sum of squares came out negative and was floored.
    pub negative_rmse_events: usize,
    /// Log evidence per iteration, when requested.
    pub scores: Vec<f64>,
}

/// Quantities entering the log marginal likelihood at one iteration.
#[derive(Clone, Copy, Debug)]
pub struct EvidenceTerms<'a> {
    pub n: f64,
    pub p: f64,
    pub alpha: f64,
    pub mlambda: f64,
    pub rmse: f64,
    pub beta_sq: f64,
    pub eigenvalues: ArrayView1<'a, f64>,
}

pub fn log_evidence(config: &RidgeConfig, terms: &EvidenceTerms<'_>) -> f64 {
    let EvidenceTerms {
        n,
        p,
        alpha,
        mlambda,
        rmse,
        beta_sq,
        eigenvalues,
    } = *terms;
    let logdet: f64 = -eigenvalues
        .iter()
        .map(|&l| (mlambda + alpha * n * l).ln())
        .sum::<f64>();
    config.lambda_1 * mlambda.ln() - config.lambda_2 * mlambda + config.alpha_1 * alpha.ln()
        - config.alpha_2 * alpha
        + 0.5
            * (p * mlambda.ln() + n * alpha.ln() - alpha * rmse - mlambda * beta_sq + logdet
                - n * (2.0 * PI).ln())
}

/// Effective number of parameters, `Σ alpha n λ / (mlambda + alpha n λ)`.
fn effective_parameters(eigenvalues: ArrayView1<'_, f64>, n: f64, shrink: f64) -> f64 {
    eigenvalues
        .iter()
        .map(|&l| {
            let scaled = n * l;
            if scaled + shrink > 0.0 {
                scaled / (scaled + shrink)
            } else {
                0.0
            }
        })
        .sum()
}

fn heritability(mlambda: f64, alpha: f64, p: f64) -> f64 {
    1.0 / (1.0 + (mlambda / alpha) / p)
}

struct RegionSolution {
    region: usize,
    beta: Array1<f64>,
    delta_rmse: f64,
}

/// Closed-form solve on the cached eigenbasis with shrinkage `mlambda / alpha`.
fn solve_cached(entry: &CacheEntry, n: f64, p: f64, shrink: f64) -> (Array1<f64>, f64) {
    let coefficients = Zip::from(&entry.q)
        .and(&entry.eigenvalues)
        .map_collect(|&q, &l| n * q / (n * l + shrink));
    let beta = entry.basis.dot(&coefficients);
    let fitted = entry.scaled.dot(&beta);
    let len = entry.basis.nrows() as f64;
    let delta_rmse = n * fitted.dot(&fitted) - 2.0 * n * entry.beta_tilde.dot(&beta) + n * len / p;
    (beta, delta_rmse)
}

/// Direct solve of `(D + regu I) beta = beta_mrg` on the dense block.
fn solve_dense<S: RegionStore + ?Sized>(
    store: &S,
    region: usize,
    n: f64,
    p: f64,
    regu: f64,
) -> Result<(Array1<f64>, f64), FitError> {
    let dense = store.region_matrix(region, MatrixForm::Dense)?;
    let marginal = store.region_marginal(region);
    let mut system = dense.to_owned();
    system.diag_mut().mapv_inplace(|d| d + regu);
    let beta = system
        .solve(&marginal)
        .map_err(FitError::linalg(region, "ridge system solve"))?;
    let len = marginal.len() as f64;
    let delta_rmse = n * beta.dot(&dense.dot(&beta)) - 2.0 * n * marginal.dot(&beta) + n * len / p;
    Ok((beta, delta_rmse))
}

pub fn fit_ridge<S: RegionStore + ?Sized>(
    store: &S,
    config: &RidgeConfig,
    observer: &mut dyn FitObserver,
) -> Result<RidgeFit, FitError> {
    let mode = config.validate()?;
    let n = store.sample_size();
    let p = store.variant_count() as f64;
    let regions = store.region_count();

    let (mut alpha, mut mlambda) = match mode {
        RidgeMode::Fixed { h2 } => {
            let alpha = if h2 >= 1.0 {
                f64::INFINITY
            } else {
                1.0 / (1.0 - h2)
            };
            (alpha, p / h2)
        }
        RidgeMode::MacKay | RidgeMode::Em => (1.0 / (1.0 - config.h2start), p / config.h2start),
    };

    let mut cache = RegionCache::new(regions, config.frac);
    if mode.learns() || config.compute_score {
        cache.build_all(store)?;
        let kept: usize = (0..regions)
            .filter_map(|region| cache.get(region))
            .map(CacheEntry::rank)
            .sum();
        log::info!(
            "Cached eigenbases for {} regions, retaining {} of {} components (frac = {})",
            cache.built_count(),
            kept,
            p,
            config.frac
        );
    }
    let eigenvalues = cache.concatenated_eigenvalues();

    log::info!(
        "Fitting {} variants in {} regions (n = {}) with {:?} hyperparameter updates",
        p,
        regions,
        n,
        mode
    );

    let mut rng = seeded_rng(config.seed);
    let mut beta = Array1::<f64>::zeros(store.variant_count());
    let mut beta_old: Option<Array1<f64>> = None;
    let mut h2 = match mode {
        RidgeMode::Fixed { h2 } => h2,
        RidgeMode::MacKay | RidgeMode::Em => config.h2start,
    };
    let mut gamma = f64::NAN;
    let mut delta = f64::NAN;
    let mut iterations = 0;
    let mut converged = false;
    let mut negative_rmse_events = 0;
    let mut scores = Vec::new();

    observer.on_start(EngineKind::Ridge, config.n_iter, regions);
    for iteration in 1..=config.n_iter {
        if observer.should_cancel() {
            return Err(FitError::Cancelled {
                completed: iteration - 1,
            });
        }

        let order = visitation_order(regions, config.shuffle, &mut rng);
        let shrink = mlambda / alpha;
        let mut solutions = order
            .par_iter()
            .map(|&region| -> Result<RegionSolution, FitError> {
                let (beta, delta_rmse) = match mode {
                    RidgeMode::Fixed { h2 } => {
                        solve_dense(store, region, n, p, p * (1.0 - h2) / (n * h2))?
                    }
                    RidgeMode::MacKay | RidgeMode::Em => {
                        let entry = cache
                            .get(region)
                            .ok_or(FitError::MissingDecomposition { region })?;
                        solve_cached(entry, n, p, shrink)
                    }
                };
                Ok(RegionSolution {
                    region,
                    beta,
                    delta_rmse,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        solutions.sort_unstable_by_key(|solution| solution.region);

        let mut rmse = 0.0;
        for solution in &solutions {
            let range = store.region_range(solution.region);
            beta.slice_mut(s![range]).assign(&solution.beta);
            rmse += solution.delta_rmse;
        }
        // Fixed mode only reads the residual for the evidence trace.
        let tracks_rmse = mode.learns() || config.compute_score;
        if tracks_rmse && rmse < 0.0 {
            if config.strict_rmse {
                return Err(FitError::NegativeResidual { iteration, rmse });
            }
            log::warn!(
                "Negative residual sum of squares ({:.6e}) at iteration {}; using its absolute value",
                rmse,
                iteration
            );
            negative_rmse_events += 1;
            rmse = rmse.abs();
        }

        let beta_sq = beta.dot(&beta);
        if !eigenvalues.is_empty() {
            gamma = effective_parameters(eigenvalues.view(), n, shrink);
        }
        let score = config.compute_score.then(|| {
            log_evidence(
                config,
                &EvidenceTerms {
                    n,
                    p,
                    alpha,
                    mlambda,
                    rmse,
                    beta_sq,
                    eigenvalues: eigenvalues.view(),
                },
            )
        });
        scores.extend(score);

        match mode {
            RidgeMode::MacKay => {
                let next_mlambda = (gamma + 2.0 * config.lambda_1) / (beta_sq + 2.0 * config.lambda_2);
                let next_alpha = (n - gamma + 2.0 * config.alpha_1) / (rmse + 2.0 * config.alpha_2);
                mlambda = next_mlambda;
                alpha = next_alpha;
            }
            RidgeMode::Em => {
                let sigma_diag: f64 = eigenvalues
                    .iter()
                    .map(|&l| 1.0 / (n * l * alpha + mlambda))
                    .sum();
                let next_mlambda =
                    (p + 2.0 * config.lambda_1) / (beta_sq + sigma_diag + 2.0 * config.lambda_2);
                let next_alpha =
                    (n + 2.0 * config.alpha_1) / (rmse + gamma / alpha + 2.0 * config.alpha_2);
                mlambda = next_mlambda;
                alpha = next_alpha;
            }
            RidgeMode::Fixed { .. } => {}
        }

        if mode.learns() {
            h2 = heritability(mlambda, alpha, p);
            if config.vary_constraint {
                mlambda = p / h2;
                alpha = 1.0 / (1.0 - h2);
                h2 = heritability(mlambda, alpha, p);
            }
            delta = match &beta_old {
                Some(old) => (&beta - old).mapv(f64::abs).sum(),
                None => f64::NAN,
            };
        } else {
            delta = 0.0;
        }
        iterations = iteration;

        log::debug!(
            "Ridge iteration {}: delta = {:.3e}, h2 = {:.5}, rmse = {:.5e}",
            iteration,
            delta,
            h2,
            rmse
        );
        observer.on_iteration(&IterationReport {
            engine: EngineKind::Ridge,
            iteration,
            total: config.n_iter,
            delta: Some(delta),
            h2: Some(h2),
            sigma: None,
            score,
        });

        if delta < config.tol {
            converged = true;
            break;
        }
        beta_old = Some(beta.clone());
    }
    observer.on_finish(EngineKind::Ridge, iterations);

    if converged {
        log::info!(
            "Ridge fit converged after {} iterations: h2 = {:.5}, alpha = {:.5e}, mlambda = {:.5e}",
            iterations,
            h2,
            alpha,
            mlambda
        );
    } else {
        log::warn!(
            "Ridge fit did not converge within {} iterations (last delta = {:.3e}); returning the last iterate",
            config.n_iter,
            delta
        );
    }
    if negative_rmse_events > 0 {
        log::warn!(
            "The residual sum of squares was negative in {} iterations; the LD reference may not match the GWAS sample",
            negative_rmse_events
        );
    }

    Ok(RidgeFit {
        beta,
        mode,
        h2,
        alpha,
        mlambda,
        gamma,
        vary0: p / (h2 * mlambda),
        vary1: 1.0 / ((1.0 - h2) * alpha),
        iterations,
        converged,
        final_delta: delta,
        negative_rmse_events,
        scores,
    })
}
