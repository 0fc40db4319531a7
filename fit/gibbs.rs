//! # Continuous-Shrinkage Gibbs Sampler
//!
//! Posterior means of the joint effects under the continuous-shrinkage prior
//!
//! ```text
//! beta_j ~ N(0, sigma psi_j / n),   psi_j ~ G(a, delta_j),   delta_j ~ G(b, phi)
//! ```
//!
//! Every iteration draws each region's block of effects from its conditional normal,
//! then the residual variance `sigma`, the latent `delta`, the local variances `psi`
//! (generalized inverse Gaussian) and, unless fixed, the global shrinkage `phi`.
//!
//! Region draws run in parallel. Each region gets its own stream seeded from the master
//! generator in region order, so a seeded chain is reproducible for any thread count.

use crate::config::{GibbsConfig, SamplerKind};
use crate::gig::sample_gig;
use crate::mvn::{BhatSampler, BlockDraw, BlockInput, BlockSampler, RueSampler, SldSampler};
use crate::progress::{EngineKind, FitObserver, IterationReport};
use crate::region::RegionStore;
use crate::types::{FitError, seeded_rng, visitation_order};
use ndarray::{Array1, Zip, s};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rand_distr::{Distribution, Gamma};
use rayon::prelude::*;

#[derive(Clone, Debug)]
pub struct GibbsFit {
    /// Posterior mean of the effects.
    pub beta: Array1<f64>,
    /// Posterior mean of the local variances.
    pub psi: Array1<f64>,
    pub sigma: f64,
    pub phi: f64,
    pub sampler: SamplerKind,
    pub iterations: usize,
    /// Number of draws averaged into the posterior means.
    pub retained: usize,
    /// `n/2 (1 - 2 betaᵀ beta_mrg + quad)` per iteration, when requested.
    pub scores: Vec<f64>,
}

pub fn fit_gibbs<S: RegionStore + ?Sized>(
    store: &S,
    config: &GibbsConfig,
    observer: &mut dyn FitObserver,
) -> Result<GibbsFit, FitError> {
    match config.sampler {
        SamplerKind::Rue => run_chain(store, config, &RueSampler, observer),
        SamplerKind::Bhat => run_chain(store, config, &BhatSampler, observer),
        SamplerKind::Sld => run_chain(store, config, &SldSampler, observer),
    }
}

/// Running posterior means, each draw pre-divided by the retained count.
struct PosteriorMeans {
    beta: Array1<f64>,
    psi: Array1<f64>,
    sigma: f64,
    phi: f64,
    weight: f64,
}

impl PosteriorMeans {
    fn new(p: usize, retained: usize) -> Self {
        Self {
            beta: Array1::zeros(p),
            psi: Array1::zeros(p),
            sigma: 0.0,
            phi: 0.0,
            weight: 1.0 / retained as f64,
        }
    }

    fn accumulate(&mut self, beta: &Array1<f64>, psi: &Array1<f64>, sigma: f64, phi: f64) {
        self.beta.scaled_add(self.weight, beta);
        self.psi.scaled_add(self.weight, psi);
        self.sigma += sigma * self.weight;
        self.phi += phi * self.weight;
    }
}

fn run_chain<S, B>(
    store: &S,
    config: &GibbsConfig,
    sampler: &B,
    observer: &mut dyn FitObserver,
) -> Result<GibbsFit, FitError>
where
    S: RegionStore + ?Sized,
    B: BlockSampler,
{
    let schedule = config.validate()?;
    let n = store.sample_size();
    let variants = store.variant_count();
    let p = variants as f64;
    let regions = store.region_count();
    let marginal = store.marginal();

    log::info!(
        "Sampling {} variants in {} regions (n = {}) with the {} block sampler: {} iterations, burn-in {}, thinning {}",
        variants,
        regions,
        n,
        sampler.name(),
        config.n_iter,
        schedule.burnin,
        schedule.slice
    );

    let mut rng = seeded_rng(config.seed);
    let mut beta = Array1::<f64>::zeros(variants);
    let mut psi = Array1::<f64>::ones(variants);
    let mut delta = Array1::<f64>::zeros(variants);
    let mut sigma = 1.0;
    let mut phi = config.phi.unwrap_or(1.0);
    let mut means = PosteriorMeans::new(variants, schedule.retained);
    let mut scores = Vec::new();

    let latent = Gamma::new(config.a + config.b, 1.0).map_err(FitError::distribution("latent scale"))?;

    observer.on_start(EngineKind::Gibbs, config.n_iter, regions);
    for iteration in 1..=config.n_iter {
        if observer.should_cancel() {
            return Err(FitError::Cancelled {
                completed: iteration - 1,
            });
        }

        let order = visitation_order(regions, config.shuffle, &mut rng);
        let seeds: Vec<u64> = (0..regions).map(|_| rng.next_u64()).collect();
        let draws = order
            .par_iter()
            .map(|&region| -> Result<(usize, BlockDraw), FitError> {
                let range = store.region_range(region);
                let input = BlockInput {
                    region,
                    marginal: marginal.slice(s![range.clone()]),
                    psi: psi.slice(s![range]),
                    sigma,
                    n,
                };
                let mut stream = StdRng::seed_from_u64(seeds[region]);
                sampler
                    .draw(store, &input, &mut stream)
                    .map(|draw| (region, draw))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut quad = 0.0;
        for (region, draw) in draws {
            beta.slice_mut(s![store.region_range(region)]).assign(&draw.beta);
            quad += draw.quad;
        }

        let fit_term = n / 2.0 * (1.0 - 2.0 * beta.dot(&marginal) + quad);
        let prior_term = n / 2.0
            * Zip::from(&beta)
                .and(&psi)
                .fold(0.0, |acc, &b, &v| acc + b * b / v);
        let err = fit_term.max(prior_term);
        let residual = Gamma::new((n + p) / 2.0, 1.0 / err)
            .map_err(FitError::distribution("residual precision"))?;
        sigma = 1.0 / residual.sample(&mut rng);

        for j in 0..variants {
            delta[j] = latent.sample(&mut rng) / (psi[j] + phi);
            let mut draw = sample_gig(
                config.a - 0.5,
                2.0 * delta[j],
                n * beta[j] * beta[j] / sigma,
                &mut rng,
            )?;
            if let Some(clip) = config.clip {
                draw = draw.min(clip);
            }
            psi[j] = draw;
        }

        if config.phi.is_none() {
            let auxiliary = Gamma::new(1.0, 1.0 / (phi + 1.0))
                .map_err(FitError::distribution("global scale auxiliary"))?
                .sample(&mut rng);
            phi = Gamma::new(p * config.b + 0.5, 1.0 / (delta.sum() + auxiliary))
                .map_err(FitError::distribution("global shrinkage"))?
                .sample(&mut rng);
        }

        if schedule.retains(iteration) {
            means.accumulate(&beta, &psi, sigma, phi);
        }
        if config.compute_score {
            scores.push(fit_term);
        }

        log::debug!(
            "Gibbs iteration {}: sigma = {:.5}, phi = {:.3e}",
            iteration,
            sigma,
            phi
        );
        observer.on_iteration(&IterationReport {
            engine: EngineKind::Gibbs,
            iteration,
            total: config.n_iter,
            delta: None,
            h2: None,
            sigma: Some(sigma),
            score: config.compute_score.then_some(fit_term),
        });
    }
    observer.on_finish(EngineKind::Gibbs, config.n_iter);

    log::info!(
        "Gibbs sampler finished {} iterations; posterior means over {} draws: sigma = {:.5}, phi = {:.3e}",
        config.n_iter,
        schedule.retained,
        means.sigma,
        means.phi
    );

    Ok(GibbsFit {
        beta: means.beta,
        psi: means.psi,
        sigma: means.sigma,
        phi: means.phi,
        sampler: config.sampler,
        iterations: config.n_iter,
        retained: schedule.retained,
        scores,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BurnIn;
    use crate::progress::{CancelFlag, NoopObserver};
    use crate::region::store::test_support;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn strong_signal_config(sampler: SamplerKind) -> GibbsConfig {
        GibbsConfig {
            n_iter: 400,
            burnin: BurnIn::Iterations(100),
            n_slice: 1,
            phi: Some(1.0),
            clip: None,
            sampler,
            seed: Some(2024),
            ..GibbsConfig::default()
        }
    }

    #[test]
    fn posterior_mean_recovers_strong_signal() {
        let store = test_support::store(vec![Array2::eye(3)], vec![0.3, -0.2, 0.0], 1e5);
        for sampler in [SamplerKind::Rue, SamplerKind::Bhat, SamplerKind::Sld] {
            let fit = fit_gibbs(&store, &strong_signal_config(sampler), &mut NoopObserver).unwrap();
            assert_eq!(fit.retained, 300);
            for (b, e) in fit.beta.iter().zip([0.3, -0.2, 0.0]) {
                assert_abs_diff_eq!(*b, e, epsilon = 0.01);
            }
            assert!(fit.sigma > 0.0 && fit.sigma.is_finite());
            assert_abs_diff_eq!(fit.phi, 1.0, epsilon = 1e-9);
        }
    }

    const PLANTED: [f64; 3] = [0.3, -0.2, 0.0];

    fn planted_posterior_mean(n_iter: usize, burnin: usize, seed: u64) -> GibbsFit {
        let store = test_support::store(vec![Array2::eye(3)], PLANTED.to_vec(), 1e5);
        let config = GibbsConfig {
            n_iter,
            burnin: BurnIn::Iterations(burnin),
            seed: Some(seed),
            ..strong_signal_config(SamplerKind::Rue)
        };
        fit_gibbs(&store, &config, &mut NoopObserver).unwrap()
    }

    /// Centre of a set of estimates and their pooled standard deviation across runs.
    fn centre_and_spread(estimates: &[Array1<f64>]) -> (Array1<f64>, f64) {
        let count = estimates.len() as f64;
        let centre = estimates
            .iter()
            .fold(Array1::<f64>::zeros(PLANTED.len()), |acc, b| acc + b)
            / count;
        let pooled: f64 = estimates
            .iter()
            .map(|b| (b - &centre).mapv(|d| d * d).sum())
            .sum::<f64>()
            / (count - 1.0);
        (centre, pooled.sqrt())
    }

    fn planted_error(beta: &Array1<f64>) -> f64 {
        beta.iter()
            .zip(PLANTED)
            .map(|(b, e)| (b - e) * (b - e))
            .sum::<f64>()
            .sqrt()
    }

    #[test]
    fn longer_burn_in_narrows_without_shifting_posterior_means() {
        let mut short = Vec::new();
        let mut long = Vec::new();
        for seed in 0..20 {
            let early = planted_posterior_mean(105, 5, 500 + seed);
            let late = planted_posterior_mean(400, 300, 500 + seed);
            assert_eq!(early.retained, 100);
            assert_eq!(late.retained, 100);
            short.push(early.beta);
            long.push(late.beta);
        }
        let (short_centre, short_spread) = centre_and_spread(&short);
        let (long_centre, long_spread) = centre_and_spread(&long);

        // Equal retained counts, so the spreads differ only by transient draws and
        // Monte Carlo noise across twenty seeds.
        assert!(
            long_spread <= 1.5 * short_spread,
            "burn-in 300 spread {long_spread:.3e} exceeds burn-in 5 spread {short_spread:.3e}"
        );
        for j in 0..PLANTED.len() {
            assert_abs_diff_eq!(long_centre[j], short_centre[j], epsilon = 1e-3);
            assert_abs_diff_eq!(long_centre[j], PLANTED[j], epsilon = 0.01);
        }
    }

    #[test]
    fn posterior_mean_error_does_not_grow_with_chain_length() {
        let mut short_error = 0.0;
        let mut long_error = 0.0;
        for seed in 0..5 {
            let short = planted_posterior_mean(100, 50, 40 + seed);
            let long = planted_posterior_mean(1000, 500, 40 + seed);
            short_error += planted_error(&short.beta) / 5.0;
            long_error += planted_error(&long.beta) / 5.0;
        }
        assert!(long_error < 0.01, "error after 1000 iterations: {long_error:.3e}");
        assert!(
            long_error <= short_error + 1e-3,
            "error grew from {short_error:.3e} to {long_error:.3e}"
        );
    }

    #[test]
    fn seeded_chain_is_independent_of_thread_count() {
        let store = test_support::store(
            vec![array![[1.0, 0.4], [0.4, 1.0]], Array2::eye(2), Array2::eye(1)],
            vec![0.05, 0.02, -0.03, 0.0, 0.04],
            5_000.0,
        );
        let config = GibbsConfig {
            n_iter: 60,
            burnin: BurnIn::Iterations(20),
            shuffle: true,
            seed: Some(9),
            ..GibbsConfig::default()
        };
        let run = |threads: usize| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap()
                .install(|| fit_gibbs(&store, &config, &mut NoopObserver).unwrap())
        };
        let single = run(1);
        let pooled = run(4);
        assert_eq!(single.beta, pooled.beta);
        assert_eq!(single.psi, pooled.psi);
        assert_eq!(single.phi.to_bits(), pooled.phi.to_bits());
    }

    #[test]
    fn clipped_local_variances_stay_bounded() {
        let store = test_support::store(vec![Array2::eye(2)], vec![0.3, 0.0], 1e4);
        let config = GibbsConfig {
            n_iter: 50,
            burnin: BurnIn::Iterations(10),
            clip: Some(0.5),
            compute_score: true,
            seed: Some(1),
            ..GibbsConfig::default()
        };
        let fit = fit_gibbs(&store, &config, &mut NoopObserver).unwrap();
        assert!(fit.psi.iter().all(|&v| v > 0.0 && v <= 0.5));
        assert_eq!(fit.scores.len(), 50);
        assert!(fit.phi > 0.0);
    }

    #[test]
    fn inconsistent_schedule_is_rejected_before_sampling() {
        let store = test_support::store(vec![Array2::eye(1)], vec![0.1], 100.0);
        let config = GibbsConfig {
            n_iter: 10,
            burnin: BurnIn::Iterations(8),
            n_slice: 2,
            ..GibbsConfig::default()
        };
        assert!(matches!(
            fit_gibbs(&store, &config, &mut NoopObserver),
            Err(FitError::Config(_))
        ));
    }

    #[test]
    fn cancellation_is_honoured_between_iterations() {
        let store = test_support::store(vec![Array2::eye(1)], vec![0.1], 100.0);
        let mut flag = CancelFlag::new();
        flag.cancel();
        assert!(matches!(
            fit_gibbs(&store, &GibbsConfig::default(), &mut flag),
            Err(FitError::Cancelled { completed: 0 })
        ));
    }
}
