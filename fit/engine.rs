use crate::config::EngineConfig;
use crate::gibbs::{GibbsFit, fit_gibbs};
use crate::progress::{EngineKind, FitObserver};
use crate::region::{RegionStore, RegionSubset, ScalingMode, chromosome_groups};
use crate::ridge::{RidgeFit, fit_ridge};
use crate::types::FitError;
use crate::weights::WeightTable;
use ndarray::Array1;
use std::fmt;

/// Result of whichever engine ran.
#[derive(Clone, Debug)]
pub enum EngineFit {
    Ridge(RidgeFit),
    Gibbs(GibbsFit),
}

impl EngineFit {
    pub fn kind(&self) -> EngineKind {
        match self {
            Self::Ridge(_) => EngineKind::Ridge,
            Self::Gibbs(_) => EngineKind::Gibbs,
        }
    }

    pub fn beta(&self) -> &Array1<f64> {
        match self {
            Self::Ridge(fit) => &fit.beta,
            Self::Gibbs(fit) => &fit.beta,
        }
    }

    pub fn scores(&self) -> &[f64] {
        match self {
            Self::Ridge(fit) => &fit.scores,
            Self::Gibbs(fit) => &fit.scores,
        }
    }

    pub fn summary(&self) -> FitSummary {
        match self {
            Self::Ridge(fit) => FitSummary {
                engine: EngineKind::Ridge,
                iterations: fit.iterations,
                converged: Some(fit.converged),
                h2: Some(fit.h2),
                alpha: Some(fit.alpha),
                mlambda: Some(fit.mlambda),
                sigma: None,
                phi: None,
                negative_rmse_events: fit.negative_rmse_events,
            },
            Self::Gibbs(fit) => FitSummary {
                engine: EngineKind::Gibbs,
                iterations: fit.iterations,
                converged: None,
                h2: None,
                alpha: None,
                mlambda: None,
                sigma: Some(fit.sigma),
                phi: Some(fit.phi),
                negative_rmse_events: 0,
            },
        }
    }
}

/// Final diagnostics of one fit, in a form shared by both engines.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FitSummary {
    pub engine: EngineKind,
    pub iterations: usize,
    pub converged: Option<bool>,
    pub h2: Option<f64>,
    pub alpha: Option<f64>,
    pub mlambda: Option<f64>,
    pub sigma: Option<f64>,
    pub phi: Option<f64>,
    pub negative_rmse_events: usize,
}

impl fmt::Display for FitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} iterations", self.engine, self.iterations)?;
        if let Some(converged) = self.converged {
            write!(f, ", converged = {}", converged)?;
        }
        let values = [
            ("h2", self.h2),
            ("alpha", self.alpha),
            ("mlambda", self.mlambda),
            ("sigma", self.sigma),
            ("phi", self.phi),
        ];
        for (name, value) in values {
            if let Some(value) = value {
                write!(f, ", {} = {:.5e}", name, value)?;
            }
        }
        if self.negative_rmse_events > 0 {
            write!(f, ", negative rmse events = {}", self.negative_rmse_events)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct FittedWeights {
    pub table: WeightTable,
    pub fit: EngineFit,
}

/// Runs the configured engine over the whole store and builds the weight table.
pub fn fit_weights<S: RegionStore + ?Sized>(
    store: &S,
    config: &EngineConfig,
    scaling: ScalingMode,
    observer: &mut dyn FitObserver,
) -> Result<FittedWeights, FitError> {
    let allele_std = store.allele_std(scaling)?;
    let fit = match config {
        EngineConfig::Ridge(config) => EngineFit::Ridge(fit_ridge(store, config, observer)?),
        EngineConfig::Gibbs(config) => EngineFit::Gibbs(fit_gibbs(store, config, observer)?),
    };
    let table = WeightTable::from_raw(store.variants(), fit.beta().view(), allele_std)?;
    Ok(FittedWeights { table, fit })
}

#[derive(Clone, Debug)]
pub struct GroupedWeights {
    pub table: WeightTable,
    /// One fit per chromosome, in genome order.
    pub groups: Vec<(String, EngineFit)>,
}

/// Fits every chromosome as an independent problem and joins the weight tables.
pub fn fit_grouped<S: RegionStore + ?Sized>(
    store: &S,
    config: &EngineConfig,
    scaling: ScalingMode,
    observer: &mut dyn FitObserver,
) -> Result<GroupedWeights, FitError> {
    let mut tables = Vec::new();
    let mut groups = Vec::new();
    for (chrom, regions) in chromosome_groups(store) {
        let subset = RegionSubset::new(store, regions)?;
        log::info!(
            "Fitting chromosome {} ({} regions, {} variants)",
            chrom,
            subset.region_count(),
            subset.variant_count()
        );
        let fitted = fit_weights(&subset, config, scaling, observer)?;
        log::info!("Chromosome {} done. {}", chrom, fitted.fit.summary());
        tables.push(fitted.table);
        groups.push((chrom, fitted.fit));
    }
    Ok(GroupedWeights {
        table: WeightTable::concat(tables)?,
        groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GibbsConfig, RidgeConfig};
    use crate::progress::NoopObserver;
    use crate::region::store::test_support;
    use crate::region::{AlleleStd, DenseRegionStore};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn two_chromosomes() -> DenseRegionStore {
        let mut variants = test_support::variants("2", 2);
        variants.extend(test_support::variants("1", 3));
        DenseRegionStore::from_dense_blocks(
            variants,
            array![0.2, -0.1, 0.3, 0.05, -0.2],
            vec![
                array![[1.0, 0.2], [0.2, 1.0]],
                Array2::eye(1),
                Array2::eye(2),
            ],
            50_000.0,
            AlleleStd::reference_only(array![0.5, 0.5, 1.0, 1.0, 2.0]),
        )
        .unwrap()
    }

    #[test]
    fn fitted_weights_follow_allele_scaling() {
        let store = two_chromosomes();
        let config = EngineConfig::Ridge(RidgeConfig {
            h2: Some(0.5),
            ..RidgeConfig::default()
        });
        let fitted = fit_weights(&store, &config, ScalingMode::Reference, &mut NoopObserver).unwrap();
        assert_eq!(fitted.table.len(), 5);
        assert_eq!(fitted.fit.kind(), EngineKind::Ridge);
        // Chromosome 1 sorts first.
        assert_eq!(fitted.table.records()[0].chrom, "1");
        for record in fitted.table.records() {
            let index = store
                .variants()
                .iter()
                .position(|v| v.snp == record.snp)
                .unwrap();
            let std = store.allele_std(ScalingMode::Reference).unwrap()[index];
            assert_abs_diff_eq!(record.raw_weight, fitted.fit.beta()[index], epsilon = 1e-15);
            assert_abs_diff_eq!(record.allele_weight, record.raw_weight / std, epsilon = 1e-15);
        }
        assert!(fitted.fit.summary().to_string().contains("converged = true"));
    }

    #[test]
    fn target_scaling_without_target_data_fails() {
        let store = two_chromosomes();
        let config = EngineConfig::Ridge(RidgeConfig::default());
        assert!(matches!(
            fit_weights(&store, &config, ScalingMode::Target, &mut NoopObserver),
            Err(FitError::Region(_))
        ));
    }

    #[test]
    fn grouped_fit_matches_per_chromosome_fits() {
        let store = two_chromosomes();
        let config = EngineConfig::Gibbs(GibbsConfig {
            n_iter: 40,
            burnin: crate::config::BurnIn::Iterations(10),
            seed: Some(5),
            ..GibbsConfig::default()
        });
        let grouped = fit_grouped(&store, &config, ScalingMode::Reference, &mut NoopObserver).unwrap();
        let names: Vec<&str> = grouped.groups.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(names, vec!["2", "1"]);
        assert_eq!(grouped.table.len(), 5);

        let second = RegionSubset::new(&store, 1..3).unwrap();
        let alone = fit_weights(&second, &config, ScalingMode::Reference, &mut NoopObserver).unwrap();
        assert_eq!(grouped.groups[1].1.beta(), alone.fit.beta());
    }
}
