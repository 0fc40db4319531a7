//! Whole-pipeline checks: region bundle in, weight file out, through both engines and
//! the per-chromosome grouping.

use approx::assert_abs_diff_eq;
use ldshrink::config::{BurnIn, RidgeAlgo, SamplerKind};
use ldshrink::progress::{EngineKind, FitObserver, IterationReport, NoopObserver};
use ldshrink::region::{
    AlleleStd, DenseRegionStore, RegionStore, ScalingMode, VariantInfo, load_bundle,
};
use ldshrink::weights::{WeightFormat, WeightTable};
use ldshrink::{EngineConfig, EngineFit, GibbsConfig, RidgeConfig, fit_grouped, fit_weights};
use ndarray::{Array1, Array2, array};
use std::fs;
use tempfile::tempdir;

fn variants(chroms: &[&str]) -> Vec<VariantInfo> {
    chroms
        .iter()
        .enumerate()
        .map(|(i, chrom)| VariantInfo {
            chrom: chrom.to_string(),
            snp: format!("rs{}", 100 + i),
            pos: 5_000 + 250 * i as u64,
            a1: "A".to_string(),
            a2: "T".to_string(),
        })
        .collect()
}

/// Two regions: three independent variants, then a correlated pair.
fn reference_store() -> DenseRegionStore {
    DenseRegionStore::from_dense_blocks(
        variants(&["1", "1", "1", "1", "1"]),
        array![0.5, -0.3, 0.1, 0.4, -0.2],
        vec![Array2::eye(3), array![[1.0, 0.4], [0.4, 1.0]]],
        1e4,
        AlleleStd::reference_only(Array1::ones(5)),
    )
    .unwrap()
}

fn ridge(algo: RidgeAlgo) -> EngineConfig {
    EngineConfig::Ridge(RidgeConfig {
        algo,
        n_iter: 200,
        tol: 1e-8,
        seed: Some(17),
        ..RidgeConfig::default()
    })
}

#[derive(Default)]
struct Recorder {
    started: Vec<(EngineKind, usize, usize)>,
    iterations: Vec<usize>,
    finished: Option<usize>,
}

impl FitObserver for Recorder {
    fn on_start(&mut self, engine: EngineKind, total_iterations: usize, regions: usize) {
        self.started.push((engine, total_iterations, regions));
    }

    fn on_iteration(&mut self, report: &IterationReport) {
        self.iterations.push(report.iteration);
    }

    fn on_finish(&mut self, _: EngineKind, iterations: usize) {
        self.finished = Some(iterations);
    }
}

#[test]
fn em_ridge_converges_on_two_regions() {
    let store = reference_store();
    let mut recorder = Recorder::default();
    let fitted = fit_weights(&store, &ridge(RidgeAlgo::Em), ScalingMode::Reference, &mut recorder)
        .unwrap();

    let EngineFit::Ridge(fit) = &fitted.fit else {
        panic!("ridge config produced {:?}", fitted.fit.kind());
    };
    assert!(fit.converged, "EM did not converge: {:?}", fit.final_delta);
    assert!(fit.iterations < 200);
    assert!((0.0..=1.0).contains(&fit.h2), "h2 = {}", fit.h2);
    assert!(fit.beta.iter().all(|b| b.is_finite()));

    // Every effect keeps the sign of its marginal and is shrunk towards zero.
    for (joint, marginal) in fit.beta.iter().take(3).zip([0.5, -0.3, 0.1]) {
        assert_eq!(joint.signum(), f64::signum(marginal));
        assert!(joint.abs() <= marginal.abs() + 1e-12);
    }

    assert_eq!(recorder.started, vec![(EngineKind::Ridge, 200, 2)]);
    assert_eq!(recorder.iterations.len(), fit.iterations);
    assert_eq!(recorder.finished, Some(fit.iterations));
}

#[test]
fn mackay_and_em_agree_on_the_fixed_point() {
    let store = reference_store();
    let em = fit_weights(&store, &ridge(RidgeAlgo::Em), ScalingMode::Reference, &mut NoopObserver)
        .unwrap();
    let mackay = fit_weights(
        &store,
        &ridge(RidgeAlgo::MacKay),
        ScalingMode::Reference,
        &mut NoopObserver,
    )
    .unwrap();
    let (EngineFit::Ridge(em), EngineFit::Ridge(mackay)) = (&em.fit, &mackay.fit) else {
        panic!("expected two ridge fits");
    };
    assert!(mackay.converged);
    assert_abs_diff_eq!(em.h2, mackay.h2, epsilon = 1e-3);
    for (a, b) in em.beta.iter().zip(mackay.beta.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
    }
}

const BUNDLE: &str = r#"
sample_size = 20000.0

[[variants]]
chrom = "2"
snp = "rs201"
pos = 1500
a1 = "A"
a2 = "G"
beta_marginal = 0.03
std_ref = 0.5
std_target = 0.45

[[variants]]
chrom = "2"
snp = "rs202"
pos = 2500
a1 = "C"
a2 = "T"
beta_marginal = 0.025
std_ref = 0.4
std_target = 0.42

[[variants]]
chrom = "1"
snp = "rs101"
pos = 700
a1 = "G"
a2 = "C"
beta_marginal = -0.04
std_ref = 0.3
std_target = 0.35

[[blocks]]
ld = [[1.0, 0.5], [0.5, 1.0]]

[[blocks]]
ld = [[1.0]]
"#;

#[test]
fn bundle_to_weight_file_with_gibbs() {
    let dir = tempdir().unwrap();
    let bundle_path = dir.path().join("problem.toml");
    fs::write(&bundle_path, BUNDLE).unwrap();
    let store = load_bundle(&bundle_path).unwrap();
    assert_eq!(store.region_count(), 2);

    let config = EngineConfig::Gibbs(GibbsConfig {
        n_iter: 120,
        burnin: BurnIn::Fraction(0.25),
        n_slice: 2,
        sampler: SamplerKind::Bhat,
        seed: Some(3),
        ..GibbsConfig::default()
    });
    let fitted = fit_weights(&store, &config, ScalingMode::Target, &mut NoopObserver).unwrap();
    let EngineFit::Gibbs(fit) = &fitted.fit else {
        panic!("gibbs config produced {:?}", fitted.fit.kind());
    };
    assert_eq!(fit.retained, 60 - 15);

    let out = dir.path().join("fit.prstweights.tsv");
    fitted
        .table
        .write(&out, WeightFormat::from_path(&out))
        .unwrap();
    let read_back = WeightTable::read(&out).unwrap();
    assert_eq!(read_back.len(), 3);

    let snps: Vec<&str> = read_back.records().iter().map(|r| r.snp.as_str()).collect();
    assert_eq!(snps, vec!["rs101", "rs201", "rs202"]);
    let target = store.allele_std(ScalingMode::Target).unwrap();
    let rs101 = &read_back.records()[0];
    assert_abs_diff_eq!(rs101.allele_weight, rs101.raw_weight / target[2], epsilon = 1e-12);

    let legacy = dir.path().join("fit.legacyweights.tsv");
    fitted
        .table
        .write(&legacy, WeightFormat::from_path(&legacy))
        .unwrap();
    let text = fs::read_to_string(&legacy).unwrap();
    assert_eq!(text.lines().count(), 3);
    assert!(text.lines().next().unwrap().starts_with("1\trs101\t700\tG\tC\t"));
}

#[test]
fn grouped_ridge_fits_each_chromosome() {
    let store = DenseRegionStore::from_dense_blocks(
        variants(&["1", "1", "2", "2", "2"]),
        array![0.05, -0.02, 0.03, 0.01, -0.04],
        vec![
            array![[1.0, 0.2], [0.2, 1.0]],
            Array2::eye(1),
            array![[1.0, -0.3], [-0.3, 1.0]],
        ],
        5e4,
        AlleleStd::reference_only(array![0.5, 0.4, 0.3, 0.2, 0.1]),
    )
    .unwrap();
    let config = ridge(RidgeAlgo::Em);
    let grouped = fit_grouped(&store, &config, ScalingMode::Reference, &mut NoopObserver).unwrap();

    let chroms: Vec<&str> = grouped.groups.iter().map(|(c, _)| c.as_str()).collect();
    assert_eq!(chroms, vec!["1", "2"]);
    assert_eq!(grouped.groups[0].1.beta().len(), 2);
    assert_eq!(grouped.groups[1].1.beta().len(), 3);
    assert_eq!(grouped.table.len(), 5);
    assert!(grouped.table.raw_weights().iter().all(|w| w.is_finite()));
}

#[test]
fn config_file_drives_the_engine() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("engine.toml");
    fs::write(
        &path,
        "engine = \"ridge\"\nalgo = \"fixed\"\nh2 = 0.4\n",
    )
    .unwrap();
    let config = EngineConfig::from_toml_path(&path).unwrap();
    assert_eq!(config.name(), "ridge");

    let fitted = fit_weights(&reference_store(), &config, ScalingMode::Reference, &mut NoopObserver)
        .unwrap();
    let EngineFit::Ridge(fit) = &fitted.fit else {
        panic!("expected a ridge fit");
    };
    assert_eq!(fit.iterations, 1);
    assert_abs_diff_eq!(fit.h2, 0.4, epsilon = 1e-12);
}
