//! # Region Bundle
//!
//! A small TOML format describing a complete fitting problem: the GWAS sample size,
//! one entry per variant (identity, marginal effect, allele standard deviations) and
//! the dense LD matrix of each region, in genome order.
//!
//! ```toml
//! sample_size = 10000.0
//!
//! [[variants]]
//! chrom = "1"
//! snp = "rs123"
//! pos = 10583
//! a1 = "A"
//! a2 = "G"
//! beta_marginal = 0.012
//! std_ref = 0.41
//!
//! [[blocks]]
//! ld = [[1.0]]
//! ```

use super::store::{AlleleStd, DenseRegionStore, RegionError, VariantInfo};
use ndarray::{Array1, Array2};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Failed to read region bundle: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse region bundle TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Row {row} of block {block} has {found} entries, expected {expected}")]
    RaggedBlock {
        block: usize,
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error(
        "Target allele standard deviations must be given for all variants or none; {missing} of {total} are missing"
    )]
    PartialTargetScaling { missing: usize, total: usize },
    #[error("Invalid region data: {0}")]
    Region(#[from] RegionError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundleVariant {
    pub chrom: String,
    pub snp: String,
    pub pos: u64,
    pub a1: String,
    pub a2: String,
    pub beta_marginal: f64,
    pub std_ref: f64,
    #[serde(default)]
    pub std_target: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundleBlock {
    pub ld: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionBundle {
    pub sample_size: f64,
    pub variants: Vec<BundleVariant>,
    pub blocks: Vec<BundleBlock>,
}

impl RegionBundle {
    pub fn from_toml_str(contents: &str) -> Result<Self, BundleError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn into_store(self) -> Result<DenseRegionStore, BundleError> {
        let matrices = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(block, entry)| dense_matrix(block, entry.ld))
            .collect::<Result<Vec<_>, _>>()?;

        let total = self.variants.len();
        let missing = self
            .variants
            .iter()
            .filter(|v| v.std_target.is_none())
            .count();
        if missing != 0 && missing != total {
            return Err(BundleError::PartialTargetScaling { missing, total });
        }

        let marginal = Array1::from_iter(self.variants.iter().map(|v| v.beta_marginal));
        let reference = Array1::from_iter(self.variants.iter().map(|v| v.std_ref));
        let target = (missing == 0)
            .then(|| Array1::from_iter(self.variants.iter().filter_map(|v| v.std_target)));
        let variants = self
            .variants
            .into_iter()
            .map(|v| VariantInfo {
                chrom: v.chrom,
                snp: v.snp,
                pos: v.pos,
                a1: v.a1,
                a2: v.a2,
            })
            .collect();

        Ok(DenseRegionStore::from_dense_blocks(
            variants,
            marginal,
            matrices,
            self.sample_size,
            AlleleStd { reference, target },
        )?)
    }
}

fn dense_matrix(block: usize, rows: Vec<Vec<f64>>) -> Result<Array2<f64>, BundleError> {
    let expected = rows.len();
    let mut flat = Vec::with_capacity(expected * expected);
    for (row, values) in rows.into_iter().enumerate() {
        if values.len() != expected {
            return Err(BundleError::RaggedBlock {
                block,
                row,
                found: values.len(),
                expected,
            });
        }
        flat.extend(values);
    }
    // Row lengths were checked above, so the shape always matches.
    Array2::from_shape_vec((expected, expected), flat).map_err(|_| BundleError::RaggedBlock {
        block,
        row: 0,
        found: 0,
        expected,
    })
}

/// Reads a region bundle from disk and builds the in-memory store.
pub fn load_bundle(path: &Path) -> Result<DenseRegionStore, BundleError> {
    let contents = fs::read_to_string(path)?;
    RegionBundle::from_toml_str(&contents)?.into_store()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::store::{RegionStore, ScalingMode};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TWO_REGION_BUNDLE: &str = r#"
sample_size = 5000.0

[[variants]]
chrom = "1"
snp = "rs1"
pos = 100
a1 = "A"
a2 = "G"
beta_marginal = 0.05
std_ref = 0.5

[[variants]]
chrom = "1"
snp = "rs2"
pos = 200
a1 = "C"
a2 = "T"
beta_marginal = -0.02
std_ref = 0.25

[[variants]]
chrom = "1"
snp = "rs3"
pos = 300
a1 = "G"
a2 = "A"
beta_marginal = 0.01
std_ref = 0.4

[[blocks]]
ld = [[1.0]]

[[blocks]]
ld = [[1.0, 0.3], [0.3, 1.0]]
"#;

    #[test]
    fn bundle_loads_into_store() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", TWO_REGION_BUNDLE).unwrap();
        file.flush().unwrap();

        let store = load_bundle(file.path()).unwrap();
        assert_eq!(store.region_count(), 2);
        assert_eq!(store.region_range(1), 1..3);
        assert_eq!(store.sample_size(), 5000.0);
        assert_eq!(store.variants()[2].snp, "rs3");
        assert_eq!(
            store.allele_std(ScalingMode::Reference).unwrap().to_vec(),
            vec![0.5, 0.25, 0.4]
        );
        assert!(store.allele_std(ScalingMode::Target).is_err());
    }

    #[test]
    fn ragged_block_is_rejected() {
        let contents = TWO_REGION_BUNDLE.replace("[[1.0, 0.3], [0.3, 1.0]]", "[[1.0, 0.3], [0.3]]");
        let err = RegionBundle::from_toml_str(&contents)
            .unwrap()
            .into_store()
            .unwrap_err();
        match err {
            BundleError::RaggedBlock {
                block: 1,
                row: 1,
                found: 1,
                expected: 2,
            } => {}
            other => panic!("Expected RaggedBlock, got {:?}", other),
        }
    }

    #[test]
    fn block_sizes_must_cover_variants() {
        let contents = TWO_REGION_BUNDLE.replace("ld = [[1.0]]\n", "ld = [[1.0, 0.0], [0.0, 1.0]]\n");
        let err = RegionBundle::from_toml_str(&contents)
            .unwrap()
            .into_store()
            .unwrap_err();
        assert!(matches!(
            err,
            BundleError::Region(RegionError::LengthMismatch { .. })
        ));
    }
}
