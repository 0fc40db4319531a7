//! # Region Store
//!
//! The genome is split into independent LD blocks ("regions"). Each region owns a
//! contiguous range of the genome-wide variant ordering and carries its LD matrix in
//! the forms the engines need:
//!
//! - `Dense`: the LD matrix `D` itself.
//! - `Sqrt`: a factor `Z` with `Zᵀ Z = D`. Rows are eigenvectors scaled by the square
//!   root of their eigenvalue, sorted by descending eigenvalue.
//! - `Precision`: `D⁻¹`, with eigenvalues floored at `EIGENVALUE_FLOOR` relative to
//!   the largest one.
//! - `PrecisionSqrt`: a factor `H` with `H Hᵀ = D⁻¹`.
//!
//! The `RegionStore` trait is the only thing the engines see. `DenseRegionStore` is the
//! in-memory implementation used by the binary and the tests.

use ndarray::{Array1, Array2, ArrayView1, Axis, CowArray, Ix2, s};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Eigh, UPLO};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use thiserror::Error;

/// Relative floor applied to eigenvalues before inverting them.
pub const EIGENVALUE_FLOOR: f64 = 1.0e-10;
const SYMMETRY_TOLERANCE: f64 = 1.0e-8;

/// Representation of a region's LD matrix requested by an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MatrixForm {
    Dense,
    Sqrt,
    Precision,
    PrecisionSqrt,
}

impl MatrixForm {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Dense => "dense",
            Self::Sqrt => "square-root",
            Self::Precision => "precision",
            Self::PrecisionSqrt => "precision square-root",
        }
    }
}

impl fmt::Display for MatrixForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Source of the allele standard deviations used to rescale fitted weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMode {
    /// Standard deviations from the LD reference panel.
    #[default]
    #[serde(alias = "ref")]
    Reference,
    /// Standard deviations from the target genotypes.
    Target,
}

impl fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => f.write_str("reference"),
            Self::Target => f.write_str("target"),
        }
    }
}

impl FromStr for ScalingMode {
    type Err = RegionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ref" | "reference" => Ok(Self::Reference),
            "target" => Ok(Self::Target),
            _ => Err(RegionError::UnknownScaling(s.to_string())),
        }
    }
}

/// Identity of one variant, carried through to the weight table unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantInfo {
    pub chrom: String,
    pub snp: String,
    pub pos: u64,
    pub a1: String,
    pub a2: String,
}

#[derive(Error, Debug)]
pub enum RegionError {
    #[error("LD block must be a non-empty square matrix, found {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("LD block is not symmetric at ({row}, {col})")]
    NotSymmetric { row: usize, col: usize },
    #[error("Non-finite values (NaN or Infinity) found in {0}")]
    NonFinite(&'static str),
    #[error("Eigendecomposition of LD block failed: {0}")]
    Eigen(#[from] LinalgError),
    #[error("Region {region} is invalid: {source}")]
    Block {
        region: usize,
        #[source]
        source: Box<RegionError>,
    },
    #[error("{what} has length {found}, but the store covers {expected} variants")]
    LengthMismatch {
        what: &'static str,
        found: usize,
        expected: usize,
    },
    #[error("Sample size must be positive and finite, found {0}")]
    InvalidSampleSize(f64),
    #[error("A region store needs at least one region")]
    NoRegions,
    #[error("Region {region} does not provide the {form} form of its LD matrix")]
    MissingForm { region: usize, form: MatrixForm },
    #[error("No allele standard deviations are available for {0} scaling")]
    MissingScaling(ScalingMode),
    #[error("Unknown scaling mode '{0}', expected 'ref' or 'target'")]
    UnknownScaling(String),
    #[error("Region subset {start}..{end} is empty or out of bounds for {count} regions")]
    InvalidSubset {
        start: usize,
        end: usize,
        count: usize,
    },
}

/// Read-only access to per-region LD data and the genome-wide marginal effects.
///
/// Regions are indexed `0..region_count()` and their ranges are contiguous, ascending
/// and non-overlapping, together covering `0..variant_count()`.
pub trait RegionStore: Sync {
    fn region_count(&self) -> usize;

    fn region_range(&self, region: usize) -> Range<usize>;

    fn region_matrix(
        &self,
        region: usize,
        form: MatrixForm,
    ) -> Result<CowArray<'_, f64, Ix2>, RegionError>;

    /// Genome-wide marginal effects `beta_mrg`.
    fn marginal(&self) -> ArrayView1<'_, f64>;

    /// Effective GWAS sample size.
    fn sample_size(&self) -> f64;

    fn allele_std(&self, scaling: ScalingMode) -> Result<ArrayView1<'_, f64>, RegionError>;

    fn variants(&self) -> &[VariantInfo];

    fn region_marginal(&self, region: usize) -> ArrayView1<'_, f64> {
        let range = self.region_range(region);
        self.marginal().slice_move(s![range])
    }

    fn variant_count(&self) -> usize {
        self.marginal().len()
    }

    fn region_len(&self, region: usize) -> usize {
        self.region_range(region).len()
    }
}

/// One LD block with every derived form precomputed from a single eigendecomposition.
#[derive(Clone, Debug)]
pub struct LdBlock {
    dense: Array2<f64>,
    sqrt: Array2<f64>,
    precision: Array2<f64>,
    precision_sqrt: Array2<f64>,
    eigenvalues: Array1<f64>,
}

impl LdBlock {
    pub fn from_dense(ld: Array2<f64>) -> Result<Self, RegionError> {
        let (rows, cols) = ld.dim();
        if rows != cols || rows == 0 {
            return Err(RegionError::NotSquare { rows, cols });
        }
        if ld.iter().any(|v| !v.is_finite()) {
            return Err(RegionError::NonFinite("LD matrix"));
        }
        let scale = ld.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
        for row in 0..rows {
            for col in (row + 1)..cols {
                if (ld[[row, col]] - ld[[col, row]]).abs() > SYMMETRY_TOLERANCE * scale {
                    return Err(RegionError::NotSymmetric { row, col });
                }
            }
        }

        // eigh returns ascending eigenvalues; everything downstream expects descending.
        let (raw_values, raw_vectors) = ld.eigh(UPLO::Lower)?;
        let order: Vec<usize> = (0..rows).rev().collect();
        let eigenvalues = Array1::from_iter(order.iter().map(|&k| raw_values[k].max(0.0)));
        let eigenvectors = raw_vectors.select(Axis(1), &order);

        let floor = EIGENVALUE_FLOOR * eigenvalues[0].max(f64::MIN_POSITIVE);
        let sqrt = Array2::from_shape_fn((rows, rows), |(k, j)| {
            eigenvalues[k].sqrt() * eigenvectors[[j, k]]
        });
        let precision_sqrt = Array2::from_shape_fn((rows, rows), |(j, k)| {
            eigenvectors[[j, k]] / eigenvalues[k].max(floor).sqrt()
        });
        let precision = precision_sqrt.dot(&precision_sqrt.t());

        Ok(Self {
            dense: ld,
            sqrt,
            precision,
            precision_sqrt,
            eigenvalues,
        })
    }

    pub fn len(&self) -> usize {
        self.dense.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    /// Eigenvalues of the block, sorted descending and clamped at zero.
    pub fn eigenvalues(&self) -> ArrayView1<'_, f64> {
        self.eigenvalues.view()
    }

    fn form(&self, form: MatrixForm) -> &Array2<f64> {
        match form {
            MatrixForm::Dense => &self.dense,
            MatrixForm::Sqrt => &self.sqrt,
            MatrixForm::Precision => &self.precision,
            MatrixForm::PrecisionSqrt => &self.precision_sqrt,
        }
    }
}

/// Allele standard deviations for each scaling source.
#[derive(Clone, Debug)]
pub struct AlleleStd {
    pub reference: Array1<f64>,
    pub target: Option<Array1<f64>>,
}

impl AlleleStd {
    pub fn reference_only(reference: Array1<f64>) -> Self {
        Self {
            reference,
            target: None,
        }
    }
}

/// In-memory region store holding every block in all of its forms.
#[derive(Clone, Debug)]
pub struct DenseRegionStore {
    variants: Vec<VariantInfo>,
    marginal: Array1<f64>,
    blocks: Vec<LdBlock>,
    ranges: Vec<Range<usize>>,
    sample_size: f64,
    allele_std: AlleleStd,
}

impl DenseRegionStore {
    pub fn new(
        variants: Vec<VariantInfo>,
        marginal: Array1<f64>,
        blocks: Vec<LdBlock>,
        sample_size: f64,
        allele_std: AlleleStd,
    ) -> Result<Self, RegionError> {
        if blocks.is_empty() {
            return Err(RegionError::NoRegions);
        }
        if !(sample_size.is_finite() && sample_size > 0.0) {
            return Err(RegionError::InvalidSampleSize(sample_size));
        }

        let mut ranges = Vec::with_capacity(blocks.len());
        let mut start = 0;
        for block in &blocks {
            ranges.push(start..start + block.len());
            start += block.len();
        }
        let expected = start;

        let check_len = |what: &'static str, found: usize| {
            if found == expected {
                Ok(())
            } else {
                Err(RegionError::LengthMismatch {
                    what,
                    found,
                    expected,
                })
            }
        };
        check_len("marginal effect vector", marginal.len())?;
        check_len("variant list", variants.len())?;
        check_len("reference allele standard deviations", allele_std.reference.len())?;
        if let Some(target) = &allele_std.target {
            check_len("target allele standard deviations", target.len())?;
        }
        if marginal.iter().any(|v| !v.is_finite()) {
            return Err(RegionError::NonFinite("marginal effect vector"));
        }

        Ok(Self {
            variants,
            marginal,
            blocks,
            ranges,
            sample_size,
            allele_std,
        })
    }

    /// Builds every block's derived forms in parallel and assembles the store.
    pub fn from_dense_blocks(
        variants: Vec<VariantInfo>,
        marginal: Array1<f64>,
        matrices: Vec<Array2<f64>>,
        sample_size: f64,
        allele_std: AlleleStd,
    ) -> Result<Self, RegionError> {
        let blocks = matrices
            .into_par_iter()
            .enumerate()
            .map(|(region, ld)| {
                LdBlock::from_dense(ld).map_err(|source| RegionError::Block {
                    region,
                    source: Box::new(source),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(variants, marginal, blocks, sample_size, allele_std)
    }

    pub fn block(&self, region: usize) -> &LdBlock {
        &self.blocks[region]
    }
}

impl RegionStore for DenseRegionStore {
    fn region_count(&self) -> usize {
        self.blocks.len()
    }

    fn region_range(&self, region: usize) -> Range<usize> {
        self.ranges[region].clone()
    }

    fn region_matrix(
        &self,
        region: usize,
        form: MatrixForm,
    ) -> Result<CowArray<'_, f64, Ix2>, RegionError> {
        Ok(CowArray::from(self.blocks[region].form(form).view()))
    }

    fn marginal(&self) -> ArrayView1<'_, f64> {
        self.marginal.view()
    }

    fn sample_size(&self) -> f64 {
        self.sample_size
    }

    fn allele_std(&self, scaling: ScalingMode) -> Result<ArrayView1<'_, f64>, RegionError> {
        match scaling {
            ScalingMode::Reference => Ok(self.allele_std.reference.view()),
            ScalingMode::Target => self
                .allele_std
                .target
                .as_ref()
                .map(|target| target.view())
                .ok_or(RegionError::MissingScaling(scaling)),
        }
    }

    fn variants(&self) -> &[VariantInfo] {
        &self.variants
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn variants(chrom: &str, count: usize) -> Vec<VariantInfo> {
        (0..count)
            .map(|i| VariantInfo {
                chrom: chrom.to_string(),
                snp: format!("rs{chrom}_{i}"),
                pos: 1_000 + 10 * i as u64,
                a1: "A".to_string(),
                a2: "G".to_string(),
            })
            .collect()
    }

    pub fn store(matrices: Vec<Array2<f64>>, marginal: Vec<f64>, n: f64) -> DenseRegionStore {
        let p = marginal.len();
        DenseRegionStore::from_dense_blocks(
            variants("1", p),
            Array1::from(marginal),
            matrices,
            n,
            AlleleStd::reference_only(Array1::ones(p)),
        )
        .unwrap()
    }
}
