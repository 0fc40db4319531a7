//! # Region Cache
//!
//! The ridge engine never needs more of a region than its truncated eigenbasis and the
//! marginal effects projected onto it. Both are computed once per region from the SVD
//! of the square-root factor `Z` (`Zᵀ Z = D`, so `D = V diag(s²) Vᵀ`) and then reused by
//! every outer iteration.

use crate::region::{EIGENVALUE_FLOOR, MatrixForm, RegionStore};
use crate::types::FitError;
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use ndarray_linalg::SVD;
use rayon::prelude::*;

/// Truncated eigen-summary of one region.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// Retained eigenvalues of `D`, sorted descending.
    pub eigenvalues: Array1<f64>,
    /// Every eigenvalue of `D`, zero-padded to the region length.
    pub full_eigenvalues: Array1<f64>,
    /// Retained eigenvectors as columns (`p_i x k`).
    pub basis: Array2<f64>,
    /// `diag(s_k) V_kᵀ`, so that `‖scaled · beta‖² = betaᵀ D beta` on the retained span.
    pub scaled: Array2<f64>,
    /// `V_kᵀ beta_mrg`.
    pub q: Array1<f64>,
    /// `V_k q`, the marginal effects projected onto the retained span.
    pub beta_tilde: Array1<f64>,
}

impl CacheEntry {
    pub fn build<S: RegionStore + ?Sized>(
        store: &S,
        region: usize,
        frac: f64,
    ) -> Result<Self, FitError> {
        let z = store.region_matrix(region, MatrixForm::Sqrt)?;
        let len = z.ncols();
        let (_, singular, vt) = z
            .svd(false, true)
            .map_err(FitError::linalg(region, "SVD of the square-root LD factor"))?;
        let vt = vt.ok_or(FitError::MissingDecomposition { region })?;

        let mut full_eigenvalues = Array1::<f64>::zeros(len);
        full_eigenvalues
            .slice_mut(s![..singular.len()])
            .assign(&singular.mapv(|sv| sv * sv));

        let kept = retained_components(full_eigenvalues.view(), frac);
        let eigenvalues = full_eigenvalues.slice(s![..kept]).to_owned();
        let leading = vt.slice(s![..kept, ..]);
        let basis = leading.t().to_owned();
        let mut scaled = leading.to_owned();
        for (mut row, sv) in scaled.axis_iter_mut(Axis(0)).zip(singular.iter()) {
            row *= *sv;
        }

        let q = leading.dot(&store.region_marginal(region));
        let beta_tilde = basis.dot(&q);

        Ok(Self {
            eigenvalues,
            full_eigenvalues,
            basis,
            scaled,
            q,
            beta_tilde,
        })
    }

    /// Number of retained components.
    pub fn rank(&self) -> usize {
        self.eigenvalues.len()
    }
}

/// Number of leading components to keep from eigenvalues sorted descending: component
/// `k` is kept while the mass before it is below `frac` of the total and it is above the
/// relative eigenvalue floor.
///
/// The component that carries the cumulative mass across `frac` is kept. A cut on the
/// cumulative sum *through* `k` (`cumsum / total <= frac`) drops it and yields one fewer
/// component: a 3x3 identity at `frac = 0.98` keeps all three here, two under that cut.
pub fn retained_components(eigenvalues: ArrayView1<'_, f64>, frac: f64) -> usize {
    let total: f64 = eigenvalues.sum();
    let largest = eigenvalues.iter().copied().fold(0.0_f64, f64::max);
    if total <= 0.0 {
        return 0;
    }
    let floor = EIGENVALUE_FLOOR * largest;
    let mut before = 0.0;
    let mut kept = 0;
    for &value in eigenvalues {
        if before >= frac * total || value <= floor {
            break;
        }
        before += value;
        kept += 1;
    }
    kept
}

#[derive(Clone, Debug, Default)]
pub enum CacheSlot {
    #[default]
    Empty,
    Built(CacheEntry),
}

/// Arena of per-region cache slots, indexed like the store's regions.
#[derive(Clone, Debug)]
pub struct RegionCache {
    slots: Vec<CacheSlot>,
    frac: f64,
}

impl RegionCache {
    pub fn new(region_count: usize, frac: f64) -> Self {
        Self {
            slots: vec![CacheSlot::Empty; region_count],
            frac,
        }
    }

    pub fn get_or_build<S: RegionStore + ?Sized>(
        &mut self,
        store: &S,
        region: usize,
    ) -> Result<&CacheEntry, FitError> {
        if let CacheSlot::Empty = self.slots[region] {
            self.slots[region] = CacheSlot::Built(CacheEntry::build(store, region, self.frac)?);
        }
        self.get(region)
            .ok_or(FitError::MissingDecomposition { region })
    }

    /// Builds every empty slot, in parallel across regions.
    pub fn build_all<S: RegionStore + ?Sized>(&mut self, store: &S) -> Result<(), FitError> {
        let frac = self.frac;
        let pending: Vec<usize> = (0..self.slots.len())
            .filter(|&region| !self.is_built(region))
            .collect();
        let entries = pending
            .par_iter()
            .map(|&region| CacheEntry::build(store, region, frac).map(|entry| (region, entry)))
            .collect::<Result<Vec<_>, _>>()?;
        for (region, entry) in entries {
            self.slots[region] = CacheSlot::Built(entry);
        }
        Ok(())
    }

    pub fn get(&self, region: usize) -> Option<&CacheEntry> {
        match &self.slots[region] {
            CacheSlot::Built(entry) => Some(entry),
            CacheSlot::Empty => None,
        }
    }

    pub fn is_built(&self, region: usize) -> bool {
        matches!(self.slots[region], CacheSlot::Built(_))
    }

    pub fn built_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, CacheSlot::Built(_)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Full eigenvalues of every built region, concatenated in region order.
    pub fn concatenated_eigenvalues(&self) -> Array1<f64> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                CacheSlot::Built(entry) => Some(entry.full_eigenvalues.iter().copied()),
                CacheSlot::Empty => None,
            })
            .flatten()
            .collect()
    }
}
