use super::store::{MatrixForm, RegionError, RegionStore, ScalingMode, VariantInfo};
use itertools::Itertools;
use ndarray::{ArrayView1, CowArray, Ix2, s};
use std::ops::Range;

/// A contiguous run of regions from a parent store, re-indexed from zero so it can be
/// fitted as an independent problem.
pub struct RegionSubset<'a, S: RegionStore + ?Sized> {
    parent: &'a S,
    regions: Range<usize>,
    variants: Range<usize>,
}

impl<'a, S: RegionStore + ?Sized> RegionSubset<'a, S> {
    pub fn new(parent: &'a S, regions: Range<usize>) -> Result<Self, RegionError> {
        let count = parent.region_count();
        if regions.is_empty() || regions.end > count {
            return Err(RegionError::InvalidSubset {
                start: regions.start,
                end: regions.end,
                count,
            });
        }
        let variants =
            parent.region_range(regions.start).start..parent.region_range(regions.end - 1).end;
        Ok(Self {
            parent,
            regions,
            variants,
        })
    }

    /// Variant range of the subset in the parent's ordering.
    pub fn variant_range(&self) -> Range<usize> {
        self.variants.clone()
    }
}

impl<S: RegionStore + ?Sized> RegionStore for RegionSubset<'_, S> {
    fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn region_range(&self, region: usize) -> Range<usize> {
        let range = self.parent.region_range(self.regions.start + region);
        (range.start - self.variants.start)..(range.end - self.variants.start)
    }

    fn region_matrix(
        &self,
        region: usize,
        form: MatrixForm,
    ) -> Result<CowArray<'_, f64, Ix2>, RegionError> {
        self.parent.region_matrix(self.regions.start + region, form)
    }

    fn marginal(&self) -> ArrayView1<'_, f64> {
        self.parent.marginal().slice_move(s![self.variants.clone()])
    }

    fn sample_size(&self) -> f64 {
        self.parent.sample_size()
    }

    fn allele_std(&self, scaling: ScalingMode) -> Result<ArrayView1<'_, f64>, RegionError> {
        Ok(self
            .parent
            .allele_std(scaling)?
            .slice_move(s![self.variants.clone()]))
    }

    fn variants(&self) -> &[VariantInfo] {
        &self.parent.variants()[self.variants.clone()]
    }
}

/// Splits a store into maximal runs of consecutive regions on the same chromosome.
/// A region belongs to the chromosome of its first variant.
pub fn chromosome_groups<S: RegionStore + ?Sized>(store: &S) -> Vec<(String, Range<usize>)> {
    let variants = store.variants();
    let mut groups = Vec::new();
    let mut start = 0;
    for (chrom, run) in &(0..store.region_count())
        .chunk_by(|&region| variants[store.region_range(region).start].chrom.as_str())
    {
        let len = run.count();
        groups.push((chrom.to_string(), start..start + len));
        start += len;
    }
    groups
}
