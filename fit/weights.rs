//! # Weight Table
//!
//! Fitted effects are per standardized genotype. Dividing by the allele standard
//! deviation gives the per-allele weight a scoring tool multiplies dosages by. Two file
//! layouts are written, both tab-separated:
//!
//! - `prstweights.tsv`: header `chrom snp pos A1 A2 raw_weight allele_weight`.
//! - `legacyweights.tsv`: no header, columns `chrom snp pos A1 A2 allele_weight`.

use crate::region::VariantInfo;
use ahash::AHashSet;
use csv::{ReaderBuilder, WriterBuilder};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeightsError {
    #[error("{what} has {found} entries, expected one per variant ({expected})")]
    LengthMismatch {
        what: &'static str,
        found: usize,
        expected: usize,
    },
    #[error("Fitted weight for variant '{snp}' is NaN")]
    NonFinite { snp: String },
    #[error("Allele standard deviation for variant '{snp}' must be positive, found {value}")]
    InvalidStd { snp: String, value: f64 },
    #[error("Variant '{0}' appears more than once in the weight table")]
    DuplicateVariant(String),
    #[error("Unknown weight file format '{0}', expected 'prst' or 'legacy'")]
    UnknownFormat(String),
    #[error("I/O error on weight file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Weight file CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightRecord {
    pub chrom: String,
    pub snp: String,
    pub pos: u64,
    #[serde(rename = "A1")]
    pub a1: String,
    #[serde(rename = "A2")]
    pub a2: String,
    pub raw_weight: f64,
    pub allele_weight: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WeightFormat {
    #[default]
    Prst,
    Legacy,
}

impl WeightFormat {
    /// Picks the legacy layout for files named like `*legacyweights.tsv`.
    pub fn from_path(path: &Path) -> Self {
        let legacy = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with("legacyweights.tsv"));
        if legacy { Self::Legacy } else { Self::Prst }
    }
}

impl FromStr for WeightFormat {
    type Err = WeightsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prst" | "prstweights" => Ok(Self::Prst),
            "legacy" | "legacyweights" => Ok(Self::Legacy),
            _ => Err(WeightsError::UnknownFormat(s.to_string())),
        }
    }
}

impl fmt::Display for WeightFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prst => f.write_str("prst"),
            Self::Legacy => f.write_str("legacy"),
        }
    }
}

/// Per-variant weights, unique by variant id and sorted by chromosome (natural order)
/// then position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WeightTable {
    records: Vec<WeightRecord>,
}

fn genome_order(a: &WeightRecord, b: &WeightRecord) -> Ordering {
    natord::compare(&a.chrom, &b.chrom).then(a.pos.cmp(&b.pos))
}

fn ensure_unique(records: &[WeightRecord]) -> Result<(), WeightsError> {
    let mut seen = AHashSet::with_capacity(records.len());
    for record in records {
        if !seen.insert(record.snp.as_str()) {
            return Err(WeightsError::DuplicateVariant(record.snp.clone()));
        }
    }
    Ok(())
}

impl WeightTable {
    pub fn from_raw(
        variants: &[VariantInfo],
        raw: ArrayView1<'_, f64>,
        allele_std: ArrayView1<'_, f64>,
    ) -> Result<Self, WeightsError> {
        let expected = variants.len();
        for (what, found) in [
            ("Raw weight vector", raw.len()),
            ("Allele standard deviation vector", allele_std.len()),
        ] {
            if found != expected {
                return Err(WeightsError::LengthMismatch {
                    what,
                    found,
                    expected,
                });
            }
        }

        let mut replaced = 0;
        let mut records = Vec::with_capacity(expected);
        for ((variant, &raw_weight), &std) in variants.iter().zip(raw).zip(allele_std) {
            if raw_weight.is_nan() {
                return Err(WeightsError::NonFinite {
                    snp: variant.snp.clone(),
                });
            }
            let std = if std.is_infinite() {
                replaced += 1;
                1.0
            } else {
                std
            };
            if std.is_nan() || std <= 0.0 {
                return Err(WeightsError::InvalidStd {
                    snp: variant.snp.clone(),
                    value: std,
                });
            }
            records.push(WeightRecord {
                chrom: variant.chrom.clone(),
                snp: variant.snp.clone(),
                pos: variant.pos,
                a1: variant.a1.clone(),
                a2: variant.a2.clone(),
                raw_weight,
                allele_weight: raw_weight / std,
            });
        }
        if replaced > 0 {
            log::warn!(
                "{} variants had an infinite allele standard deviation; their allele weights use a standard deviation of 1",
                replaced
            );
        }

        ensure_unique(&records)?;
        records.sort_by(genome_order);
        Ok(Self { records })
    }

    /// Joins tables fitted independently, keeping genome order and unique ids.
    pub fn concat(tables: Vec<WeightTable>) -> Result<Self, WeightsError> {
        let mut records: Vec<WeightRecord> = tables.into_iter().flat_map(|t| t.records).collect();
        ensure_unique(&records)?;
        records.sort_by(genome_order);
        Ok(Self { records })
    }

    pub fn records(&self) -> &[WeightRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn raw_weights(&self) -> Array1<f64> {
        self.records.iter().map(|r| r.raw_weight).collect()
    }

    pub fn allele_weights(&self) -> Array1<f64> {
        self.records.iter().map(|r| r.allele_weight).collect()
    }

    pub fn write(&self, path: &Path, format: WeightFormat) -> Result<(), WeightsError> {
        let mut writer = WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(format == WeightFormat::Prst)
            .from_path(path)?;
        match format {
            WeightFormat::Prst => {
                for record in &self.records {
                    writer.serialize(record)?;
                }
            }
            WeightFormat::Legacy => {
                for record in &self.records {
                    let pos = record.pos.to_string();
                    let weight = record.allele_weight.to_string();
                    writer.write_record([
                        record.chrom.as_str(),
                        record.snp.as_str(),
                        pos.as_str(),
                        record.a1.as_str(),
                        record.a2.as_str(),
                        weight.as_str(),
                    ])?;
                }
            }
        }
        writer.flush()?;
        log::info!(
            "Wrote {} weights to {} ({} format)",
            self.records.len(),
            path.display(),
            format
        );
        Ok(())
    }

    /// Reads a headered `prstweights.tsv` file.
    pub fn read(path: &Path) -> Result<Self, WeightsError> {
        let mut reader = ReaderBuilder::new().delimiter(b'\t').from_path(path)?;
        let records = reader
            .deserialize()
            .collect::<Result<Vec<WeightRecord>, _>>()?;
        ensure_unique(&records)?;
        Ok(Self { records })
    }
}
