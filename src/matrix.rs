// matrix.rs

use log::{debug, warn};
use ndarray::{Array2, ArrayView1, Axis};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::{MqtlError, Result};
use crate::results::normalize_variant_id;

/// One row of the family file.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub family_id: String,
    pub sample_id: String,
    pub paternal_id: String,
    pub maternal_id: String,
    /// 1 = male, 2 = female, 0 = unknown.
    pub sex: u8,
    /// `None` for the PLINK missing code `-9` or `NA`.
    pub phenotype: Option<f64>,
}

/// Ordered column identifiers with a fixed id -> index lookup, built once at load time.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    ids: Vec<String>,
    index: HashMap<String, usize>,
}

impl ColumnSchema {
    /// Fails with the first duplicated identifier.
    pub fn try_new(ids: Vec<String>) -> std::result::Result<Self, String> {
        let mut index = HashMap::with_capacity(ids.len());
        for (idx, id) in ids.iter().enumerate() {
            if index.insert(id.clone(), idx).is_some() {
                return Err(id.clone());
            }
        }
        Ok(Self { ids, index })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn id(&self, idx: usize) -> &str {
        &self.ids[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    fn select(&self, keep: &[usize]) -> Self {
        let ids: Vec<String> = keep.iter().map(|&idx| self.ids[idx].clone()).collect();
        let index = ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        Self { ids, index }
    }
}

/// Samples x columns of `f64` with an explicit observed mask.
///
/// Unobserved cells hold `0.0` in `values` and are never read as data; missingness is
/// carried only by `observed`, so NaN never enters a computation.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedMatrix {
    samples: Arc<[String]>,
    schema: ColumnSchema,
    values: Array2<f64>,
    observed: Array2<bool>,
}

impl MaskedMatrix {
    fn try_new(
        samples: Vec<String>,
        column_ids: Vec<String>,
        mut values: Array2<f64>,
        observed: Array2<bool>,
        what: &str,
    ) -> Result<Self> {
        let expected_shape = (samples.len(), column_ids.len());
        if values.dim() != expected_shape || observed.dim() != expected_shape {
            return Err(MqtlError::alignment(format!(
                "{} matrix shape {:?} (mask {:?}) does not match {} samples x {} columns",
                what,
                values.dim(),
                observed.dim(),
                expected_shape.0,
                expected_shape.1
            )));
        }
        let schema = ColumnSchema::try_new(column_ids).map_err(|dup| {
            MqtlError::alignment(format!("duplicate {} column identifier '{}'", what, dup))
        })?;
        let mut seen = HashMap::with_capacity(samples.len());
        for (idx, sample) in samples.iter().enumerate() {
            if let Some(first) = seen.insert(sample.as_str(), idx) {
                return Err(MqtlError::alignment(format!(
                    "duplicate sample identifier '{}' in {} matrix (rows {} and {})",
                    sample, what, first, idx
                )));
            }
        }
        for ((row, col), &is_observed) in observed.indexed_iter() {
            if is_observed && !values[[row, col]].is_finite() {
                return Err(MqtlError::numeric(format!(
                    "non-finite observed value in {} column '{}' for sample '{}'",
                    what,
                    schema.id(col),
                    samples[row]
                )));
            }
        }
        values.zip_mut_with(&observed, |v, &obs| {
            if !obs {
                *v = 0.0;
            }
        });
        Ok(Self {
            samples: samples.into(),
            schema,
            values,
            observed,
        })
    }

    fn from_rows(
        samples: Vec<String>,
        column_ids: Vec<String>,
        rows: &[Vec<Option<f64>>],
        what: &str,
    ) -> Result<Self> {
        let n_cols = column_ids.len();
        if rows.len() != samples.len() {
            return Err(MqtlError::alignment(format!(
                "{} rows supplied for {} samples",
                rows.len(),
                samples.len()
            )));
        }
        let mut values = Array2::<f64>::zeros((rows.len(), n_cols));
        let mut observed = Array2::<bool>::from_elem((rows.len(), n_cols), false);
        for (row_idx, row) in rows.iter().enumerate() {
            if row.len() != n_cols {
                return Err(MqtlError::alignment(format!(
                    "row {} of {} matrix has {} cells, expected {}",
                    row_idx,
                    what,
                    row.len(),
                    n_cols
                )));
            }
            for (col_idx, cell) in row.iter().enumerate() {
                if let Some(v) = cell {
                    values[[row_idx, col_idx]] = *v;
                    observed[[row_idx, col_idx]] = true;
                }
            }
        }
        Self::try_new(samples, column_ids, values, observed, what)
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn schema(&self) -> &ColumnSchema {
        &self.schema
    }

    pub fn n_samples(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.values.ncols()
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn observed(&self) -> &Array2<bool> {
        &self.observed
    }

    pub fn get(&self, sample_idx: usize, column_idx: usize) -> Option<f64> {
        if self.observed[[sample_idx, column_idx]] {
            Some(self.values[[sample_idx, column_idx]])
        } else {
            None
        }
    }

    pub fn column_values(&self, column_idx: usize) -> ArrayView1<'_, f64> {
        self.values.column(column_idx)
    }

    pub fn column_mask(&self, column_idx: usize) -> ArrayView1<'_, bool> {
        self.observed.column(column_idx)
    }

    /// Observed values of one column, in sample order.
    pub fn observed_in_column(&self, column_idx: usize) -> Vec<f64> {
        self.values
            .column(column_idx)
            .iter()
            .zip(self.observed.column(column_idx).iter())
            .filter_map(|(&v, &obs)| if obs { Some(v) } else { None })
            .collect()
    }

    pub fn observed_count(&self, column_idx: usize) -> usize {
        self.observed.column(column_idx).iter().filter(|&&obs| obs).count()
    }

    /// Same samples and columns with new cell contents.
    fn with_data(&self, values: Array2<f64>, observed: Array2<bool>) -> Self {
        debug_assert_eq!(values.dim(), self.values.dim());
        debug_assert_eq!(observed.dim(), self.observed.dim());
        Self {
            samples: Arc::clone(&self.samples),
            schema: self.schema.clone(),
            values,
            observed,
        }
    }

    fn select_columns(&self, keep: &[usize]) -> Self {
        Self {
            samples: Arc::clone(&self.samples),
            schema: self.schema.select(keep),
            values: self.values.select(Axis(1), keep),
            observed: self.observed.select(Axis(1), keep),
        }
    }
}

/// Samples x metabolites.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaboliteMatrix(MaskedMatrix);

impl MetaboliteMatrix {
    pub fn try_new(
        samples: Vec<String>,
        metabolite_ids: Vec<String>,
        values: Array2<f64>,
        observed: Array2<bool>,
    ) -> Result<Self> {
        MaskedMatrix::try_new(samples, metabolite_ids, values, observed, "metabolite").map(Self)
    }

    pub fn from_rows(
        samples: Vec<String>,
        metabolite_ids: Vec<String>,
        rows: &[Vec<Option<f64>>],
    ) -> Result<Self> {
        MaskedMatrix::from_rows(samples, metabolite_ids, rows, "metabolite").map(Self)
    }

    pub fn n_metabolites(&self) -> usize {
        self.0.n_columns()
    }

    pub fn metabolite_ids(&self) -> &[String] {
        self.0.schema.ids()
    }

    pub fn with_data(&self, values: Array2<f64>, observed: Array2<bool>) -> Self {
        Self(self.0.with_data(values, observed))
    }

    pub fn select_columns(&self, keep: &[usize]) -> Self {
        Self(self.0.select_columns(keep))
    }
}

impl Deref for MetaboliteMatrix {
    type Target = MaskedMatrix;

    fn deref(&self) -> &MaskedMatrix {
        &self.0
    }
}

/// Samples x variants of allele dosages in `[0, 2]`.
#[derive(Debug, Clone, PartialEq)]
pub struct GenotypeMatrix(MaskedMatrix);

impl GenotypeMatrix {
    pub fn try_new(
        samples: Vec<String>,
        variant_ids: Vec<String>,
        dosages: Array2<f64>,
        observed: Array2<bool>,
    ) -> Result<Self> {
        let inner = MaskedMatrix::try_new(samples, variant_ids, dosages, observed, "genotype")?;
        for ((row, col), &is_observed) in inner.observed.indexed_iter() {
            let dosage = inner.values[[row, col]];
            if is_observed && !(0.0..=2.0).contains(&dosage) {
                return Err(MqtlError::numeric(format!(
                    "dosage {} for variant '{}' sample '{}' is outside [0, 2]",
                    dosage,
                    inner.schema.id(col),
                    inner.samples[row]
                )));
            }
        }
        Ok(Self(inner))
    }

    pub fn from_rows(
        samples: Vec<String>,
        variant_ids: Vec<String>,
        rows: &[Vec<Option<f64>>],
    ) -> Result<Self> {
        let inner = MaskedMatrix::from_rows(samples, variant_ids, rows, "genotype")?;
        Self::try_new(
            inner.samples.to_vec(),
            inner.schema.ids().to_vec(),
            inner.values,
            inner.observed,
        )
    }

    pub fn n_variants(&self) -> usize {
        self.0.n_columns()
    }

    pub fn variant_ids(&self) -> &[String] {
        self.0.schema.ids()
    }

    /// Keeps the selected variants, in selection order. An exact column id wins; otherwise
    /// columns are matched on their normalized identifier (allele suffix stripped). Kept
    /// columns keep their original identifier.
    /// Selected ids with no column are returned so the caller can report them.
    pub fn restrict_to(&self, selected: &[String], separator: char) -> (Self, Vec<String>) {
        let mut by_normalized: HashMap<&str, usize> = HashMap::with_capacity(self.n_variants());
        for (idx, id) in self.variant_ids().iter().enumerate() {
            let normalized = normalize_variant_id(id, separator);
            if let Some(&first) = by_normalized.get(normalized) {
                warn!(
                    "Genotype columns '{}' and '{}' normalize to the same variant '{}'; keeping the first.",
                    self.variant_ids()[first], id, normalized
                );
                continue;
            }
            by_normalized.insert(normalized, idx);
        }

        let mut keep = Vec::with_capacity(selected.len());
        let mut absent = Vec::new();
        for id in selected {
            let column = self
                .schema()
                .index_of(id)
                .or_else(|| by_normalized.get(normalize_variant_id(id, separator)).copied());
            match column {
                Some(idx) if !keep.contains(&idx) => keep.push(idx),
                Some(_) => debug!("Variant '{}' selected twice; keeping one column.", id),
                None => absent.push(id.clone()),
            }
        }
        (Self(self.0.select_columns(&keep)), absent)
    }
}

impl Deref for GenotypeMatrix {
    type Target = MaskedMatrix;

    fn deref(&self) -> &MaskedMatrix {
        &self.0
    }
}

/// Checks that two inputs list the same sample identifiers in the same order.
pub fn check_sample_alignment(
    reference_label: &str,
    reference: &[String],
    other_label: &str,
    other: &[String],
) -> Result<()> {
    if reference.len() != other.len() {
        return Err(MqtlError::alignment(format!(
            "{} has {} samples but {} has {}",
            reference_label,
            reference.len(),
            other_label,
            other.len()
        )));
    }
    if let Some(pos) = reference.iter().zip(other.iter()).position(|(a, b)| a != b) {
        let reference_set: std::collections::HashSet<&String> = reference.iter().collect();
        let same_set = other.iter().all(|s| reference_set.contains(s));
        let kind = if same_set { "ordering" } else { "identifier set" };
        return Err(MqtlError::alignment(format!(
            "sample {} differs between {} and {}: first mismatch at row {} ('{}' vs '{}')",
            kind, reference_label, other_label, pos, reference[pos], other[pos]
        )));
    }
    Ok(())
}
