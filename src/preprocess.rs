// preprocess.rs

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::config::PreprocessConfig;
use crate::error::{MqtlError, Result};
use crate::matrix::MetaboliteMatrix;

/// Mean and sample standard deviation (n - 1) over the observed values of one column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnMoments {
    pub observed: usize,
    pub mean: f64,
    pub sd: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExcludedColumn {
    pub metabolite_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SparseColumn {
    pub metabolite_id: String,
    pub non_missing_fraction: f64,
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub matrix: MetaboliteMatrix,
    /// Zero-variance or near-empty columns removed before normalization.
    pub excluded: Vec<ExcludedColumn>,
    /// Pre-normalization moments of each retained column, in column order.
    pub moments: Vec<ColumnMoments>,
}

#[derive(Debug, Clone)]
pub struct Masked {
    pub matrix: MetaboliteMatrix,
    /// Cells masked per column, in column order.
    pub masked_cells: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct PreprocessReport {
    pub matrix: MetaboliteMatrix,
    pub excluded: Vec<ExcludedColumn>,
    pub masked: Vec<(String, usize)>,
    pub dropped: Vec<SparseColumn>,
}

impl PreprocessReport {
    pub fn total_masked_cells(&self) -> usize {
        self.masked.iter().map(|(_, n)| n).sum()
    }
}

pub fn column_moments(values: &[f64]) -> Option<ColumnMoments> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    // A constant column has sd exactly 0, whatever rounding the mean picks up.
    if values.iter().all(|&v| v == values[0]) {
        return Some(ColumnMoments {
            observed: n,
            mean: values[0],
            sd: 0.0,
        });
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    let sd = (ss / (n - 1) as f64).sqrt();
    Some(ColumnMoments {
        observed: n,
        mean,
        sd,
    })
}

fn degenerate_reason(moments: Option<&ColumnMoments>) -> Option<String> {
    match moments {
        None => Some("fewer than two observed values".to_string()),
        Some(m) if !m.sd.is_finite() || m.sd == 0.0 => {
            Some(format!("zero variance across {} observed values", m.observed))
        }
        Some(_) => None,
    }
}

fn all_column_moments(matrix: &MetaboliteMatrix) -> Vec<Option<ColumnMoments>> {
    (0..matrix.n_metabolites())
        .into_par_iter()
        .map(|j| column_moments(&matrix.observed_in_column(j)))
        .collect()
}

/// Removes columns whose standard deviation is zero or undefined.
pub fn exclude_degenerate_columns(
    matrix: &MetaboliteMatrix,
) -> (MetaboliteMatrix, Vec<ExcludedColumn>, Vec<ColumnMoments>) {
    let moments = all_column_moments(matrix);
    let mut keep = Vec::with_capacity(moments.len());
    let mut kept_moments = Vec::with_capacity(moments.len());
    let mut excluded = Vec::new();

    for (j, m) in moments.iter().enumerate() {
        let id = &matrix.metabolite_ids()[j];
        match (degenerate_reason(m.as_ref()), m) {
            (Some(reason), _) => {
                warn!("{}; excluded before normalization.", MqtlError::degenerate(id, &reason));
                excluded.push(ExcludedColumn {
                    metabolite_id: id.clone(),
                    reason,
                });
            }
            (None, Some(m)) => {
                keep.push(j);
                kept_moments.push(*m);
            }
            (None, None) => unreachable!("columns without moments are always degenerate"),
        }
    }
    (matrix.select_columns(&keep), excluded, kept_moments)
}

/// Z-scores every column from its own observed values.
pub fn normalize(matrix: &MetaboliteMatrix) -> Normalized {
    let (retained, excluded, moments) = exclude_degenerate_columns(matrix);

    let mut values = retained.values().clone();
    for (j, m) in moments.iter().enumerate() {
        let mask = retained.column_mask(j);
        for (v, &obs) in values.column_mut(j).iter_mut().zip(mask.iter()) {
            if obs {
                *v = (*v - m.mean) / m.sd;
            }
        }
    }
    debug!(
        "Normalized {} metabolite columns ({} excluded as degenerate).",
        moments.len(),
        excluded.len()
    );
    Normalized {
        matrix: retained.with_data(values, retained.observed().clone()),
        excluded,
        moments,
    }
}

/// Masks values outside `mean ± k·sd` of their column. Rows are never removed.
pub fn mask_outliers(matrix: &MetaboliteMatrix, k: f64) -> Result<Masked> {
    if !(k.is_finite() && k > 0.0) {
        return Err(MqtlError::config(format!(
            "outlier SD multiplier must be positive and finite, got {}",
            k
        )));
    }
    let moments = all_column_moments(matrix);
    let mut observed = matrix.observed().clone();
    let mut masked_cells = vec![0usize; matrix.n_metabolites()];

    for (j, m) in moments.iter().enumerate() {
        let Some(m) = m else { continue };
        if m.sd == 0.0 {
            continue;
        }
        let (lo, hi) = (m.mean - k * m.sd, m.mean + k * m.sd);
        let column = matrix.column_values(j);
        for (obs, &v) in observed.column_mut(j).iter_mut().zip(column.iter()) {
            if *obs && (v < lo || v > hi) {
                *obs = false;
                masked_cells[j] += 1;
            }
        }
    }
    Ok(Masked {
        matrix: matrix.with_data(matrix.values().clone(), observed),
        masked_cells,
    })
}

/// Drops columns whose observed fraction is below `min_fraction`.
pub fn drop_sparse_columns(
    matrix: &MetaboliteMatrix,
    min_fraction: f64,
) -> Result<(MetaboliteMatrix, Vec<SparseColumn>)> {
    if !(0.0..=1.0).contains(&min_fraction) {
        return Err(MqtlError::config(format!(
            "minimum non-missing fraction must lie in [0, 1], got {}",
            min_fraction
        )));
    }
    let n_samples = matrix.n_samples();
    let mut keep = Vec::with_capacity(matrix.n_metabolites());
    let mut dropped = Vec::new();
    for j in 0..matrix.n_metabolites() {
        let fraction = if n_samples == 0 {
            0.0
        } else {
            matrix.observed_count(j) as f64 / n_samples as f64
        };
        if fraction >= min_fraction {
            keep.push(j);
        } else {
            debug!(
                "Dropping metabolite '{}': {:.3} non-missing (< {:.3}).",
                matrix.metabolite_ids()[j],
                fraction,
                min_fraction
            );
            dropped.push(SparseColumn {
                metabolite_id: matrix.metabolite_ids()[j].clone(),
                non_missing_fraction: fraction,
            });
        }
    }
    Ok((matrix.select_columns(&keep), dropped))
}

/// normalize -> mask outliers -> drop sparse columns.
pub fn run(matrix: &MetaboliteMatrix, config: &PreprocessConfig) -> Result<PreprocessReport> {
    info!(
        "Preprocessing {} metabolites over {} samples (k={}, min non-missing={})...",
        matrix.n_metabolites(),
        matrix.n_samples(),
        config.outlier_sd_multiplier,
        config.min_non_missing_fraction
    );
    let normalized = normalize(matrix);
    let masked = mask_outliers(&normalized.matrix, config.outlier_sd_multiplier)?;
    let masked_summary: Vec<(String, usize)> = masked
        .matrix
        .metabolite_ids()
        .iter()
        .cloned()
        .zip(masked.masked_cells.iter().copied())
        .collect();
    let (cleaned, dropped) = drop_sparse_columns(&masked.matrix, config.min_non_missing_fraction)?;

    let report = PreprocessReport {
        matrix: cleaned,
        excluded: normalized.excluded,
        masked: masked_summary,
        dropped,
    };
    info!(
        "Preprocessing: {} / {} metabolites retained ({} degenerate, {} sparse, {} cells masked).",
        report.matrix.n_metabolites(),
        matrix.n_metabolites(),
        report.excluded.len(),
        report.dropped.len(),
        report.total_masked_cells()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    fn sample_names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("s{}", i)).collect()
    }

    fn matrix_from_columns(columns: &[Vec<Option<f64>>]) -> MetaboliteMatrix {
        let n = columns[0].len();
        let rows: Vec<Vec<Option<f64>>> = (0..n)
            .map(|i| columns.iter().map(|c| c[i]).collect())
            .collect();
        let ids = (0..columns.len()).map(|j| format!("m{}", j + 1)).collect();
        MetaboliteMatrix::from_rows(sample_names(n), ids, &rows).unwrap()
    }

    #[test]
    fn normalized_columns_have_zero_mean_unit_sd() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let normal = Normal::new(12.0, 4.0).unwrap();
        let col_a: Vec<Option<f64>> = (0..200)
            .map(|i| if i % 7 == 0 { None } else { Some(normal.sample(&mut rng)) })
            .collect();
        let col_b: Vec<Option<f64>> = (0..200).map(|i| Some(i as f64 * 0.5 - 3.0)).collect();
        let normalized = normalize(&matrix_from_columns(&[col_a, col_b]));

        assert!(normalized.excluded.is_empty());
        for j in 0..2 {
            let m = column_moments(&normalized.matrix.observed_in_column(j)).unwrap();
            assert!(m.mean.abs() < 1e-10, "mean {} for column {}", m.mean, j);
            assert!((m.sd - 1.0).abs() < 1e-10, "sd {} for column {}", m.sd, j);
        }
        // Missingness is untouched.
        assert_eq!(normalized.matrix.observed_count(0), 200 - 29);
    }

    #[test]
    fn degenerate_columns_are_excluded_before_normalization() {
        let constant = vec![Some(3.1); 6];
        let mostly_missing = vec![Some(1.0), None, None, None, None, None];
        let fine = vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0), None, Some(6.0)];
        let normalized = normalize(&matrix_from_columns(&[constant, mostly_missing, fine]));

        assert_eq!(normalized.matrix.metabolite_ids(), &["m3".to_string()][..]);
        let excluded: Vec<&str> = normalized
            .excluded
            .iter()
            .map(|e| e.metabolite_id.as_str())
            .collect();
        assert_eq!(excluded, vec!["m1", "m2"]);
        assert!(normalized.excluded[0].reason.contains("zero variance"));
        assert!(normalized
            .matrix
            .values()
            .iter()
            .all(|v| v.is_finite()));
    }

    #[test]
    fn tiny_scale_columns_are_normalized_not_excluded() {
        let tiny: Vec<Option<f64>> = (1..=8).map(|i| Some(i as f64 * 1e-13)).collect();
        let tiny_constant = vec![Some(5e-14); 8];
        let normalized = normalize(&matrix_from_columns(&[tiny, tiny_constant]));

        assert_eq!(normalized.matrix.metabolite_ids(), &["m1".to_string()][..]);
        assert_eq!(normalized.excluded.len(), 1);
        assert_eq!(normalized.excluded[0].metabolite_id, "m2");
        let m = column_moments(&normalized.matrix.observed_in_column(0)).unwrap();
        assert!(m.mean.abs() < 1e-10, "mean {}", m.mean);
        assert!((m.sd - 1.0).abs() < 1e-10, "sd {}", m.sd);
    }

    #[test]
    fn masked_values_stay_within_original_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let normal = Normal::new(50.0, 5.0).unwrap();
        let mut column: Vec<Option<f64>> = (0..120).map(|_| Some(normal.sample(&mut rng))).collect();
        column[3] = Some(500.0);
        column[40] = Some(-300.0);
        column[77] = None;
        let original = matrix_from_columns(&[column.clone()]);
        let k = 3.0;

        let normalized = normalize(&original);
        let masked = mask_outliers(&normalized.matrix, k).unwrap();
        let before = normalized.moments[0];

        assert_eq!(masked.matrix.n_samples(), 120);
        assert!(masked.masked_cells[0] >= 2);
        assert_eq!(masked.matrix.get(3, 0), None);
        assert_eq!(masked.matrix.get(40, 0), None);
        for i in 0..120 {
            if masked.matrix.get(i, 0).is_some() {
                let raw = column[i].unwrap();
                assert!(raw >= before.mean - k * before.sd && raw <= before.mean + k * before.sd);
            }
        }
    }

    #[test]
    fn sparse_columns_are_dropped_after_masking() {
        // Before masking m2 is 4/7 observed; masking its outlier leaves 3/7 < 0.5.
        let m1: Vec<Option<f64>> = (0..7).map(|i| Some(i as f64)).collect();
        let m2 = vec![Some(0.0), Some(0.0), Some(0.0), Some(10.0), None, None, None];
        let config = PreprocessConfig {
            outlier_sd_multiplier: 1.0,
            min_non_missing_fraction: 0.5,
        };
        let report = run(&matrix_from_columns(&[m1, m2]), &config).unwrap();

        assert_eq!(report.matrix.metabolite_ids(), &["m1".to_string()][..]);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].metabolite_id, "m2");
        assert!((report.dropped[0].non_missing_fraction - 3.0 / 7.0).abs() < 1e-12);
        assert_eq!(report.masked[1], ("m2".to_string(), 1));
    }

    #[test]
    fn fraction_exactly_at_threshold_is_kept() {
        let m1 = vec![Some(1.0), Some(2.0), None, None];
        let (kept, dropped) = drop_sparse_columns(&matrix_from_columns(&[m1]), 0.5).unwrap();
        assert_eq!(kept.n_metabolites(), 1);
        assert!(dropped.is_empty());
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let m = matrix_from_columns(&[vec![Some(1.0), Some(2.0)]]);
        assert!(mask_outliers(&m, 0.0).is_err());
        assert!(drop_sparse_columns(&m, 1.2).is_err());
    }
}
