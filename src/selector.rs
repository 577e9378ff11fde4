// selector.rs

use log::{info, warn};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::error::{MqtlError, Result};

/// One row of the external first-pass association file.
#[derive(Debug, Clone, PartialEq)]
pub struct FirstPassResult {
    pub variant_id: String,
    /// `None` when the first-pass test reported `NA`.
    pub p_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedVariant {
    pub variant_id: String,
    pub p_value: f64,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub threshold: f64,
    /// Ascending by p-value, ties by variant id.
    pub variants: Vec<SelectedVariant>,
    pub candidates: usize,
    pub skipped_missing: usize,
    pub duplicate_ids: usize,
}

impl Selection {
    pub fn variant_ids(&self) -> Vec<String> {
        self.variants.iter().map(|v| v.variant_id.clone()).collect()
    }
}

pub fn bonferroni_threshold(alpha: f64, total_variant_count: i64) -> Result<f64> {
    if total_variant_count <= 0 {
        return Err(MqtlError::invalid_threshold(format!(
            "total variant count must be positive, got {}",
            total_variant_count
        )));
    }
    if !(alpha > 0.0 && alpha <= 1.0) {
        return Err(MqtlError::invalid_threshold(format!(
            "alpha must lie in (0, 1], got {}",
            alpha
        )));
    }
    Ok(alpha / total_variant_count as f64)
}

/// Keeps variants with `p < alpha / total_variant_count`.
pub fn select(
    results: &[FirstPassResult],
    total_variant_count: i64,
    alpha: f64,
) -> Result<Selection> {
    let threshold = bonferroni_threshold(alpha, total_variant_count)?;

    let mut best: HashMap<&str, f64> = HashMap::with_capacity(results.len());
    let mut skipped_missing = 0usize;
    let mut duplicate_ids = 0usize;
    for result in results {
        let p = match result.p_value {
            Some(p) if p.is_finite() => p,
            _ => {
                skipped_missing += 1;
                continue;
            }
        };
        match best.entry(result.variant_id.as_str()) {
            Entry::Occupied(mut existing) => {
                duplicate_ids += 1;
                if p < *existing.get() {
                    existing.insert(p);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(p);
            }
        }
    }
    if duplicate_ids > 0 {
        warn!(
            "{} duplicate variant ids in first-pass results; kept the smallest p-value for each.",
            duplicate_ids
        );
    }

    let candidates = best.len();
    let mut variants: Vec<SelectedVariant> = best
        .into_iter()
        .filter(|(_, p)| *p < threshold)
        .map(|(id, p)| SelectedVariant {
            variant_id: id.to_string(),
            p_value: p,
        })
        .collect();
    variants.sort_by(|a, b| {
        a.p_value
            .total_cmp(&b.p_value)
            .then_with(|| a.variant_id.cmp(&b.variant_id))
    });

    info!(
        "Bonferroni selection: threshold {:.3e} (alpha={} / {} variants); {} / {} candidates selected, {} missing p-values skipped.",
        threshold,
        alpha,
        total_variant_count,
        variants.len(),
        candidates,
        skipped_missing
    );
    Ok(Selection {
        threshold,
        variants,
        candidates,
        skipped_missing,
        duplicate_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, p: Option<f64>) -> FirstPassResult {
        FirstPassResult {
            variant_id: id.to_string(),
            p_value: p,
        }
    }

    #[test]
    fn threshold_boundary_is_strict() {
        let threshold: f64 = 0.05 / 67735.0;
        let just_below = f64::from_bits(threshold.to_bits() - 1);
        let results = vec![
            result("at", Some(threshold)),
            result("below", Some(just_below)),
            result("above", Some(threshold * 2.0)),
        ];
        let selection = select(&results, 67735, 0.05).unwrap();
        assert_eq!(selection.threshold, threshold);
        assert_eq!(selection.variant_ids(), vec!["below".to_string()]);
    }

    #[test]
    fn output_is_sorted_by_p_then_id() {
        let results = vec![
            result("rs3", Some(1e-9)),
            result("rs1", Some(1e-12)),
            result("rs2", Some(1e-9)),
            result("rs4", Some(0.5)),
        ];
        let selection = select(&results, 1000, 0.05).unwrap();
        assert_eq!(selection.variant_ids(), vec!["rs1", "rs2", "rs3"]);
    }

    #[test]
    fn missing_and_duplicate_p_values() {
        let results = vec![
            result("rs1", None),
            result("rs2", Some(f64::NAN)),
            result("rs3", Some(0.9)),
            result("rs3", Some(1e-10)),
        ];
        let selection = select(&results, 10, 0.05).unwrap();
        assert_eq!(selection.skipped_missing, 2);
        assert_eq!(selection.duplicate_ids, 1);
        assert_eq!(selection.variants[0].p_value, 1e-10);
    }

    #[test]
    fn non_positive_total_is_an_invalid_threshold() {
        assert!(matches!(
            select(&[], 0, 0.05),
            Err(MqtlError::InvalidThreshold { .. })
        ));
        assert!(matches!(
            select(&[], -3, 0.05),
            Err(MqtlError::InvalidThreshold { .. })
        ));
        assert!(bonferroni_threshold(0.0, 10).is_err());
    }
}
