// results.rs

use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};

use crate::engine::{AssociationRecord, PairStatus};
use crate::error::MqtlError;

#[derive(Debug, Clone, PartialEq)]
pub struct VariantPosition {
    pub chromosome: String,
    pub position: u64,
}

/// Normalized variant id -> genomic position.
#[derive(Debug, Clone, Default)]
pub struct VariantMap {
    positions: HashMap<String, VariantPosition>,
}

impl VariantMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous position when the id was already mapped.
    pub fn insert(&mut self, variant_id: String, position: VariantPosition) -> Option<VariantPosition> {
        self.positions.insert(variant_id, position)
    }

    pub fn get(&self, variant_id: &str) -> Option<&VariantPosition> {
        self.positions.get(variant_id)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl FromIterator<(String, VariantPosition)> for VariantMap {
    fn from_iter<T: IntoIterator<Item = (String, VariantPosition)>>(iter: T) -> Self {
        Self {
            positions: iter.into_iter().collect(),
        }
    }
}

/// Strips the allele suffix: everything from the first `separator` on.
pub fn normalize_variant_id(id: &str, separator: char) -> &str {
    match id.find(separator) {
        Some(idx) => &id[..idx],
        None => id,
    }
}

pub fn is_significant(record: &AssociationRecord, p_threshold: f64) -> bool {
    record.status == PairStatus::Ok && record.p_value().is_some_and(|p| p < p_threshold)
}

/// Keeps `Ok` records with `p < p_threshold`.
pub fn filter<I>(records: I, p_threshold: f64) -> Vec<AssociationRecord>
where
    I: IntoIterator<Item = AssociationRecord>,
{
    records
        .into_iter()
        .filter(|r| is_significant(r, p_threshold))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    /// Normalized id, as found in the position map.
    pub variant_id: String,
    pub metabolite_id: String,
    pub p_value: f64,
    pub chromosome: String,
    pub position: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinDiagnostics {
    pub joined: usize,
    /// Rows excluded because their variant had no map entry.
    pub missing_rows: usize,
    /// Distinct unmapped variant ids, sorted.
    pub missing_variant_ids: Vec<String>,
    /// Rows without a fit; the significance filter normally removes these first.
    pub skipped_unfit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct JoinOutcome {
    pub rows: Vec<JoinedRow>,
    pub diagnostics: JoinDiagnostics,
}

/// Attaches chromosome and position to each record.
pub fn join(records: &[AssociationRecord], map: &VariantMap, separator: char) -> JoinOutcome {
    let mut outcome = JoinOutcome::default();
    let mut missing: BTreeSet<String> = BTreeSet::new();

    for record in records {
        let Some(p_value) = record.p_value() else {
            debug!(
                "Skipping {} x {} in join: status {}.",
                record.variant_id, record.metabolite_id, record.status
            );
            outcome.diagnostics.skipped_unfit += 1;
            continue;
        };
        let variant_id = normalize_variant_id(&record.variant_id, separator);
        match map.get(variant_id) {
            Some(pos) => outcome.rows.push(JoinedRow {
                variant_id: variant_id.to_string(),
                metabolite_id: record.metabolite_id.to_string(),
                p_value,
                chromosome: pos.chromosome.clone(),
                position: pos.position,
            }),
            None => {
                outcome.diagnostics.missing_rows += 1;
                if missing.insert(variant_id.to_string()) {
                    let err = MqtlError::MissingVariantMapping {
                        variant_id: variant_id.to_string(),
                    };
                    warn!("{}; excluding its rows.", err);
                }
            }
        }
    }
    outcome.diagnostics.joined = outcome.rows.len();
    outcome.diagnostics.missing_variant_ids = missing.into_iter().collect();
    info!(
        "Joined {} significant rows with positions; {} rows ({} variants) had no map entry.",
        outcome.diagnostics.joined,
        outcome.diagnostics.missing_rows,
        outcome.diagnostics.missing_variant_ids.len()
    );
    outcome
}
