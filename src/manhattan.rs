// manhattan.rs

use log::info;
use std::cmp::Ordering;

use crate::results::JoinedRow;

/// Natural chromosome order: autosomes numerically, then X, Y, XY, MT, then anything else.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChromosomeKey {
    Numeric(u32),
    Named(u8),
    Other(String),
}

pub fn chromosome_sort_key(chromosome: &str) -> ChromosomeKey {
    let trimmed = chromosome
        .strip_prefix("chr")
        .or_else(|| chromosome.strip_prefix("CHR"))
        .or_else(|| chromosome.strip_prefix("Chr"))
        .unwrap_or(chromosome);
    if let Ok(n) = trimmed.parse::<u32>() {
        return ChromosomeKey::Numeric(n);
    }
    match trimmed.to_ascii_uppercase().as_str() {
        "X" => ChromosomeKey::Named(0),
        "Y" => ChromosomeKey::Named(1),
        "XY" => ChromosomeKey::Named(2),
        "MT" | "M" => ChromosomeKey::Named(3),
        _ => ChromosomeKey::Other(trimmed.to_string()),
    }
}

pub fn neg_log10(p_value: f64) -> f64 {
    -p_value.max(f64::MIN_POSITIVE).log10()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManhattanPoint {
    pub variant_id: String,
    pub metabolite_id: String,
    pub chromosome: String,
    pub position: u64,
    pub p_value: f64,
    pub neg_log10_p: f64,
    /// Position shifted by the lengths of all earlier chromosomes, for a single x axis.
    pub cumulative_position: u64,
    pub label: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ManhattanTable {
    pub points: Vec<ManhattanPoint>,
    pub annotation_threshold: f64,
    /// Chromosome label and its x-axis offset, in plotting order.
    pub chromosome_offsets: Vec<(String, u64)>,
}

impl ManhattanTable {
    pub fn labelled(&self) -> impl Iterator<Item = &ManhattanPoint> {
        self.points.iter().filter(|p| p.label)
    }
}

fn compare_rows(a: &JoinedRow, b: &JoinedRow) -> Ordering {
    chromosome_sort_key(&a.chromosome)
        .cmp(&chromosome_sort_key(&b.chromosome))
        .then_with(|| a.position.cmp(&b.position))
        .then_with(|| a.variant_id.cmp(&b.variant_id))
        .then_with(|| a.metabolite_id.cmp(&b.metabolite_id))
}

/// Orders rows by (chromosome, position) and flags points whose `-log10(p)` exceeds
/// `annotation_threshold`.
pub fn prepare(rows: &[JoinedRow], annotation_threshold: f64) -> ManhattanTable {
    let mut sorted: Vec<&JoinedRow> = rows.iter().collect();
    sorted.sort_by(|a, b| compare_rows(a, b));

    let mut points = Vec::with_capacity(sorted.len());
    let mut chromosome_offsets: Vec<(String, u64)> = Vec::new();
    let mut offset = 0u64;
    let mut current_max = 0u64;

    for row in sorted {
        let starts_new_chromosome = chromosome_offsets
            .last()
            .map_or(true, |(chrom, _)| chromosome_sort_key(chrom) != chromosome_sort_key(&row.chromosome));
        if starts_new_chromosome {
            if !chromosome_offsets.is_empty() {
                offset += current_max;
            }
            current_max = 0;
            chromosome_offsets.push((row.chromosome.clone(), offset));
        }
        current_max = current_max.max(row.position);

        let neg_log10_p = neg_log10(row.p_value);
        points.push(ManhattanPoint {
            variant_id: row.variant_id.clone(),
            metabolite_id: row.metabolite_id.clone(),
            chromosome: row.chromosome.clone(),
            position: row.position,
            p_value: row.p_value,
            neg_log10_p,
            cumulative_position: offset + row.position,
            label: neg_log10_p > annotation_threshold,
        });
    }

    let table = ManhattanTable {
        points,
        annotation_threshold,
        chromosome_offsets,
    };
    info!(
        "Manhattan table: {} points over {} chromosomes, {} above -log10(p) = {:.2}.",
        table.points.len(),
        table.chromosome_offsets.len(),
        table.labelled().count(),
        annotation_threshold
    );
    table
}
