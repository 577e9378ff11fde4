// output_writer.rs

use log::{info, warn};
use serde_json::json;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::engine::{AssociationRecord, PairDiagnostics};
use crate::error::{MqtlError, Result};
use crate::manhattan::ManhattanTable;
use crate::matrix::{MetaboliteMatrix, SampleRecord};
use crate::preprocess::PreprocessReport;
use crate::results::JoinDiagnostics;
use crate::selector::Selection;

pub fn output_path(prefix: &str, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}.{}", prefix, suffix))
}

fn create_output_file(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| MqtlError::io(path, e))
}

/// Creates `path`, runs `body` against a buffered writer and flushes it.
fn write_file<F>(path: &Path, body: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let mut writer = create_output_file(path)?;
    body(&mut writer)
        .and_then(|_| writer.flush())
        .map_err(|e| MqtlError::io(path, e))
}

/// File-system-safe stem for a metabolite id.
fn phenotype_file_stem(metabolite_id: &str) -> String {
    let stem: String = metabolite_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() || stem.chars().all(|c| c == '.') {
        "metabolite".to_string()
    } else {
        stem
    }
}

/// Writes one `<metabolite>.pheno` table per column (`FID IID value`, `NA` when missing)
/// plus `metabolites.txt` listing the retained metabolites and their files.
pub fn write_phenotype_tables(
    out_dir: &Path,
    samples: &[SampleRecord],
    matrix: &MetaboliteMatrix,
) -> Result<Vec<PathBuf>> {
    if samples.len() != matrix.n_samples() {
        return Err(MqtlError::alignment(format!(
            "{} family records for {} metabolite rows",
            samples.len(),
            matrix.n_samples()
        )));
    }
    fs::create_dir_all(out_dir).map_err(|e| MqtlError::io(out_dir, e))?;
    info!(
        "Writing {} phenotype tables to {}",
        matrix.n_metabolites(),
        out_dir.display()
    );

    let mut used_stems: HashSet<String> = HashSet::new();
    let mut written = Vec::with_capacity(matrix.n_metabolites());
    for (col, metabolite_id) in matrix.metabolite_ids().iter().enumerate() {
        let base = phenotype_file_stem(metabolite_id);
        let mut stem = base.clone();
        let mut n = 1;
        while !used_stems.insert(stem.clone()) {
            n += 1;
            stem = format!("{}_{}", base, n);
        }
        if stem != *metabolite_id {
            warn!("Metabolite '{}' written as {}.pheno", metabolite_id, stem);
        }
        let path = out_dir.join(format!("{}.pheno", stem));
        write_file(&path, |writer| {
            for (row, record) in samples.iter().enumerate() {
                match matrix.get(row, col) {
                    Some(value) => writeln!(writer, "{} {} {}", record.family_id, record.sample_id, value)?,
                    None => writeln!(writer, "{} {} NA", record.family_id, record.sample_id)?,
                }
            }
            Ok(())
        })?;
        written.push(path);
    }

    let list_path = out_dir.join("metabolites.txt");
    write_file(&list_path, |writer| {
        for (metabolite_id, path) in matrix.metabolite_ids().iter().zip(written.iter()) {
            let file_name = path.file_name().map(|f| f.to_string_lossy()).unwrap_or_default();
            writeln!(writer, "{}\t{}", metabolite_id, file_name)?;
        }
        Ok(())
    })?;
    Ok(written)
}

/// One selected variant id per line, in selection order.
pub fn write_significant_variants(output_prefix: &str, selection: &Selection) -> Result<PathBuf> {
    let path = output_path(output_prefix, "significant_variants.txt");
    info!(
        "Writing {} significant variants to {}",
        selection.variants.len(),
        path.display()
    );
    write_file(&path, |writer| {
        for variant in &selection.variants {
            writeln!(writer, "{}", variant.variant_id)?;
        }
        Ok(())
    })?;
    Ok(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationLayout {
    /// `variantId metaboliteId pvalue`.
    Filtered,
    /// Every record with its fit and status; `NA` where no fit exists.
    Full,
}

/// Streams association records to disk as sweeps arrive from the engine.
pub struct AssociationWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    layout: AssociationLayout,
    rows_written: usize,
}

impl AssociationWriter {
    pub fn create(output_prefix: &str, layout: AssociationLayout) -> Result<Self> {
        let suffix = match layout {
            AssociationLayout::Filtered => "associations.tsv",
            AssociationLayout::Full => "all_associations.tsv",
        };
        let path = output_path(output_prefix, suffix);
        let mut writer = create_output_file(&path)?;
        let header = match layout {
            AssociationLayout::Filtered => "variantId\tmetaboliteId\tpvalue",
            AssociationLayout::Full => {
                "variantId\tmetaboliteId\tn\tbeta\tse\tt\tpvalue\tstatus"
            }
        };
        writeln!(writer, "{}", header).map_err(|e| MqtlError::io(&path, e))?;
        Ok(Self {
            path,
            writer,
            layout,
            rows_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_records(&mut self, records: &[AssociationRecord]) -> Result<()> {
        for record in records {
            self.write_record(record)
                .map_err(|e| MqtlError::io(&self.path, e))?;
        }
        self.rows_written += records.len();
        Ok(())
    }

    fn write_record(&mut self, record: &AssociationRecord) -> std::io::Result<()> {
        let w = &mut self.writer;
        match self.layout {
            AssociationLayout::Filtered => match record.p_value() {
                Some(p) => writeln!(w, "{}\t{}\t{:.6e}", record.variant_id, record.metabolite_id, p),
                None => writeln!(w, "{}\t{}\tNA", record.variant_id, record.metabolite_id),
            },
            AssociationLayout::Full => {
                write!(w, "{}\t{}\t{}", record.variant_id, record.metabolite_id, record.complete_cases)?;
                match &record.fit {
                    Some(fit) => write!(
                        w,
                        "\t{:.6}\t{:.6}\t{:.6}\t{:.6e}",
                        fit.slope, fit.std_error, fit.t_statistic, fit.p_value
                    )?,
                    None => write!(w, "\tNA\tNA\tNA\tNA")?,
                }
                writeln!(w, "\t{}", record.status)
            }
        }
    }

    /// Flushes and returns the number of data rows written.
    pub fn finish(mut self) -> Result<usize> {
        self.writer
            .flush()
            .map_err(|e| MqtlError::io(&self.path, e))?;
        info!("Wrote {} rows to {}", self.rows_written, self.path.display());
        Ok(self.rows_written)
    }
}

/// `variantId chromosome position pvalue`, in plotting order.
pub fn write_manhattan_table(output_prefix: &str, table: &ManhattanTable) -> Result<PathBuf> {
    let path = output_path(output_prefix, "manhattan.tsv");
    info!("Writing {} Manhattan points to {}", table.points.len(), path.display());
    write_file(&path, |writer| {
        writeln!(writer, "variantId\tchromosome\tposition\tpvalue")?;
        for point in &table.points {
            writeln!(
                writer,
                "{}\t{}\t{}\t{:.6e}",
                point.variant_id, point.chromosome, point.position, point.p_value
            )?;
        }
        Ok(())
    })?;
    Ok(path)
}

/// Points above the annotation threshold, with their plotting coordinate.
pub fn write_manhattan_labels(output_prefix: &str, table: &ManhattanTable) -> Result<PathBuf> {
    let path = output_path(output_prefix, "manhattan_labels.tsv");
    write_file(&path, |writer| {
        writeln!(
            writer,
            "variantId\tmetaboliteId\tchromosome\tposition\tcumulativePosition\tpvalue\tnegLog10P"
        )?;
        for point in table.labelled() {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}\t{:.6e}\t{:.4}",
                point.variant_id,
                point.metabolite_id,
                point.chromosome,
                point.position,
                point.cumulative_position,
                point.p_value,
                point.neg_log10_p
            )?;
        }
        Ok(())
    })?;
    Ok(path)
}

/// Everything the run counted, in one place.
pub struct DiagnosticsReport<'a> {
    pub preprocess: &'a PreprocessReport,
    pub selection: &'a Selection,
    pub variants_without_genotypes: &'a [String],
    pub pairs: &'a PairDiagnostics,
    pub significant_associations: usize,
    pub join: &'a JoinDiagnostics,
    pub labelled_points: usize,
}

pub fn write_diagnostics(output_prefix: &str, report: &DiagnosticsReport<'_>) -> Result<PathBuf> {
    let path = output_path(output_prefix, "diagnostics.json");
    let excluded: Vec<serde_json::Value> = report
        .preprocess
        .excluded
        .iter()
        .map(|c| json!({ "metabolite": c.metabolite_id, "reason": c.reason }))
        .collect();
    let masked: Vec<serde_json::Value> = report
        .preprocess
        .masked
        .iter()
        .filter(|(_, cells)| *cells > 0)
        .map(|(id, cells)| json!({ "metabolite": id, "cells": cells }))
        .collect();
    let dropped: Vec<serde_json::Value> = report
        .preprocess
        .dropped
        .iter()
        .map(|c| json!({ "metabolite": c.metabolite_id, "non_missing_fraction": c.non_missing_fraction }))
        .collect();
    let value = json!({
        "preprocessing": {
            "retained_metabolites": report.preprocess.matrix.metabolite_ids(),
            "excluded": excluded,
            "masked_cells": masked,
            "dropped_sparse": dropped,
        },
        "selection": {
            "threshold": report.selection.threshold,
            "candidates": report.selection.candidates,
            "selected": report.selection.variants.len(),
            "skipped_missing_p": report.selection.skipped_missing,
            "duplicate_ids": report.selection.duplicate_ids,
            "without_genotypes": report.variants_without_genotypes,
        },
        "pairs": {
            "total": report.pairs.total(),
            "ok": report.pairs.ok,
            "insufficient_data": report.pairs.insufficient_data,
            "numeric_error": report.pairs.numeric_error,
        },
        "significant_associations": report.significant_associations,
        "join": {
            "joined": report.join.joined,
            "missing_rows": report.join.missing_rows,
            "missing_variant_ids": report.join.missing_variant_ids,
            "skipped_unfit": report.join.skipped_unfit,
        },
        "labelled_points": report.labelled_points,
    });
    write_file(&path, |writer| {
        serde_json::to_writer_pretty(&mut *writer, &value).map_err(std::io::Error::from)?;
        writeln!(writer)
    })?;
    info!("Wrote run diagnostics to {}", path.display());
    Ok(path)
}
