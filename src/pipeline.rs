// pipeline.rs
//
// End-to-end runs: `prepare` writes cleaned phenotype tables for the external first-pass
// test, `scan` selects variants from that test and runs the pairwise association scan.

use indicatif::ProgressBar;
use log::{info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use crate::config::{AnalysisConfig, PreprocessConfig};
use crate::engine::{AssociationEngine, AssociationRecord, CancellationToken, MetaboliteSweep, PairDiagnostics};
use crate::error::{MqtlError, Result};
use crate::io::output_writer::{self, AssociationLayout, AssociationWriter, DiagnosticsReport};
use crate::io::readers::{self, FirstPassColumns};
use crate::manhattan;
use crate::matrix::{check_sample_alignment, GenotypeMatrix, MetaboliteMatrix, SampleRecord};
use crate::preprocess;
use crate::results::{self, normalize_variant_id};
use crate::selector;

#[derive(Debug, Clone)]
pub enum GenotypeSource {
    /// PLINK `--recode A` text dosages.
    Raw(PathBuf),
    /// PLINK `.bed` with its `.bim`/`.fam` alongside.
    Bed(PathBuf),
}

#[derive(Debug, Clone)]
pub struct PrepareInputs {
    pub family_path: PathBuf,
    pub metabolite_path: PathBuf,
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ScanInputs {
    pub family_path: PathBuf,
    pub metabolite_path: PathBuf,
    pub genotypes: GenotypeSource,
    pub map_path: PathBuf,
    pub first_pass_path: PathBuf,
    pub first_pass_columns: FirstPassColumns,
    pub output_prefix: String,
    /// Also write every tested pair with its status.
    pub write_all: bool,
}

#[derive(Debug, Clone)]
pub struct PrepareSummary {
    pub retained_metabolites: usize,
    pub phenotype_files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub metabolites: usize,
    pub selected_variants: usize,
    pub tested_variants: usize,
    pub pairs: PairDiagnostics,
    pub significant: usize,
    pub joined: usize,
    pub missing_mappings: usize,
    pub labelled: usize,
    pub outputs: Vec<PathBuf>,
}

/// Reads the family and metabolite files and checks they list the same samples in order.
pub fn load_aligned_metabolites(
    family_path: &Path,
    metabolite_path: &Path,
) -> Result<(Vec<SampleRecord>, MetaboliteMatrix)> {
    let samples = readers::read_family_file(family_path)?;
    let metabolites = readers::read_metabolite_file(metabolite_path)?;
    let family_ids: Vec<String> = samples.iter().map(|s| s.sample_id.clone()).collect();
    check_sample_alignment("family file", &family_ids, "metabolite file", metabolites.samples())?;
    Ok((samples, metabolites))
}

pub fn run_prepare(inputs: &PrepareInputs, config: &PreprocessConfig) -> Result<PrepareSummary> {
    let start = Instant::now();
    let (samples, metabolites) = load_aligned_metabolites(&inputs.family_path, &inputs.metabolite_path)?;
    let report = preprocess::run(&metabolites, config)?;
    let phenotype_files = output_writer::write_phenotype_tables(&inputs.out_dir, &samples, &report.matrix)?;
    info!(
        "Prepared {} phenotype tables in {:.2?}.",
        phenotype_files.len(),
        start.elapsed()
    );
    Ok(PrepareSummary {
        retained_metabolites: report.matrix.n_metabolites(),
        phenotype_files,
    })
}

fn ensure_parent_dir(output_prefix: &str) -> Result<()> {
    if let Some(parent) = Path::new(output_prefix).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| MqtlError::io(parent, e))?;
        }
    }
    Ok(())
}

fn load_genotypes(
    source: &GenotypeSource,
    wanted: &HashSet<String>,
    separator: char,
) -> Result<GenotypeMatrix> {
    match source {
        GenotypeSource::Raw(path) => readers::read_raw_dosage_file(path, Some(wanted), separator),
        GenotypeSource::Bed(path) => readers::read_bed_genotypes(path, Some(wanted), separator),
    }
}

/// Drains sweeps from the engine: writes them, keeps the significant records.
fn consume_sweeps(
    receiver: flume::Receiver<MetaboliteSweep>,
    p_threshold: f64,
    filtered: &mut AssociationWriter,
    mut full: Option<&mut AssociationWriter>,
    progress: &ProgressBar,
) -> Result<Vec<AssociationRecord>> {
    let mut significant = Vec::new();
    for sweep in receiver.iter() {
        if let Some(writer) = full.as_mut() {
            writer.write_records(&sweep.records)?;
        }
        let kept = results::filter(sweep.records, p_threshold);
        filtered.write_records(&kept)?;
        significant.extend(kept);
        progress.inc(1);
    }
    Ok(significant)
}

/// Full scan. `progress` advances once per metabolite; pass `ProgressBar::hidden()` when no
/// display is wanted. `cancel` stops the engine between pairs.
pub fn run_scan(
    inputs: &ScanInputs,
    config: &AnalysisConfig,
    progress: &ProgressBar,
    cancel: Option<CancellationToken>,
) -> Result<ScanSummary> {
    config.validate()?;
    let start = Instant::now();
    let separator = config.filter.suffix_separator;
    ensure_parent_dir(&inputs.output_prefix)?;
    let mut outputs = Vec::new();

    // Metabolites
    let (samples, metabolites) = load_aligned_metabolites(&inputs.family_path, &inputs.metabolite_path)?;
    let preprocessed = preprocess::run(&metabolites, &config.preprocess)?;

    // Variant selection
    let first_pass = readers::read_first_pass_file(&inputs.first_pass_path, &inputs.first_pass_columns)?;
    let selection = selector::select(
        &first_pass,
        config.selection.total_variant_count,
        config.selection.alpha,
    )?;
    outputs.push(output_writer::write_significant_variants(&inputs.output_prefix, &selection)?);
    if selection.variants.is_empty() {
        warn!("No variant passed the Bonferroni threshold; the scan will test no pairs.");
    }

    // Genotypes, restricted to the selection
    let selected_ids = selection.variant_ids();
    let wanted: HashSet<String> = selected_ids
        .iter()
        .map(|id| normalize_variant_id(id, separator).to_string())
        .collect();
    let all_genotypes = load_genotypes(&inputs.genotypes, &wanted, separator)?;
    let family_ids: Vec<String> = samples.iter().map(|s| s.sample_id.clone()).collect();
    check_sample_alignment("family file", &family_ids, "genotype file", all_genotypes.samples())?;
    let (genotypes, absent) = all_genotypes.restrict_to(&selected_ids, separator);
    if !absent.is_empty() {
        warn!(
            "{} selected variants have no genotype column (first: '{}').",
            absent.len(),
            absent[0]
        );
    }
    let variant_map = readers::read_variant_map(&inputs.map_path)?;

    // Association scan
    let mut engine = AssociationEngine::try_new(&preprocessed.matrix, &genotypes)?;
    if let Some(token) = cancel {
        engine = engine.with_cancellation(token);
    }
    let mut filtered = AssociationWriter::create(&inputs.output_prefix, AssociationLayout::Filtered)?;
    let mut full = if inputs.write_all {
        Some(AssociationWriter::create(&inputs.output_prefix, AssociationLayout::Full)?)
    } else {
        None
    };
    progress.set_length(preprocessed.matrix.n_metabolites() as u64);

    let scan_start = Instant::now();
    let (sender, receiver) = flume::bounded::<MetaboliteSweep>(config.engine.channel_capacity);
    let block_size = config.engine.block_size;
    let engine_ref = &engine;
    let (streamed, consumed) = thread::scope(|scope| {
        let producer = scope.spawn(move || engine_ref.stream(&sender, block_size));
        let consumed = consume_sweeps(
            receiver,
            config.filter.p_threshold,
            &mut filtered,
            full.as_mut(),
            progress,
        );
        let streamed = producer
            .join()
            .unwrap_or_else(|payload| std::panic::resume_unwind(payload));
        (streamed, consumed)
    });
    // A consumer failure closes the channel, which the producer reports as a cancellation.
    let significant = consumed?;
    let pairs = streamed?;
    progress.finish();
    info!(
        "Association scan finished in {:.2?}: {} pairs, {} OK, {} insufficient data, {} numeric errors; {} with p < {}.",
        scan_start.elapsed(),
        pairs.total(),
        pairs.ok,
        pairs.insufficient_data,
        pairs.numeric_error,
        significant.len(),
        config.filter.p_threshold
    );

    outputs.push(filtered.path().to_path_buf());
    filtered.finish()?;
    if let Some(writer) = full {
        outputs.push(writer.path().to_path_buf());
        writer.finish()?;
    }

    // Positions and plotting table
    let joined = results::join(&significant, &variant_map, separator);
    let table = manhattan::prepare(&joined.rows, config.manhattan.annotation_threshold);
    outputs.push(output_writer::write_manhattan_table(&inputs.output_prefix, &table)?);
    outputs.push(output_writer::write_manhattan_labels(&inputs.output_prefix, &table)?);

    let labelled = table.labelled().count();
    outputs.push(output_writer::write_diagnostics(
        &inputs.output_prefix,
        &DiagnosticsReport {
            preprocess: &preprocessed,
            selection: &selection,
            variants_without_genotypes: &absent,
            pairs: &pairs,
            significant_associations: significant.len(),
            join: &joined.diagnostics,
            labelled_points: labelled,
        },
    )?);

    info!("Scan completed in {:.2?}.", start.elapsed());
    Ok(ScanSummary {
        metabolites: preprocessed.matrix.n_metabolites(),
        selected_variants: selection.variants.len(),
        tested_variants: genotypes.n_variants(),
        pairs,
        significant: significant.len(),
        joined: joined.diagnostics.joined,
        missing_mappings: joined.diagnostics.missing_rows,
        labelled,
        outputs,
    })
}
