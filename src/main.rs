// main.rs

use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::time::Instant;

use metabolite_qtl::config::{AnalysisConfig, PreprocessConfig};
use metabolite_qtl::io::readers::FirstPassColumns;
use metabolite_qtl::pipeline::{self, GenotypeSource, PrepareInputs, ScanInputs};

fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting metabolite_qtl with args: {:?}", cli_args);

    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    match &cli_args.command {
        cli::Command::Prepare(args) => run_prepare(args)?,
        cli::Command::Scan(args) => run_scan(args)?,
    }

    info!(
        "metabolite_qtl finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

fn run_prepare(args: &cli::PrepareArgs) -> Result<()> {
    let config = PreprocessConfig {
        outlier_sd_multiplier: args.preprocess.outlier_sd,
        min_non_missing_fraction: args.preprocess.min_non_missing,
    };
    let inputs = PrepareInputs {
        family_path: args.fam.clone(),
        metabolite_path: args.metabolites.clone(),
        out_dir: args.out_dir.clone(),
    };
    let summary = pipeline::run_prepare(&inputs, &config).context("prepare failed")?;
    info!(
        "{} metabolites retained; phenotype tables in {}.",
        summary.retained_metabolites,
        args.out_dir.display()
    );
    Ok(())
}

fn run_scan(args: &cli::ScanArgs) -> Result<()> {
    let genotypes = match (&args.raw, &args.bed) {
        (Some(raw), None) => GenotypeSource::Raw(raw.clone()),
        (None, Some(bed)) => GenotypeSource::Bed(bed.clone()),
        _ => return Err(anyhow!("exactly one of --raw or --bed must be given")),
    };
    let suffix_separator = single_char(&args.suffix_separator)?;

    let mut config = AnalysisConfig::with_total_variant_count(args.total_variants);
    config.preprocess.outlier_sd_multiplier = args.preprocess.outlier_sd;
    config.preprocess.min_non_missing_fraction = args.preprocess.min_non_missing;
    config.selection.alpha = args.alpha;
    config.filter.p_threshold = args.p_threshold;
    config.filter.suffix_separator = suffix_separator;
    if let Some(threshold) = args.annotation_threshold {
        config.manhattan.annotation_threshold = threshold;
    }
    config.engine.block_size = args.block_size;
    config.engine.channel_capacity = args.channel_capacity;

    let inputs = ScanInputs {
        family_path: args.fam.clone(),
        metabolite_path: args.metabolites.clone(),
        genotypes,
        map_path: args.map.clone(),
        first_pass_path: args.first_pass.clone(),
        first_pass_columns: FirstPassColumns {
            variant_id: args.id_column.clone(),
            p_value: args.p_column.clone(),
        },
        output_prefix: args.output_prefix.clone(),
        write_all: args.write_all,
    };

    let style = ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} metabolites ({percent}%) ETA: {eta}",
        )
        .map_err(|e| anyhow!("Failed to create progress bar style: {}", e))?
        .progress_chars("=> ");
    let progress = ProgressBar::new(0).with_style(style);

    let summary = pipeline::run_scan(&inputs, &config, &progress, None).context("scan failed")?;
    info!(
        "{} metabolites x {} variants tested ({} selected); {} significant pairs, {} placed on the map, {} labelled.",
        summary.metabolites,
        summary.tested_variants,
        summary.selected_variants,
        summary.significant,
        summary.joined,
        summary.labelled
    );
    for path in &summary.outputs {
        info!("Wrote {}", path.display());
    }
    Ok(())
}

fn single_char(value: &str) -> Result<char> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(anyhow!("--suffix-separator must be a single character, got '{}'", value)),
    }
}

mod cli {
    use clap::{Args, Parser, Subcommand};
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Metabolite QTL scan over Bonferroni-selected variants.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        #[command(subcommand)]
        pub(crate) command: Command,

        #[arg(short = 't', long, global = true)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info", global = true)]
        pub(crate) log_level: String,
    }

    #[derive(Subcommand, Debug)]
    pub(crate) enum Command {
        /// Clean the metabolite matrix and write one phenotype table per metabolite.
        Prepare(PrepareArgs),
        /// Select variants from first-pass results and test every variant x metabolite pair.
        Scan(ScanArgs),
    }

    #[derive(Args, Debug)]
    pub(crate) struct PreprocessArgs {
        /// Values beyond mean +/- this many SDs are masked.
        #[arg(long, default_value_t = 3.0)]
        pub(crate) outlier_sd: f64,

        /// Metabolites observed in fewer than this fraction of samples are dropped.
        #[arg(long, default_value_t = 0.5)]
        pub(crate) min_non_missing: f64,
    }

    #[derive(Args, Debug)]
    pub(crate) struct PrepareArgs {
        #[arg(long, required = true)]
        pub(crate) fam: PathBuf,

        #[arg(short = 'm', long, required = true)]
        pub(crate) metabolites: PathBuf,

        #[arg(short, long = "out-dir", required = true)]
        pub(crate) out_dir: PathBuf,

        #[command(flatten)]
        pub(crate) preprocess: PreprocessArgs,
    }

    #[derive(Args, Debug)]
    pub(crate) struct ScanArgs {
        #[arg(long, required = true)]
        pub(crate) fam: PathBuf,

        #[arg(short = 'm', long, required = true)]
        pub(crate) metabolites: PathBuf,

        /// PLINK --recode A dosage file.
        #[arg(long, conflicts_with = "bed")]
        pub(crate) raw: Option<PathBuf>,

        /// PLINK .bed file (.bim/.fam alongside).
        #[arg(long)]
        pub(crate) bed: Option<PathBuf>,

        /// Position map (.map or .bim).
        #[arg(long, required = true)]
        pub(crate) map: PathBuf,

        /// First-pass association results.
        #[arg(long, required = true)]
        pub(crate) first_pass: PathBuf,

        #[arg(long, default_value = "SNP")]
        pub(crate) id_column: String,

        #[arg(long, default_value = "P")]
        pub(crate) p_column: String,

        /// Number of variants in the first-pass test (Bonferroni denominator).
        #[arg(long, required = true)]
        pub(crate) total_variants: i64,

        #[arg(long, default_value_t = 0.05)]
        pub(crate) alpha: f64,

        /// Pairwise significance cut-off, unadjusted.
        #[arg(long, default_value_t = 0.05)]
        pub(crate) p_threshold: f64,

        #[arg(long, default_value = "_")]
        pub(crate) suffix_separator: String,

        /// -log10(p) above which Manhattan points are labelled. Defaults to -log10(5e-8).
        #[arg(long)]
        pub(crate) annotation_threshold: Option<f64>,

        #[arg(long, default_value_t = 64)]
        pub(crate) block_size: usize,

        #[arg(long, default_value_t = 4)]
        pub(crate) channel_capacity: usize,

        /// Also write every tested pair with its status.
        #[arg(long)]
        pub(crate) write_all: bool,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,

        #[command(flatten)]
        pub(crate) preprocess: PreprocessArgs,
    }
}
