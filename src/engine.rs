// engine.rs
//
// Exhaustive metabolite x variant association scan. Every pair is an independent
// `metabolite ~ 1 + dosage` OLS fit over its complete cases; the matrices are only read.

use log::{debug, info};
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MqtlError, Result};
use crate::matrix::{check_sample_alignment, GenotypeMatrix, MetaboliteMatrix};

pub const MIN_COMPLETE_CASES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PairStatus {
    Ok,
    /// Fewer than three complete cases, or no variance in either variable among them.
    InsufficientData,
    /// The fit produced a non-finite intermediate.
    NumericError,
}

impl PairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairStatus::Ok => "OK",
            PairStatus::InsufficientData => "INSUFFICIENT_DATA",
            PairStatus::NumericError => "NUMERIC_ERROR",
        }
    }
}

impl fmt::Display for PairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionFit {
    pub slope: f64,
    pub intercept: f64,
    pub std_error: f64,
    pub t_statistic: f64,
    pub p_value: f64,
    pub degrees_of_freedom: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRecord {
    pub variant_id: Arc<str>,
    pub metabolite_id: Arc<str>,
    pub complete_cases: usize,
    pub status: PairStatus,
    /// Present exactly when `status` is `Ok`.
    pub fit: Option<RegressionFit>,
}

impl AssociationRecord {
    pub fn p_value(&self) -> Option<f64> {
        self.fit.map(|f| f.p_value)
    }
}

/// Two-sided OLS t-test of the slope over `(dosage, metabolite)` pairs.
///
/// The iterator is walked more than once (means first, then centred sums), so it must be
/// cheap to clone. Returns the complete-case count alongside the outcome.
pub fn fit_pair<I>(pairs: I) -> (usize, std::result::Result<RegressionFit, PairStatus>)
where
    I: Iterator<Item = (f64, f64)> + Clone,
{
    let (n, sum_x, sum_y, max_abs_x, max_abs_y) = pairs.clone().fold(
        (0usize, 0.0f64, 0.0f64, 0.0f64, 0.0f64),
        |(n, sx, sy, mx, my), (x, y)| (n + 1, sx + x, sy + y, mx.max(x.abs()), my.max(y.abs())),
    );
    if n < MIN_COMPLETE_CASES {
        return (n, Err(PairStatus::InsufficientData));
    }
    let nf = n as f64;
    let (mean_x, mean_y) = (sum_x / nf, sum_y / nf);

    let (sxx, sxy, syy) = pairs.clone().fold((0.0f64, 0.0f64, 0.0f64), |(sxx, sxy, syy), (x, y)| {
        let (dx, dy) = (x - mean_x, y - mean_y);
        (sxx + dx * dx, sxy + dx * dy, syy + dy * dy)
    });
    if !(sxx.is_finite() && sxy.is_finite() && syy.is_finite()) {
        return (n, Err(PairStatus::NumericError));
    }
    if negligible(sxx, max_abs_x, nf) || negligible(syy, max_abs_y, nf) {
        return (n, Err(PairStatus::InsufficientData));
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let rss: f64 = pairs
        .map(|(x, y)| {
            let residual = y - intercept - slope * x;
            residual * residual
        })
        .sum();
    let df = n - 2;
    let std_error = (rss / df as f64 / sxx).sqrt();
    if !(slope.is_finite() && std_error.is_finite()) {
        return (n, Err(PairStatus::NumericError));
    }

    // A zero residual sum of squares is a perfect linear fit.
    let (t_statistic, p_value) = if std_error == 0.0 {
        (slope.signum() * f64::INFINITY, 0.0)
    } else {
        let t = slope / std_error;
        let t_dist = match StudentsT::new(0.0, 1.0, df as f64) {
            Ok(dist) => dist,
            Err(_) => return (n, Err(PairStatus::NumericError)),
        };
        (t, (2.0 * t_dist.sf(t.abs())).clamp(0.0, 1.0))
    };
    if !p_value.is_finite() {
        return (n, Err(PairStatus::NumericError));
    }

    (
        n,
        Ok(RegressionFit {
            slope,
            intercept,
            std_error,
            t_statistic,
            p_value,
            degrees_of_freedom: df,
        }),
    )
}

/// Centred sum of squares no larger than the rounding noise of values up to `max_abs`.
/// Scales with the data, so small-unit columns are not mistaken for constants.
fn negligible(centred_ss: f64, max_abs: f64, n: f64) -> bool {
    let noise = f64::EPSILON * n * max_abs;
    centred_ss <= noise * noise * n
}

/// Shared flag for aborting a scan between pairs.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Every variant tested against one metabolite, in variant order.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaboliteSweep {
    pub metabolite_index: usize,
    pub records: Vec<AssociationRecord>,
}

/// End-of-run counts by pair status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairDiagnostics {
    pub ok: usize,
    pub insufficient_data: usize,
    pub numeric_error: usize,
}

impl PairDiagnostics {
    pub fn from_records(records: &[AssociationRecord]) -> Self {
        let mut diagnostics = Self::default();
        diagnostics.tally(records);
        diagnostics
    }

    pub fn tally(&mut self, records: &[AssociationRecord]) {
        for record in records {
            match record.status {
                PairStatus::Ok => self.ok += 1,
                PairStatus::InsufficientData => self.insufficient_data += 1,
                PairStatus::NumericError => self.numeric_error += 1,
            }
        }
    }

    pub fn total(&self) -> usize {
        self.ok + self.insufficient_data + self.numeric_error
    }

    pub fn failed(&self) -> usize {
        self.insufficient_data + self.numeric_error
    }
}

pub struct AssociationEngine<'a> {
    metabolites: &'a MetaboliteMatrix,
    genotypes: &'a GenotypeMatrix,
    metabolite_ids: Vec<Arc<str>>,
    variant_ids: Vec<Arc<str>>,
    cancel: CancellationToken,
}

impl<'a> AssociationEngine<'a> {
    /// Fails unless both matrices list the same samples in the same order.
    pub fn try_new(metabolites: &'a MetaboliteMatrix, genotypes: &'a GenotypeMatrix) -> Result<Self> {
        check_sample_alignment(
            "metabolite matrix",
            metabolites.samples(),
            "genotype matrix",
            genotypes.samples(),
        )?;
        Ok(Self {
            metabolites,
            genotypes,
            metabolite_ids: metabolites.metabolite_ids().iter().map(|s| Arc::from(s.as_str())).collect(),
            variant_ids: genotypes.variant_ids().iter().map(|s| Arc::from(s.as_str())).collect(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn n_pairs(&self) -> usize {
        self.metabolite_ids.len() * self.variant_ids.len()
    }

    pub fn test_pair(&self, metabolite_idx: usize, variant_idx: usize) -> AssociationRecord {
        let y = self.metabolites.column_values(metabolite_idx);
        let y_obs = self.metabolites.column_mask(metabolite_idx);
        let x = self.genotypes.column_values(variant_idx);
        let x_obs = self.genotypes.column_mask(variant_idx);

        let complete = x
            .iter()
            .zip(x_obs.iter())
            .zip(y.iter().zip(y_obs.iter()))
            .filter_map(|((&xv, &xo), (&yv, &yo))| if xo && yo { Some((xv, yv)) } else { None });

        let (complete_cases, outcome) = fit_pair(complete);
        let (status, fit) = match outcome {
            Ok(fit) => (PairStatus::Ok, Some(fit)),
            Err(status) => (status, None),
        };
        AssociationRecord {
            variant_id: Arc::clone(&self.variant_ids[variant_idx]),
            metabolite_id: Arc::clone(&self.metabolite_ids[metabolite_idx]),
            complete_cases,
            status,
            fit,
        }
    }

    /// Tests one metabolite against every variant in parallel.
    pub fn sweep_metabolite(&self, metabolite_idx: usize) -> Result<MetaboliteSweep> {
        let records = (0..self.variant_ids.len())
            .into_par_iter()
            .map(|variant_idx| {
                if self.cancel.is_cancelled() {
                    Err(MqtlError::Cancelled)
                } else {
                    Ok(self.test_pair(metabolite_idx, variant_idx))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(MetaboliteSweep {
            metabolite_index: metabolite_idx,
            records,
        })
    }

    /// All pairs, ordered by metabolite then variant.
    pub fn run(&self) -> Result<Vec<AssociationRecord>> {
        info!(
            "Testing {} metabolites x {} variants = {} pairs...",
            self.metabolite_ids.len(),
            self.variant_ids.len(),
            self.n_pairs()
        );
        let sweeps = (0..self.metabolite_ids.len())
            .into_par_iter()
            .map(|m| self.sweep_metabolite(m))
            .collect::<Result<Vec<_>>>()?;
        Ok(sweeps.into_iter().flat_map(|s| s.records).collect())
    }

    /// Sweeps metabolites in blocks of `block_size` and sends each sweep downstream in
    /// metabolite order. Only one block of records is held at a time. A closed receiver
    /// cancels the scan.
    pub fn stream(
        &self,
        sender: &flume::Sender<MetaboliteSweep>,
        block_size: usize,
    ) -> Result<PairDiagnostics> {
        let block_size = block_size.max(1);
        let n_metabolites = self.metabolite_ids.len();
        info!(
            "Streaming {} pairs ({} metabolites x {} variants) in blocks of {} metabolites...",
            self.n_pairs(),
            n_metabolites,
            self.variant_ids.len(),
            block_size
        );

        let mut diagnostics = PairDiagnostics::default();
        for block_start in (0..n_metabolites).step_by(block_size) {
            if self.cancel.is_cancelled() {
                return Err(MqtlError::Cancelled);
            }
            let block_end = (block_start + block_size).min(n_metabolites);
            let sweeps = (block_start..block_end)
                .into_par_iter()
                .map(|m| self.sweep_metabolite(m))
                .collect::<Result<Vec<_>>>()?;
            debug!("Swept metabolites {}..{}.", block_start, block_end);

            for sweep in sweeps {
                diagnostics.tally(&sweep.records);
                if sender.send(sweep).is_err() {
                    self.cancel.cancel();
                    return Err(MqtlError::Cancelled);
                }
            }
        }
        Ok(diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    fn random_dosages(rng: &mut ChaCha8Rng, n: usize) -> Vec<f64> {
        (0..n).map(|_| rng.random_range(0..=2u8) as f64).collect()
    }

    fn metabolites_from_columns(columns: &[Vec<Option<f64>>]) -> MetaboliteMatrix {
        let n = columns[0].len();
        let rows: Vec<Vec<Option<f64>>> =
            (0..n).map(|i| columns.iter().map(|c| c[i]).collect()).collect();
        MetaboliteMatrix::from_rows(names("s", n), names("m", columns.len()), &rows).unwrap()
    }

    fn genotypes_from_columns(columns: &[Vec<Option<f64>>]) -> GenotypeMatrix {
        let n = columns[0].len();
        let rows: Vec<Vec<Option<f64>>> =
            (0..n).map(|i| columns.iter().map(|c| c[i]).collect()).collect();
        GenotypeMatrix::from_rows(names("s", n), names("rs", columns.len()), &rows).unwrap()
    }

    fn all_some(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    #[test]
    fn fit_matches_reference_values() {
        let x = [0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 1.0, 0.0];
        let y = [1.0, 2.1, 2.9, 1.2, 1.8, 3.1, 2.2, 0.7];
        let (n, outcome) = fit_pair(x.iter().copied().zip(y.iter().copied()));
        let fit = outcome.unwrap();

        assert_eq!(n, 8);
        assert_eq!(fit.degrees_of_freedom, 6);
        assert!((fit.slope - 1.020_512_820_512_820_4).abs() < 1e-12);
        assert!((fit.intercept - 0.982_051_282_051_282_1).abs() < 1e-12);
        assert!((fit.std_error - 0.090_194_228_774_515_7).abs() < 1e-12);
        assert!((fit.p_value - 2.852_460_957_494_28e-5).abs() / 2.852_460_957_494_28e-5 < 1e-6);
    }

    #[test]
    fn synthetic_signal_is_recovered() {
        let mut rng = ChaCha8Rng::seed_from_u64(2024);
        let noise = Normal::new(0.0, 0.01).unwrap();
        let dosage = random_dosages(&mut rng, 60);
        let unrelated = random_dosages(&mut rng, 60);
        let metabolite: Vec<f64> = dosage.iter().map(|d| 2.0 * d + noise.sample(&mut rng)).collect();

        let m = metabolites_from_columns(&[all_some(&metabolite)]);
        let g = genotypes_from_columns(&[all_some(&dosage), all_some(&unrelated)]);
        let records = AssociationEngine::try_new(&m, &g).unwrap().run().unwrap();

        assert_eq!(records.len(), 2);
        let causal = records[0].fit.unwrap();
        assert_eq!(records[0].status, PairStatus::Ok);
        assert!(causal.p_value < 1e-6, "p = {}", causal.p_value);
        assert!((causal.slope - 2.0).abs() < 0.01);
        assert_eq!(&*records[0].variant_id, "rs0");
        assert_eq!(&*records[1].variant_id, "rs1");
    }

    #[test]
    fn null_p_values_are_uniform() {
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let n_samples = 100;
        let n_trials = 1000;
        let metabolite: Vec<f64> = (0..n_samples).map(|_| normal.sample(&mut rng)).collect();
        let dosage_columns: Vec<Vec<Option<f64>>> = (0..n_trials)
            .map(|_| all_some(&random_dosages(&mut rng, n_samples)))
            .collect();

        let m = metabolites_from_columns(&[all_some(&metabolite)]);
        let g = genotypes_from_columns(&dosage_columns);
        let p_values: Vec<f64> = AssociationEngine::try_new(&m, &g)
            .unwrap()
            .run()
            .unwrap()
            .iter()
            .map(|r| r.p_value().unwrap())
            .collect();

        let mean = p_values.iter().sum::<f64>() / n_trials as f64;
        assert!((0.46..0.54).contains(&mean), "mean p = {}", mean);
        let below_005 = p_values.iter().filter(|&&p| p < 0.05).count() as f64 / n_trials as f64;
        assert!((0.025..0.08).contains(&below_005), "P(p < 0.05) = {}", below_005);
        for decile in 0..10 {
            let lo = decile as f64 / 10.0;
            let share = p_values.iter().filter(|&&p| p >= lo && p < lo + 0.1).count() as f64
                / n_trials as f64;
            assert!((0.06..0.14).contains(&share), "decile {} share {}", decile, share);
        }
    }

    #[test]
    fn results_do_not_depend_on_worker_count() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let metabolite_columns: Vec<Vec<Option<f64>>> = (0..7)
            .map(|_| {
                (0..40)
                    .map(|_| if rng.random::<f64>() < 0.1 { None } else { Some(normal.sample(&mut rng)) })
                    .collect()
            })
            .collect();
        let dosage_columns: Vec<Vec<Option<f64>>> = (0..13)
            .map(|_| {
                (0..40)
                    .map(|_| if rng.random::<f64>() < 0.05 { None } else { Some(rng.random_range(0..=2u8) as f64) })
                    .collect()
            })
            .collect();
        let m = metabolites_from_columns(&metabolite_columns);
        let g = genotypes_from_columns(&dosage_columns);
        let engine = AssociationEngine::try_new(&m, &g).unwrap();

        let run_with = |threads: usize| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap()
                .install(|| engine.run().unwrap())
        };
        let single = run_with(1);
        assert_eq!(single.len(), 7 * 13);
        assert_eq!(single, run_with(2));
        assert_eq!(single, run_with(8));

        let (tx, rx) = flume::unbounded();
        let diagnostics = rayon::ThreadPoolBuilder::new()
            .num_threads(3)
            .build()
            .unwrap()
            .install(|| engine.stream(&tx, 2).unwrap());
        drop(tx);
        let streamed: Vec<AssociationRecord> = rx.iter().flat_map(|s| s.records).collect();
        assert_eq!(single, streamed);
        assert_eq!(diagnostics, PairDiagnostics::from_records(&single));
    }

    #[test]
    fn degenerate_pairs_are_recorded_not_dropped() {
        let metabolite = vec![Some(1.0), Some(2.0), None, Some(4.0), Some(3.0), Some(5.0)];
        let constant_metabolite = vec![Some(2.0); 6];
        let constant_dosage = all_some(&[1.0; 6]);
        let sparse_dosage = vec![Some(0.0), None, Some(2.0), None, None, None];
        let good_dosage = all_some(&[0.0, 1.0, 2.0, 2.0, 1.0, 2.0]);

        let m = metabolites_from_columns(&[metabolite, constant_metabolite]);
        let g = genotypes_from_columns(&[constant_dosage, sparse_dosage, good_dosage]);
        let records = AssociationEngine::try_new(&m, &g).unwrap().run().unwrap();

        let statuses: Vec<PairStatus> = records.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                PairStatus::InsufficientData,
                PairStatus::InsufficientData,
                PairStatus::Ok,
                PairStatus::InsufficientData,
                PairStatus::InsufficientData,
                PairStatus::InsufficientData,
            ]
        );
        // Sample 0 is the only complete case for the sparse column against metabolite 0.
        assert_eq!(records[1].complete_cases, 1);
        assert_eq!(records[2].complete_cases, 5);
        assert!(records.iter().filter(|r| r.status != PairStatus::Ok).all(|r| r.fit.is_none()));

        let diagnostics = PairDiagnostics::from_records(&records);
        assert_eq!(diagnostics.ok, 1);
        assert_eq!(diagnostics.insufficient_data, 5);
        assert_eq!(diagnostics.total(), 6);
    }

    #[test]
    fn perfect_fit_has_zero_p_value() {
        let dosage = [0.0, 1.0, 2.0, 1.0, 0.0, 2.0];
        let metabolite: Vec<f64> = dosage.iter().map(|d| 3.0 * d - 1.0).collect();
        let (n, outcome) = fit_pair(dosage.iter().copied().zip(metabolite.iter().copied()));
        let fit = outcome.unwrap();
        assert_eq!(n, 6);
        assert!(fit.p_value < 1e-12);
        assert!((fit.slope - 3.0).abs() < 1e-12);
    }

    #[test]
    fn small_scale_metabolite_is_still_fitted() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let noise = Normal::new(0.0, 0.1).unwrap();
        let dosage: Vec<f64> = (0..10).map(|i| (i % 3) as f64).collect();
        let metabolite: Vec<f64> = dosage
            .iter()
            .map(|d| (d + noise.sample(&mut rng)) * 1e-12)
            .collect();
        let (n, outcome) = fit_pair(dosage.iter().copied().zip(metabolite.iter().copied()));
        assert_eq!(n, 10);
        let fit = outcome.expect("small-unit metabolite should be fitted");
        assert!((fit.slope / 1e-12 - 1.0).abs() < 0.2, "slope {}", fit.slope);
        assert!(fit.p_value < 1e-6, "p {}", fit.p_value);

        // A constant metabolite stays insufficient at any scale.
        let constant = vec![3e-12; 10];
        let (_, outcome) = fit_pair(dosage.iter().copied().zip(constant.iter().copied()));
        assert_eq!(outcome, Err(PairStatus::InsufficientData));
    }

    #[test]
    fn misaligned_samples_are_rejected() {
        let m = MetaboliteMatrix::from_rows(
            vec!["a".into(), "b".into()],
            vec!["m0".into()],
            &[vec![Some(1.0)], vec![Some(2.0)]],
        )
        .unwrap();
        let g = GenotypeMatrix::from_rows(
            vec!["b".into(), "a".into()],
            vec!["rs0".into()],
            &[vec![Some(1.0)], vec![Some(2.0)]],
        )
        .unwrap();
        assert!(matches!(
            AssociationEngine::try_new(&m, &g),
            Err(MqtlError::Alignment { .. })
        ));
    }

    #[test]
    fn cancellation_stops_the_scan() {
        let m = metabolites_from_columns(&[all_some(&[1.0, 2.0, 3.0, 4.0])]);
        let g = genotypes_from_columns(&[all_some(&[0.0, 1.0, 2.0, 1.0])]);
        let token = CancellationToken::new();
        let engine = AssociationEngine::try_new(&m, &g)
            .unwrap()
            .with_cancellation(token.clone());
        token.cancel();
        assert!(matches!(engine.run(), Err(MqtlError::Cancelled)));

        let engine = AssociationEngine::try_new(&m, &g).unwrap();
        let (tx, rx) = flume::bounded(1);
        drop(rx);
        assert!(matches!(engine.stream(&tx, 1), Err(MqtlError::Cancelled)));
        assert!(engine.cancellation_token().is_cancelled());
    }
}
