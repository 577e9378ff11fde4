use crate::error::{MqtlError, Result};

/// Genome-wide significance (5e-8) on the -log10 scale.
pub const DEFAULT_ANNOTATION_THRESHOLD: f64 = 7.301_029_995_663_981;

#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Values beyond `mean ± k·sd` (after normalization) are masked.
    pub outlier_sd_multiplier: f64,
    /// Columns with a smaller observed fraction after masking are dropped.
    pub min_non_missing_fraction: f64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            outlier_sd_multiplier: 3.0,
            min_non_missing_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectionConfig {
    pub alpha: f64,
    /// Number of variants tested by the external first-pass scan. This is the Bonferroni
    /// denominator, not the number of variants that reach the engine.
    pub total_variant_count: i64,
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub p_threshold: f64,
    pub suffix_separator: char,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            p_threshold: 0.05,
            suffix_separator: '_',
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManhattanConfig {
    pub annotation_threshold: f64,
}

impl Default for ManhattanConfig {
    fn default() -> Self {
        Self {
            annotation_threshold: DEFAULT_ANNOTATION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Metabolites swept together before their records are handed downstream.
    pub block_size: usize,
    /// Bound on sweeps buffered between the engine and the consumer.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 64,
            channel_capacity: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub preprocess: PreprocessConfig,
    pub selection: SelectionConfig,
    pub filter: FilterConfig,
    pub manhattan: ManhattanConfig,
    pub engine: EngineConfig,
}

impl AnalysisConfig {
    /// Defaults everywhere except the first-pass variant count, which has no sensible default.
    pub fn with_total_variant_count(total_variant_count: i64) -> Self {
        Self {
            preprocess: PreprocessConfig::default(),
            selection: SelectionConfig {
                alpha: 0.05,
                total_variant_count,
            },
            filter: FilterConfig::default(),
            manhattan: ManhattanConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let k = self.preprocess.outlier_sd_multiplier;
        if !(k.is_finite() && k > 0.0) {
            return Err(MqtlError::config(format!(
                "outlier SD multiplier must be a positive finite number, got {}",
                k
            )));
        }
        let frac = self.preprocess.min_non_missing_fraction;
        if !(0.0..=1.0).contains(&frac) {
            return Err(MqtlError::config(format!(
                "minimum non-missing fraction must lie in [0, 1], got {}",
                frac
            )));
        }
        let alpha = self.selection.alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(MqtlError::config(format!(
                "Bonferroni alpha must lie in (0, 1], got {}",
                alpha
            )));
        }
        if self.selection.total_variant_count <= 0 {
            return Err(MqtlError::config(format!(
                "total variant count must be positive, got {}",
                self.selection.total_variant_count
            )));
        }
        let p = self.filter.p_threshold;
        if !(p > 0.0 && p <= 1.0) {
            return Err(MqtlError::config(format!(
                "pairwise p-value threshold must lie in (0, 1], got {}",
                p
            )));
        }
        if !self.manhattan.annotation_threshold.is_finite() {
            return Err(MqtlError::config("annotation threshold must be finite"));
        }
        if self.engine.block_size == 0 || self.engine.channel_capacity == 0 {
            return Err(MqtlError::config(
                "engine block size and channel capacity must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AnalysisConfig::with_total_variant_count(67_735);
        assert!(config.validate().is_ok());
        assert_eq!(config.preprocess.outlier_sd_multiplier, 3.0);
        assert_eq!(config.preprocess.min_non_missing_fraction, 0.5);
        assert_eq!(config.filter.p_threshold, 0.05);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = AnalysisConfig::with_total_variant_count(0);
        assert!(matches!(config.validate(), Err(MqtlError::Config { .. })));

        config.selection.total_variant_count = 10;
        config.preprocess.min_non_missing_fraction = 1.5;
        assert!(config.validate().is_err());

        config.preprocess.min_non_missing_fraction = 0.5;
        config.preprocess.outlier_sd_multiplier = f64::NAN;
        assert!(config.validate().is_err());
    }
}
