//! Readers for the pipeline's whitespace-delimited inputs and writers for its outputs.

pub mod output_writer;
pub mod readers;

/// Tokens read as a missing value in any numeric column.
pub const MISSING_TOKENS: [&str; 4] = ["NA", "NaN", "nan", "."];

/// `Ok(None)` for a missing token, `Err` with a message for anything unparsable.
pub(crate) fn parse_optional_f64(token: &str) -> Result<Option<f64>, String> {
    if MISSING_TOKENS.contains(&token) {
        return Ok(None);
    }
    match token.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        Ok(v) => Err(format!("non-finite value '{}'", v)),
        Err(e) => Err(format!("cannot parse '{}' as a number: {}", token, e)),
    }
}
