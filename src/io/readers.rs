// readers.rs

use bed_reader::{Bed, ReadOptions};
use log::{debug, info, warn};
use ndarray::Array2;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::parse_optional_f64;
use crate::error::{MqtlError, Result};
use crate::matrix::{GenotypeMatrix, MetaboliteMatrix, SampleRecord};
use crate::results::{normalize_variant_id, VariantMap, VariantPosition};
use crate::selector::FirstPassResult;

/// Metadata columns leading every row of a PLINK `--recode A` file.
pub const RAW_METADATA_COLUMNS: usize = 6;

/// Header names of the first-pass file columns to use.
#[derive(Debug, Clone)]
pub struct FirstPassColumns {
    pub variant_id: String,
    pub p_value: String,
}

impl Default for FirstPassColumns {
    fn default() -> Self {
        Self {
            variant_id: "SNP".to_string(),
            p_value: "P".to_string(),
        }
    }
}

/// Non-blank, non-comment lines with their 1-based line numbers.
fn data_lines(path: &Path) -> Result<impl Iterator<Item = Result<(usize, String)>> + '_> {
    let file = File::open(path).map_err(|e| MqtlError::io(path, e))?;
    let reader = BufReader::new(file);
    Ok(reader
        .lines()
        .enumerate()
        .filter_map(move |(idx, line_result)| match line_result {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    None
                } else {
                    Some(Ok((idx + 1, line)))
                }
            }
            Err(e) => Some(Err(MqtlError::io(path, e))),
        }))
}

fn parse_cell(path: &Path, line_num: usize, token: &str, column: &str) -> Result<Option<f64>> {
    parse_optional_f64(token)
        .map_err(|msg| MqtlError::input_format(path, line_num, format!("column '{}': {}", column, msg)))
}

/// Reads a `.fam` file: `FID IID PAT MAT SEX PHENO`, no header.
pub fn read_family_file(path: &Path) -> Result<Vec<SampleRecord>> {
    info!("Reading family file: {}", path.display());
    let mut records = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for line_result in data_lines(path)? {
        let (line_num, line) = line_result?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 6 {
            return Err(MqtlError::input_format(
                path,
                line_num,
                format!("expected 6 columns (FID IID PAT MAT SEX PHENO), found {}", parts.len()),
            ));
        }
        let sex = match parts[4] {
            "0" => 0,
            "1" => 1,
            "2" => 2,
            other => {
                return Err(MqtlError::input_format(
                    path,
                    line_num,
                    format!("sex code must be 0, 1 or 2, found '{}'", other),
                ))
            }
        };
        let phenotype = if parts[5] == "-9" {
            None
        } else {
            parse_cell(path, line_num, parts[5], "PHENO")?
        };
        if let Some(first) = seen.insert(parts[1].to_string(), line_num) {
            return Err(MqtlError::input_format(
                path,
                line_num,
                format!("sample '{}' already listed on line {}", parts[1], first),
            ));
        }
        records.push(SampleRecord {
            family_id: parts[0].to_string(),
            sample_id: parts[1].to_string(),
            paternal_id: parts[2].to_string(),
            maternal_id: parts[3].to_string(),
            sex,
            phenotype,
        });
    }
    if records.is_empty() {
        return Err(MqtlError::input_format(path, 0, "family file lists no samples"));
    }
    debug!("Read {} samples from {}.", records.len(), path.display());
    Ok(records)
}

/// Reads the raw metabolite table: header `IID <metabolite ids...>`, one row per sample.
pub fn read_metabolite_file(path: &Path) -> Result<MetaboliteMatrix> {
    info!("Reading metabolite measurements: {}", path.display());
    let mut lines = data_lines(path)?;
    let (header_line_num, header) = match lines.next() {
        Some(line) => line?,
        None => return Err(MqtlError::input_format(path, 0, "metabolite file is empty")),
    };
    let header_parts: Vec<String> = header.split_whitespace().map(String::from).collect();
    if header_parts.len() < 2 {
        return Err(MqtlError::input_format(
            path,
            header_line_num,
            "header needs a sample id column followed by at least one metabolite",
        ));
    }
    let metabolite_ids = header_parts[1..].to_vec();

    let mut samples = Vec::new();
    let mut rows: Vec<Vec<Option<f64>>> = Vec::new();
    for line_result in lines {
        let (line_num, line) = line_result?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != header_parts.len() {
            return Err(MqtlError::input_format(
                path,
                line_num,
                format!("expected {} columns, found {}", header_parts.len(), parts.len()),
            ));
        }
        let row = parts[1..]
            .iter()
            .zip(metabolite_ids.iter())
            .map(|(token, id)| parse_cell(path, line_num, token, id))
            .collect::<Result<Vec<_>>>()?;
        samples.push(parts[0].to_string());
        rows.push(row);
    }
    let matrix = MetaboliteMatrix::from_rows(samples, metabolite_ids, &rows)
        .map_err(|e| MqtlError::input_format(path, header_line_num, e.to_string()))?;
    info!(
        "Loaded {} samples x {} metabolites from {}.",
        matrix.n_samples(),
        matrix.n_metabolites(),
        path.display()
    );
    Ok(matrix)
}

/// Reads a PLINK `--recode A` dosage file. Only variants whose normalized id is in `wanted`
/// are kept when a set is given.
pub fn read_raw_dosage_file(
    path: &Path,
    wanted: Option<&HashSet<String>>,
    separator: char,
) -> Result<GenotypeMatrix> {
    info!("Reading raw dosage file: {}", path.display());
    let mut lines = data_lines(path)?;
    let (header_line_num, header) = match lines.next() {
        Some(line) => line?,
        None => return Err(MqtlError::input_format(path, 0, "dosage file is empty")),
    };
    let header_parts: Vec<&str> = header.split_whitespace().collect();
    if header_parts.len() < RAW_METADATA_COLUMNS {
        return Err(MqtlError::input_format(
            path,
            header_line_num,
            format!(
                "header has {} columns; expected {} metadata columns before the variants",
                header_parts.len(),
                RAW_METADATA_COLUMNS
            ),
        ));
    }
    let n_columns = header_parts.len();
    let kept_columns: Vec<usize> = (RAW_METADATA_COLUMNS..n_columns)
        .filter(|&col| {
            wanted.map_or(true, |w| w.contains(normalize_variant_id(header_parts[col], separator)))
        })
        .collect();
    let variant_ids: Vec<String> = kept_columns.iter().map(|&c| header_parts[c].to_string()).collect();
    if variant_ids.is_empty() {
        warn!("No requested variants found among the columns of {}.", path.display());
    }

    let mut samples = Vec::new();
    let mut rows: Vec<Vec<Option<f64>>> = Vec::new();
    for line_result in lines {
        let (line_num, line) = line_result?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != n_columns {
            return Err(MqtlError::input_format(
                path,
                line_num,
                format!("expected {} columns, found {}", n_columns, parts.len()),
            ));
        }
        let mut row = Vec::with_capacity(kept_columns.len());
        for &col in &kept_columns {
            let dosage = parse_cell(path, line_num, parts[col], header_parts[col])?;
            if let Some(d) = dosage {
                if !(0.0..=2.0).contains(&d) {
                    return Err(MqtlError::input_format(
                        path,
                        line_num,
                        format!("dosage {} for '{}' is outside [0, 2]", d, header_parts[col]),
                    ));
                }
            }
            row.push(dosage);
        }
        samples.push(parts[1].to_string());
        rows.push(row);
    }
    let matrix = GenotypeMatrix::from_rows(samples, variant_ids, &rows)
        .map_err(|e| MqtlError::input_format(path, header_line_num, e.to_string()))?;
    info!(
        "Loaded {} samples x {} variants ({} of {} columns requested) from {}.",
        matrix.n_samples(),
        matrix.n_variants(),
        kept_columns.len(),
        n_columns - RAW_METADATA_COLUMNS,
        path.display()
    );
    Ok(matrix)
}

fn bed_error(path: &Path, err: impl std::fmt::Display) -> MqtlError {
    MqtlError::input_format(path, 0, format!("bed_reader error: {}", err))
}

/// Reads allele-1 dosages from a PLINK `.bed/.bim/.fam` fileset.
pub fn read_bed_genotypes(
    bed_path: &Path,
    wanted: Option<&HashSet<String>>,
    separator: char,
) -> Result<GenotypeMatrix> {
    info!("Reading PLINK binary fileset: {}", bed_path.display());
    let mut bed = Bed::new(bed_path).map_err(|e| bed_error(bed_path, e))?;
    let samples: Vec<String> = bed.iid().map_err(|e| bed_error(bed_path, e))?.to_vec();
    let all_variant_ids: Vec<String> = bed.sid().map_err(|e| bed_error(bed_path, e))?.to_vec();

    let sid_index: Vec<isize> = all_variant_ids
        .iter()
        .enumerate()
        .filter(|(_, sid)| wanted.map_or(true, |w| w.contains(normalize_variant_id(sid, separator))))
        .map(|(idx, _)| idx as isize)
        .collect();
    let variant_ids: Vec<String> = sid_index
        .iter()
        .map(|&idx| all_variant_ids[idx as usize].clone())
        .collect();

    let (values, observed) = if sid_index.is_empty() {
        warn!("No requested variants found in {}.", bed_path.display());
        (
            Array2::<f64>::zeros((samples.len(), 0)),
            Array2::<bool>::from_elem((samples.len(), 0), false),
        )
    } else {
        let raw = ReadOptions::builder()
            .sid_index(&sid_index)
            .i8()
            .count_a1()
            .read(&mut bed)
            .map_err(|e| bed_error(bed_path, e))?;
        let observed = raw.mapv(|g| g != -127i8);
        let values = raw.mapv(|g| if g == -127i8 { 0.0 } else { g as f64 });
        (values, observed)
    };

    let matrix = GenotypeMatrix::try_new(samples, variant_ids, values, observed)
        .map_err(|e| MqtlError::input_format(bed_path, 0, e.to_string()))?;
    info!(
        "Loaded {} samples x {} variants (of {}) from {}.",
        matrix.n_samples(),
        matrix.n_variants(),
        all_variant_ids.len(),
        bed_path.display()
    );
    Ok(matrix)
}

/// Reads a position map: `CHR SNP CM BP` (`.map`), extra trailing columns (`.bim`) ignored.
/// Variants with a negative base-pair position are excluded, as PLINK does.
pub fn read_variant_map(path: &Path) -> Result<VariantMap> {
    info!("Reading variant position map: {}", path.display());
    let mut map = VariantMap::new();
    let mut excluded = 0usize;
    for line_result in data_lines(path)? {
        let (line_num, line) = line_result?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            return Err(MqtlError::input_format(
                path,
                line_num,
                format!("expected at least 4 columns (CHR SNP CM BP), found {}", parts.len()),
            ));
        }
        let bp: i64 = parts[3].parse().map_err(|e| {
            MqtlError::input_format(path, line_num, format!("invalid base-pair position '{}': {}", parts[3], e))
        })?;
        if bp < 0 {
            excluded += 1;
            continue;
        }
        let position = VariantPosition {
            chromosome: parts[0].to_string(),
            position: bp as u64,
        };
        if map.get(parts[1]).is_some() {
            warn!(
                "{}:{}: variant '{}' mapped twice; keeping the first entry.",
                path.display(),
                line_num,
                parts[1]
            );
            continue;
        }
        map.insert(parts[1].to_string(), position);
    }
    info!(
        "Position map: {} variants ({} excluded with negative positions).",
        map.len(),
        excluded
    );
    Ok(map)
}

/// Reads the first-pass association table. The id and p-value columns are located by
/// header name once; when a `TEST` column is present only `ADD` rows are kept.
pub fn read_first_pass_file(path: &Path, columns: &FirstPassColumns) -> Result<Vec<FirstPassResult>> {
    info!("Reading first-pass association results: {}", path.display());
    let mut lines = data_lines(path)?;
    let (header_line_num, header) = match lines.next() {
        Some(line) => line?,
        None => return Err(MqtlError::input_format(path, 0, "first-pass file is empty")),
    };
    let header_parts: Vec<&str> = header.split_whitespace().collect();
    let locate = |name: &str| {
        header_parts.iter().position(|h| *h == name).ok_or_else(|| {
            MqtlError::input_format(
                path,
                header_line_num,
                format!("column '{}' not found in header {:?}", name, header_parts),
            )
        })
    };
    let id_col = locate(columns.variant_id.as_str())?;
    let p_col = locate(columns.p_value.as_str())?;
    let test_col = header_parts.iter().position(|h| *h == "TEST");
    let min_columns = id_col.max(p_col).max(test_col.unwrap_or(0)) + 1;

    let mut results = Vec::new();
    let mut skipped_tests = 0usize;
    for line_result in lines {
        let (line_num, line) = line_result?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < min_columns {
            return Err(MqtlError::input_format(
                path,
                line_num,
                format!("expected at least {} columns, found {}", min_columns, parts.len()),
            ));
        }
        if let Some(tc) = test_col {
            if parts[tc] != "ADD" {
                skipped_tests += 1;
                continue;
            }
        }
        results.push(FirstPassResult {
            variant_id: parts[id_col].to_string(),
            p_value: parse_cell(path, line_num, parts[p_col], &columns.p_value)?,
        });
    }
    if skipped_tests > 0 {
        debug!("Skipped {} non-additive test rows in {}.", skipped_tests, path.display());
    }
    info!("Read {} first-pass results from {}.", results.len(), path.display());
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("create temp file");
        file.write_all(contents.as_bytes()).expect("write temp file");
        file
    }

    #[test]
    fn family_file_is_parsed() {
        let file = temp_file("F1 S1 0 0 1 -9\n# comment\n\nF2 S2 0 0 2 1.5\n");
        let records = read_family_file(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sample_id, "S1");
        assert_eq!(records[0].phenotype, None);
        assert_eq!(records[1].sex, 2);
        assert_eq!(records[1].phenotype, Some(1.5));
    }

    #[test]
    fn wrong_column_count_reports_line() {
        let file = temp_file("F1 S1 0 0 1 -9\nF2 S2 0 0 2\n");
        match read_family_file(file.path()) {
            Err(MqtlError::InputFormat { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected InputFormat error, got {:?}", other),
        }
    }

    #[test]
    fn metabolite_file_marks_missing_values() {
        let file = temp_file("IID glucose lactate\nS1 5.1 NA\nS2 4.8 1.2\n");
        let matrix = read_metabolite_file(file.path()).unwrap();
        assert_eq!(matrix.metabolite_ids(), &["glucose".to_string(), "lactate".to_string()][..]);
        assert_eq!(matrix.get(0, 1), None);
        assert_eq!(matrix.get(1, 1), Some(1.2));

        let bad = temp_file("IID glucose\nS1 five\n");
        assert!(matches!(
            read_metabolite_file(bad.path()),
            Err(MqtlError::InputFormat { line: 2, .. })
        ));
    }

    #[test]
    fn raw_dosage_file_keeps_requested_variants() {
        let file = temp_file(
            "FID IID PAT MAT SEX PHENOTYPE rs1_A rs2_G rs3_T\n\
             F1 S1 0 0 1 -9 0 1 NA\n\
             F2 S2 0 0 2 -9 2 NA 1\n",
        );
        let wanted: HashSet<String> = ["rs1".to_string(), "rs3".to_string()].into_iter().collect();
        let matrix = read_raw_dosage_file(file.path(), Some(&wanted), '_').unwrap();
        assert_eq!(matrix.samples(), &["S1".to_string(), "S2".to_string()][..]);
        assert_eq!(matrix.variant_ids(), &["rs1_A".to_string(), "rs3_T".to_string()][..]);
        assert_eq!(matrix.get(0, 1), None);
        assert_eq!(matrix.get(1, 0), Some(2.0));

        let all = read_raw_dosage_file(file.path(), None, '_').unwrap();
        assert_eq!(all.n_variants(), 3);
    }

    #[test]
    fn raw_dosage_out_of_range_is_rejected() {
        let file = temp_file("FID IID PAT MAT SEX PHENOTYPE rs1_A\nF1 S1 0 0 1 -9 3\n");
        assert!(matches!(
            read_raw_dosage_file(file.path(), None, '_'),
            Err(MqtlError::InputFormat { line: 2, .. })
        ));
    }

    #[test]
    fn variant_map_accepts_map_and_bim_rows() {
        let file = temp_file("1 rs1 0 1000\n2 rs2 0.5 2000 A G\n3 rs3 0 -5\n1 rs1 0 9999\n");
        let map = read_variant_map(file.path()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("rs1").unwrap().position, 1000);
        assert_eq!(map.get("rs2").unwrap().chromosome, "2");
        assert!(map.get("rs3").is_none());
    }

    #[test]
    fn first_pass_columns_are_resolved_by_name() {
        let file = temp_file(
            " CHR SNP BP A1 TEST NMISS BETA STAT P\n\
              1 rs1 100 A ADD 50 0.3 4.1 1e-9\n\
              1 rs1 100 A COV1 50 0.1 1.0 0.3\n\
              1 rs2 200 G ADD 50 NA NA NA\n",
        );
        let results = read_first_pass_file(file.path(), &FirstPassColumns::default()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].p_value, Some(1e-9));
        assert_eq!(results[1].p_value, None);

        let columns = FirstPassColumns {
            variant_id: "ID".to_string(),
            p_value: "P".to_string(),
        };
        assert!(matches!(
            read_first_pass_file(file.path(), &columns),
            Err(MqtlError::InputFormat { line: 1, .. })
        ));
    }
}
