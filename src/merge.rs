use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Args;

use crate::error::AppError;
use crate::normalize;
use crate::params::{value_is_off, value_is_on, ParameterTable};
use crate::{bestk, run};

/// Evidence categories consumed from the primary evidence table.
pub const EVIDENCE_CATEGORIES: [&str; 3] = ["harmonic_grand", "structure_grand", "TI"];

const DEFAULT_EVIDENCE_FILE: &str = "outputEvidence.csv";
const DEFAULT_DETAILS_FILE: &str = "outputEvidenceDetails.csv";
const DEFAULT_NORMALIZED_FILE: &str = "outputEvidenceNormalised.csv";

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Results directory containing the per-K run directories
    #[arg(short = 'o', long = "output")]
    pub outpath: String,
    /// Parameter file consumed by the inference runs
    #[arg(short = 'p', long = "params")]
    pub params: String,
    /// Largest K to process (expands to 1..=K)
    #[arg(short = 'K', long = "kmax")]
    pub kmax: Option<u32>,
    /// Explicit comma-separated K list (alternative to -K)
    #[arg(long = "ks")]
    pub ks: Option<String>,
    /// Skip evidence normalization and bestK estimation
    #[arg(long = "no-tests", default_value_t = false)]
    pub notests: bool,
    /// Monte Carlo draws per K for evidence normalization
    #[arg(long = "draws", default_value_t = normalize::DEFAULT_DRAWS)]
    pub draws: usize,
    /// Two-sided confidence level in percent
    #[arg(long = "limit", default_value_t = normalize::DEFAULT_LIMIT)]
    pub limit: f64,
    /// Random seed for reproducible normalization
    #[arg(long = "seed")]
    pub seed: Option<u64>,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

/// Primary evidence table accumulated across the per-K fragments.
///
/// One column per header token of the evidence file, one entry per K in
/// K-list order. `append` enforces the equal-length-columns invariant on
/// every call instead of trusting ad hoc map mutation.
#[derive(Debug, Default)]
pub struct EvidenceTable {
    columns: Vec<String>,
    values: HashMap<String, Vec<String>>,
    rows: usize,
}

impl EvidenceTable {
    /// Append one K's header/data token pair.
    pub fn append(&mut self, file: &str, k: u32, header: &[&str], data: &[&str]) -> Result<(), AppError> {
        if header.len() != data.len() {
            return Err(AppError::SchemaMismatch {
                file: file.to_string(),
                detail: format!(
                    "K={}: {} header columns but {} data columns",
                    k,
                    header.len(),
                    data.len()
                ),
            });
        }
        if self.columns.is_empty() {
            self.columns = header.iter().map(|h| h.to_string()).collect();
        } else if self.columns.len() != header.len() {
            return Err(AppError::SchemaMismatch {
                file: file.to_string(),
                detail: format!(
                    "K={}: expected {} columns, found {}",
                    k,
                    self.columns.len(),
                    header.len()
                ),
            });
        }
        for (h, v) in header.iter().zip(data.iter()) {
            self.values
                .entry(h.to_string())
                .or_default()
                .push(v.to_string());
        }
        self.rows += 1;
        // A renamed header token leaves a short column behind.
        for column in &self.columns {
            if self.values.get(column).map(|v| v.len()) != Some(self.rows) {
                return Err(AppError::SchemaMismatch {
                    file: file.to_string(),
                    detail: format!("K={}: column '{}' missing from fragment header", k, column),
                });
            }
        }
        Ok(())
    }

    pub fn n_rows(&self) -> usize {
        self.rows
    }

    pub fn column(&self, name: &str) -> Option<&Vec<String>> {
        self.values.get(name)
    }

    /// Fetch a column and parse it as f64, one value per K.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<f64>, AppError> {
        let raw = self.values.get(name).ok_or_else(|| AppError::SchemaMismatch {
            file: "evidence table".to_string(),
            detail: format!("required column '{}' is absent", name),
        })?;
        raw.iter()
            .map(|v| {
                v.trim().parse::<f64>().map_err(|_| AppError::EvidenceParse {
                    column: name.to_string(),
                    value: v.clone(),
                })
            })
            .collect()
    }
}

/// Decide which logical output files get merged, based on the parameter
/// file's filename overrides and feature toggles. Returns the file list and
/// the (possibly escalated) no-tests flag: `outputEvidence_on` set to false
/// disables the evidence tests entirely.
pub fn files_to_merge(
    table: &ParameterTable,
    no_tests: bool,
    logger: &mut crate::Logger,
) -> Result<(Vec<String>, bool), AppError> {
    let output_params = [
        "outputEvidence",
        "outputEvidence_on",
        "outputEvidenceDetails_on",
        "outputEvidenceDetails",
    ];
    let mut no_tests = no_tests;

    let parsed = match table.query(&output_params) {
        Some(parsed) => parsed,
        None => {
            logger.log(&format!(
                "Failed to find the parameter(s) {:?} in {}. Using default output filenames.",
                output_params,
                table.path().display()
            ))?;
            HashMap::new()
        }
    };

    if let Some(value) = parsed.get("outputEvidence_on") {
        if value_is_off(value) {
            no_tests = true;
            logger.log("'outputEvidence' is set to false. Tests will be skipped.")?;
        }
    }

    let mut files = Vec::new();
    files.push(
        parsed
            .get("outputEvidence")
            .cloned()
            .unwrap_or_else(|| DEFAULT_EVIDENCE_FILE.to_string()),
    );

    let details_file = parsed
        .get("outputEvidenceDetails")
        .cloned()
        .unwrap_or_else(|| DEFAULT_DETAILS_FILE.to_string());
    match parsed.get("outputEvidenceDetails_on") {
        Some(value) if value_is_on(value) => files.push(details_file),
        Some(_) => {}
        None => files.push(details_file),
    }

    Ok((files, no_tests))
}

/// Read one per-K fragment: a header line plus exactly one data row.
fn read_fragment(path: &Path, filename: &str, k: u32) -> Result<(String, String), AppError> {
    if !path.is_file() {
        return Err(AppError::MissingRunOutput {
            k,
            path: path.to_path_buf(),
        });
    }
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(line) => line?,
        None => {
            return Err(AppError::SchemaMismatch {
                file: filename.to_string(),
                detail: format!("fragment for K={} is empty", k),
            })
        }
    };
    let data = match lines.next() {
        Some(line) => line?,
        None => {
            return Err(AppError::SchemaMismatch {
                file: filename.to_string(),
                detail: format!("fragment for K={} has no data row", k),
            })
        }
    };
    Ok((header, data))
}

/// Merge the per-K fragments of every logical output file into
/// `<out_dir>/merged/` and build the evidence table from the primary file.
///
/// Every fragment of a logical file is read and validated before its merged
/// file is written, so a missing or malformed run never leaves a partial
/// merged output behind.
pub fn merge(
    out_dir: &Path,
    k_list: &[u32],
    files: &[String],
    logger: &mut crate::Logger,
) -> Result<EvidenceTable, AppError> {
    let merged_dir = out_dir.join("merged");
    std::fs::create_dir_all(&merged_dir)?;

    let mut evidence = EvidenceTable::default();
    let mut progress = crate::progress::SimpleProgress::new(files.len() * k_list.len());
    let mut done = 0;

    for (file_idx, filename) in files.iter().enumerate() {
        let mut fragments: Vec<(u32, String, String)> = Vec::with_capacity(k_list.len());
        for &k in k_list {
            let path = run::run_dir(out_dir, k).join(filename);
            let (header, data) = read_fragment(&path, filename, k)?;
            if let Some((first_k, first_header, _)) = fragments.first() {
                if first_header.split(',').count() != header.split(',').count() {
                    return Err(AppError::SchemaMismatch {
                        file: filename.clone(),
                        detail: format!(
                            "K={} has {} header columns, K={} has {}",
                            k,
                            header.split(',').count(),
                            first_k,
                            first_header.split(',').count()
                        ),
                    });
                }
            }
            fragments.push((k, header, data));
            done += 1;
            progress.update(done)?;
        }

        // The primary evidence file also feeds the in-memory table.
        if file_idx == 0 {
            for (k, header, data) in &fragments {
                let header_tokens: Vec<&str> = header.split(',').collect();
                let data_tokens: Vec<&str> = data.split(',').collect();
                evidence.append(filename, *k, &header_tokens, &data_tokens)?;
            }
        }

        let merged_path = merged_dir.join(filename);
        let mut out = BufWriter::new(File::create(&merged_path)?);
        writeln!(out, "{}", fragments[0].1)?;
        for (_, _, data) in &fragments {
            writeln!(out, "{}", data)?;
        }
        out.flush()?;
        logger.log(&format!(
            "Merged {} fragments into {}",
            fragments.len(),
            merged_path.display()
        ))?;
    }
    progress.finish()?;

    Ok(evidence)
}

/// Resolve the normalized-output filename from the parameter file.
pub fn normalized_output_name(table: &ParameterTable, logger: &mut crate::Logger) -> Result<String, AppError> {
    match table.query_one("outputEvidenceNormalised") {
        Some(name) => Ok(name),
        None => {
            logger.log(&format!(
                "Parameter 'outputEvidenceNormalised' not found in {}. Using the default '{}'.",
                table.path().display(),
                DEFAULT_NORMALIZED_FILE
            ))?;
            Ok(DEFAULT_NORMALIZED_FILE.to_string())
        }
    }
}

/// Normalize every evidence category and write the posterior table.
///
/// One row per K in K-list order; per category the columns are
/// `posterior_<cat>_mean`, `posterior_<cat>_LL` and `posterior_<cat>_UL`,
/// with the `_grand` suffix stripped from the category name.
pub fn write_normalized(
    out_dir: &Path,
    table: &ParameterTable,
    evidence: &EvidenceTable,
    k_list: &[u32],
    draws: usize,
    limit: f64,
    seed: Option<u64>,
    logger: &mut crate::Logger,
) -> Result<PathBuf, AppError> {
    let filename = normalized_output_name(table, logger)?;
    let filepath = out_dir.join("merged").join(filename);

    let mut per_category = Vec::with_capacity(EVIDENCE_CATEGORIES.len());
    for category in EVIDENCE_CATEGORIES {
        let means = evidence.numeric_column(&format!("logEvidence_{}Mean", category))?;
        let sds = evidence.numeric_column(&format!("logEvidence_{}SE", category))?;
        let normalized = normalize::normalize_evidence(&means, &sds, k_list, draws, limit, seed)?;
        logger.log(&format!(
            "Normalized category {} over {} draws",
            category, draws
        ))?;
        per_category.push(normalized);
    }

    let mut out = BufWriter::new(File::create(&filepath)?);
    let mut header = vec!["K".to_string()];
    for category in EVIDENCE_CATEGORIES {
        let short = category.replace("_grand", "");
        for suffix in ["_mean", "_LL", "_UL"] {
            header.push(format!("posterior_{}{}", short, suffix));
        }
    }
    writeln!(out, "{}", header.join(","))?;

    for (row, &k) in k_list.iter().enumerate() {
        let mut fields = vec![k.to_string()];
        for normalized in &per_category {
            let (_, entry) = normalized[row];
            fields.push(format!("{:.6}", entry.norm_mean));
            fields.push(format!("{:.6}", entry.lower_limit));
            fields.push(format!("{:.6}", entry.upper_limit));
        }
        writeln!(out, "{}", fields.join(","))?;
    }
    out.flush()?;

    Ok(filepath)
}

/// Entry point of the merge subcommand: consolidate the per-K outputs,
/// normalize the evidence and estimate the best K.
pub fn merge_results(
    args: &MergeArgs,
    k_list: &[u32],
    logger: &mut crate::Logger,
) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();
    let out_dir = Path::new(&args.outpath);

    println!("[Loading data]");
    println!("    Results root: {}", args.outpath);
    println!("    Parameters: {}", args.params);
    println!();

    let table = ParameterTable::load(Path::new(&args.params))?;

    let mut no_tests = args.notests;
    if !bestk::ti_in_use(&table, logger)? {
        no_tests = true;
    }
    let (files, no_tests) = files_to_merge(&table, no_tests, logger)?;
    logger.log(&format!("Output files to merge: {:?}", files))?;

    let evidence = merge(out_dir, k_list, &files, logger)?;
    logger.log(&format!(
        "Evidence table holds {} rows, one per K",
        evidence.n_rows()
    ))?;
    println!("[Output]");
    println!("    Merged tables: {}", out_dir.join("merged").display());

    if no_tests {
        logger.log("Tests are disabled; skipping evidence normalization and bestK estimation.")?;
        println!("[Warning] Tests are disabled; bestK estimation was skipped.");
    } else {
        let normalized_path = write_normalized(
            out_dir,
            &table,
            &evidence,
            k_list,
            args.draws,
            args.limit,
            args.seed,
            logger,
        )?;
        println!("    Normalized evidence: {}", normalized_path.display());

        let best_k = bestk::select_best(&evidence, k_list, out_dir)?;
        logger.log(&format!("Best supported K: {}", best_k))?;
        println!("    Best supported K: {}", best_k);
    }

    let elapsed = start_time.elapsed();
    println!("{}", crate::progress::format_time_used(elapsed));
    logger.log(&format!("Merge completed in {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}
