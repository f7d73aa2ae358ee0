use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to read parameter file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("The number of values provided for the {param} parameter ({found}) is not the same as the number of 'Ks' provided ({expected}). Please correct this.")]
    ConfigValueMismatch {
        param: String,
        expected: usize,
        found: usize,
    },
    #[error("Missing run output for K={k}: {path}")]
    MissingRunOutput { k: u32, path: PathBuf },
    #[error("Schema mismatch in {file}: {detail}")]
    SchemaMismatch { file: String, detail: String },
    #[error("Failed to parse evidence column {column}: bad value '{value}'")]
    EvidenceParse { column: String, value: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
