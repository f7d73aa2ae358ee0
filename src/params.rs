use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::error::AppError;

/// Parameter file contents, loaded once per run/merge invocation.
///
/// The file is the external program's own `key<TAB>value` format; values may
/// carry comma-separated per-K lists which are resolved separately by
/// [`resolve_per_k_overrides`].
#[derive(Debug)]
pub struct ParameterTable {
    path: PathBuf,
    lines: Vec<String>,
}

impl ParameterTable {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let file = File::open(path).map_err(|source| AppError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);
        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|source| AppError::ConfigRead {
                path: path.to_path_buf(),
                source,
            })?;
            lines.push(line);
        }
        Ok(Self {
            path: path.to_path_buf(),
            lines,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up the requested keys and return the subset that matched.
    ///
    /// A line only matches a key when the key is followed by a tab, so that
    /// e.g. "alpha" never picks up "alphaPropSD". The value is the second
    /// whitespace-separated token of the line. Returns `None` when none of
    /// the requested keys matched anything; callers treat that as "use the
    /// default" and log it.
    pub fn query(&self, keys: &[&str]) -> Option<HashMap<String, String>> {
        let mut result = HashMap::new();
        for line in &self.lines {
            for key in keys {
                let anchored = line
                    .strip_prefix(*key)
                    .map_or(false, |rest| rest.starts_with('\t'));
                if anchored {
                    let mut tokens = line.split_whitespace();
                    if let (Some(k), Some(v)) = (tokens.next(), tokens.next()) {
                        result.insert(k.to_string(), v.to_string());
                    }
                }
            }
        }
        if result.is_empty() {
            None
        } else {
            Some(result)
        }
    }

    /// Single-key convenience wrapper around [`ParameterTable::query`].
    pub fn query_one(&self, key: &str) -> Option<String> {
        self.query(&[key]).and_then(|mut m| m.remove(key))
    }
}

/// True when a toggle value spells "off" the way the external program does.
pub fn value_is_off(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "f" | "false" | "0")
}

/// True when a toggle value spells "on" the way the external program does.
pub fn value_is_on(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "t" | "true" | "1")
}

/// A configuration value that may either hold for every K or vary with K.
#[derive(Debug, Clone, PartialEq)]
pub enum PerKOverride {
    Constant(String),
    PerK(HashMap<u32, String>),
}

/// Resolve parameters whose value may be a comma-separated per-K list.
///
/// A single token yields `Constant`; multiple tokens must count exactly
/// `k_list.len()` (anything else silently corrupts the per-K runs, so it is
/// a fatal configuration error). Parameters absent from the table are
/// omitted from the result.
pub fn resolve_per_k_overrides(
    table: &ParameterTable,
    params: &[&str],
    k_list: &[u32],
) -> Result<HashMap<String, PerKOverride>, AppError> {
    let mut resolved = HashMap::new();
    let parsed = match table.query(params) {
        Some(parsed) => parsed,
        None => return Ok(resolved),
    };
    for (param, raw) in parsed {
        let tokens: Vec<String> = raw.split(',').map(|t| t.to_string()).collect();
        if tokens.len() == 1 {
            resolved.insert(param, PerKOverride::Constant(raw));
        } else if tokens.len() != k_list.len() {
            return Err(AppError::ConfigValueMismatch {
                param,
                expected: k_list.len(),
                found: tokens.len(),
            });
        } else {
            let mapping: HashMap<u32, String> =
                k_list.iter().copied().zip(tokens.into_iter()).collect();
            resolved.insert(param, PerKOverride::PerK(mapping));
        }
    }
    Ok(resolved)
}
