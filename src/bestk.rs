use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::AppError;
use crate::merge::EvidenceTable;
use crate::params::{value_is_off, ParameterTable};

/// Check whether thermodynamic integration is in use.
///
/// An absent parameter means the external program's default ('on'); an
/// explicit off value means the STRUCTURE-style criteria have to be used
/// for bestK estimation instead, which is outside this tool. Both cases
/// are logged, neither is fatal.
pub fn ti_in_use(table: &ParameterTable, logger: &mut crate::Logger) -> Result<bool, AppError> {
    match table.query_one("thermodynamic_on") {
        Some(value) if value_is_off(&value) => {
            logger.log(
                "Thermodynamic integration is turned OFF. Using STRUCTURE criteria for bestK estimation.",
            )?;
            Ok(false)
        }
        Some(_) => Ok(true),
        None => {
            logger.log(
                "The parameter setting 'thermodynamic_on' was not found. Assuming the default 'on' value.",
            )?;
            Ok(true)
        }
    }
}

/// Pick the best-supported K from the thermodynamic integration results and
/// write the verdict file.
///
/// The winner has the maximal TI mean log-evidence; ties go to the earlier
/// K in list order.
pub fn select_best(
    evidence: &EvidenceTable,
    k_list: &[u32],
    out_dir: &Path,
) -> Result<u32, AppError> {
    let ti_means = evidence.numeric_column("logEvidence_TIMean")?;
    if ti_means.len() != k_list.len() {
        return Err(AppError::SchemaMismatch {
            file: "evidence table".to_string(),
            detail: format!(
                "{} TI entries for {} K values",
                ti_means.len(),
                k_list.len()
            ),
        });
    }

    let mut best_idx = 0;
    for (i, value) in ti_means.iter().enumerate() {
        if *value > ti_means[best_idx] {
            best_idx = i;
        }
    }
    let best_k = k_list[best_idx];

    let bestk_dir = out_dir.join("bestK");
    std::fs::create_dir_all(&bestk_dir)?;
    let mut out = BufWriter::new(File::create(bestk_dir.join("TI_integration.txt"))?);
    writeln!(
        out,
        "MavericK's estimation test revealed that the best value of 'K' is: {}",
        best_k
    )?;
    out.flush()?;

    Ok(best_k)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence_with_ti(k_list: &[u32], ti_means: &[f64]) -> EvidenceTable {
        let mut evidence = EvidenceTable::default();
        for (k, mean) in k_list.iter().zip(ti_means.iter()) {
            let k_field = k.to_string();
            let mean_field = mean.to_string();
            evidence
                .append(
                    "outputEvidence.csv",
                    *k,
                    &["K", "logEvidence_TIMean"],
                    &[k_field.as_str(), mean_field.as_str()],
                )
                .unwrap();
        }
        evidence
    }

    #[test]
    fn maximal_ti_mean_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let k_list = vec![1, 2, 3];
        let evidence = evidence_with_ti(&k_list, &[-310.0, -290.5, -300.0]);

        let best = select_best(&evidence, &k_list, tmp.path()).unwrap();
        assert_eq!(best, 2);

        let verdict =
            std::fs::read_to_string(tmp.path().join("bestK/TI_integration.txt")).unwrap();
        assert_eq!(
            verdict,
            "MavericK's estimation test revealed that the best value of 'K' is: 2\n"
        );
    }

    #[test]
    fn ties_break_to_the_earlier_k() {
        let tmp = tempfile::tempdir().unwrap();
        let k_list = vec![2, 3, 4];
        let evidence = evidence_with_ti(&k_list, &[-50.0, -50.0, -60.0]);
        assert_eq!(select_best(&evidence, &k_list, tmp.path()).unwrap(), 2);
    }

    #[test]
    fn ti_toggle_parsing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut logger =
            crate::Logger::new(File::create(tmp.path().join("test.log")).unwrap());

        let path = tmp.path().join("parameters.txt");

        std::fs::write(&path, "thermodynamic_on\tf\n").unwrap();
        let table = ParameterTable::load(&path).unwrap();
        assert!(!ti_in_use(&table, &mut logger).unwrap());

        std::fs::write(&path, "thermodynamic_on\tt\n").unwrap();
        let table = ParameterTable::load(&path).unwrap();
        assert!(ti_in_use(&table, &mut logger).unwrap());

        std::fs::write(&path, "data\tinput.str\n").unwrap();
        let table = ParameterTable::load(&path).unwrap();
        assert!(ti_in_use(&table, &mut logger).unwrap());
    }
}
