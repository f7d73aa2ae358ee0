use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use clap::Args;
use rayon::prelude::*;

use crate::error::AppError;
use crate::params::{resolve_per_k_overrides, ParameterTable, PerKOverride};

/// Parameters that may carry comma-separated per-K value lists.
const PER_K_PARAMS: [&str; 2] = ["alpha", "alphaPropSD"];

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the external inference program
    #[arg(short = 'e', long = "external")]
    pub external_prog: String,
    /// Input data file
    #[arg(short = 'i', long = "input")]
    pub infile: String,
    /// Results directory (per-K run directories are created under it)
    #[arg(short = 'o', long = "output")]
    pub outpath: String,
    /// Parameter file consumed by the inference runs
    #[arg(short = 'p', long = "params")]
    pub params: String,
    /// Largest K to run (expands to 1..=K)
    #[arg(short = 'K', long = "kmax")]
    pub kmax: Option<u32>,
    /// Explicit comma-separated K list (alternative to -K)
    #[arg(long = "ks")]
    pub ks: Option<String>,
    /// Turn thermodynamic integration off for every run
    #[arg(long = "no-tests", default_value_t = false)]
    pub notests: bool,
    /// Number of parallel runs
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

/// Per-K run directory under the results root.
pub fn run_dir(out_dir: &Path, k: u32) -> PathBuf {
    out_dir.join(format!("mav_K{}", k))
}

/// Assemble the external-program invocation for one K and create its output
/// directory (a pre-existing directory is not an error).
///
/// Only `PerK` overrides are injected on the command line; constants are
/// already in the shared parameter file the run reads anyway.
pub fn build_run_command(
    external_prog: &str,
    infile: &str,
    outpath: &Path,
    params_path: &str,
    k: u32,
    no_tests: bool,
    overrides: &HashMap<String, PerKOverride>,
) -> Result<(Vec<String>, PathBuf), AppError> {
    let output_dir = run_dir(outpath, k);
    std::fs::create_dir_all(&output_dir)?;

    // The external program requires a trailing separator on its output root.
    let mut output_root = output_dir.to_string_lossy().into_owned();
    output_root.push(std::path::MAIN_SEPARATOR);
    let master_root = if cfg!(windows) {
        String::new()
    } else {
        "/".to_string()
    };

    let mut cli = vec![
        external_prog.to_string(),
        "-Kmin".to_string(),
        k.to_string(),
        "-Kmax".to_string(),
        k.to_string(),
        "-data".to_string(),
        infile.to_string(),
        "-outputRoot".to_string(),
        output_root,
        "-masterRoot".to_string(),
        master_root,
        "-parameters".to_string(),
        params_path.to_string(),
    ];
    if no_tests {
        cli.push("-thermodynamic_on".to_string());
        cli.push("f".to_string());
    }

    let mut names: Vec<&String> = overrides.keys().collect();
    names.sort();
    for name in names {
        if let PerKOverride::PerK(mapping) = &overrides[name] {
            if let Some(value) = mapping.get(&k) {
                cli.push(format!("-{}", name));
                cli.push(value.clone());
            }
        }
    }

    Ok((cli, output_dir))
}

fn execute_run(cli: &[String], k: u32, output_dir: &Path) -> Result<(), String> {
    let output = Command::new(&cli[0])
        .args(&cli[1..])
        .output()
        .map_err(|e| format!("Failed to launch {} for K={}: {}", cli[0], k, e))?;

    // Keep the program's console output next to its result files.
    std::fs::write(output_dir.join("run_stdout.txt"), &output.stdout)
        .map_err(|e| format!("Failed to save run output for K={}: {}", k, e))?;

    if !output.status.success() {
        return Err(format!(
            "Inference run for K={} exited with {}: {}",
            k,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// Entry point of the run subcommand: launch the external program once per
/// candidate K, in parallel. The per-K runs share nothing, so the first
/// failure aborts the whole batch.
pub fn run_inference(
    args: &RunArgs,
    k_list: &[u32],
    logger: &mut crate::Logger,
) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();

    let num_threads = args.threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    });

    println!("[Loading data] Threads={}", num_threads);
    println!("    Program: {}", args.external_prog);
    println!("    Data: {}", args.infile);
    println!("    Parameters: {}", args.params);
    println!();

    let table = ParameterTable::load(Path::new(&args.params))?;
    let overrides = resolve_per_k_overrides(&table, &PER_K_PARAMS, k_list)?;
    if overrides.is_empty() {
        logger.log(&format!(
            "None of the parameters {:?} are set in {}; no per-K overrides to inject.",
            PER_K_PARAMS, args.params
        ))?;
    }
    for (param, value) in &overrides {
        if let PerKOverride::PerK(_) = value {
            logger.log(&format!("Parameter {} varies with K", param))?;
        }
    }

    let outpath = Path::new(&args.outpath);
    std::fs::create_dir_all(outpath)?;

    let mut commands = Vec::with_capacity(k_list.len());
    for &k in k_list {
        let (cli, output_dir) = build_run_command(
            &args.external_prog,
            &args.infile,
            outpath,
            &args.params,
            k,
            args.notests,
            &overrides,
        )?;
        logger.log(&format!("K={} command: {}", k, cli.join(" ")))?;
        commands.push((k, cli, output_dir));
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()?;

    let completed = AtomicUsize::new(0);
    let total = commands.len();
    let results: Vec<Result<(), String>> = pool.install(|| {
        commands
            .par_iter()
            .map(|(k, cli, output_dir)| {
                let result = execute_run(cli, *k, output_dir);
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                print!("\r[Running] {}/{} K values finished", done, total);
                use std::io::Write as _;
                std::io::stdout().flush().ok();
                result
            })
            .collect()
    });
    println!();

    for result in results {
        if let Err(message) = result {
            logger.log(&message)?;
            return Err(message.into());
        }
    }

    let elapsed = start_time.elapsed();
    println!("[Output] Per-K results: {}", args.outpath);
    println!("{}", crate::progress::format_time_used(elapsed));
    logger.log(&format!(
        "All {} runs completed in {:.2}s",
        total,
        elapsed.as_secs_f64()
    ))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides_with(entries: &[(&str, PerKOverride)]) -> HashMap<String, PerKOverride> {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn command_layout_matches_the_external_interface() {
        let tmp = tempfile::tempdir().unwrap();
        let (cli, output_dir) = build_run_command(
            "/opt/bin/maverick",
            "data.str",
            tmp.path(),
            "parameters.txt",
            3,
            false,
            &HashMap::new(),
        )
        .unwrap();

        assert_eq!(output_dir, tmp.path().join("mav_K3"));
        assert!(output_dir.is_dir());
        assert_eq!(cli[0], "/opt/bin/maverick");
        assert_eq!(&cli[1..5], &["-Kmin", "3", "-Kmax", "3"]);
        assert_eq!(&cli[5..7], &["-data", "data.str"]);
        assert_eq!(cli[7], "-outputRoot");
        assert!(cli[8].ends_with(std::path::MAIN_SEPARATOR));
        assert_eq!(&cli[11..13], &["-parameters", "parameters.txt"]);
        assert!(!cli.contains(&"-thermodynamic_on".to_string()));
    }

    #[test]
    fn no_tests_turns_thermodynamic_integration_off() {
        let tmp = tempfile::tempdir().unwrap();
        let (cli, _) = build_run_command(
            "maverick",
            "data.str",
            tmp.path(),
            "parameters.txt",
            1,
            true,
            &HashMap::new(),
        )
        .unwrap();
        let pos = cli.iter().position(|a| a == "-thermodynamic_on").unwrap();
        assert_eq!(cli[pos + 1], "f");
    }

    #[test]
    fn only_per_k_overrides_are_injected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mapping = HashMap::new();
        mapping.insert(1, "0.5".to_string());
        mapping.insert(2, "0.7".to_string());
        let overrides = overrides_with(&[
            ("alpha", PerKOverride::PerK(mapping)),
            ("alphaPropSD", PerKOverride::Constant("0.1".to_string())),
        ]);

        let (cli, _) = build_run_command(
            "maverick",
            "data.str",
            tmp.path(),
            "parameters.txt",
            2,
            false,
            &overrides,
        )
        .unwrap();

        let pos = cli.iter().position(|a| a == "-alpha").unwrap();
        assert_eq!(cli[pos + 1], "0.7");
        assert!(!cli.contains(&"-alphaPropSD".to_string()));
    }

    #[test]
    fn directory_creation_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("mav_K1")).unwrap();
        let result = build_run_command(
            "maverick",
            "data.str",
            tmp.path(),
            "parameters.txt",
            1,
            false,
            &HashMap::new(),
        );
        assert!(result.is_ok());
    }
}
