// Version information constants
const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::error::Error;
use std::io::{BufWriter, Write};
use std::path::Path;

use clap::{Parser, Subcommand};

mod bestk;
mod error;
mod merge;
mod normalize;
mod params;
mod plot;
mod progress;
mod run;

/// Logger manager writing timestamped entries to the command's log file
pub struct Logger {
    writer: BufWriter<std::fs::File>,
}

impl Logger {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            writer: BufWriter::new(file),
        }
    }

    /// Record detailed log information
    pub fn log(&mut self, message: &str) -> std::io::Result<()> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(self.writer, "[{}] {}", timestamp, message)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the external inference program once per candidate K
    Run(run::RunArgs),
    /// Merge per-K outputs, normalize evidence and estimate the best K
    Merge(merge::MergeArgs),
    /// Render ancestry matrices as stacked bar charts
    Plot(plot::PlotArgs),
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            validate_run_args(&args)?;
            let k_list = parse_k_list(args.kmax, args.ks.as_deref())?;

            let log_file = if let Some(log_path) = &args.log {
                std::fs::File::create(log_path)?
            } else {
                std::fs::File::create("run.log")?
            };
            let mut logger = Logger::new(log_file);

            logger.log("=== PopStruct Run Function Log ===")?;
            logger.log(&format!("Software Version: v{}", VERSION))?;
            logger.log(&format!(
                "Runtime: {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
            ))?;
            logger.log(&format!("External Program: {}", args.external_prog))?;
            logger.log(&format!("Data File: {}", args.infile))?;
            logger.log(&format!("Parameter File: {}", args.params))?;
            logger.log(&format!("K List: {:?}", k_list))?;
            logger.log("Starting per-K inference runs...")?;

            let result = run::run_inference(&args, &k_list, &mut logger);
            match &result {
                Ok(_) => logger.log("All inference runs completed")?,
                Err(e) => logger.log(&format!("Inference runs failed: {}", e))?,
            }
            result
        }
        Commands::Merge(args) => {
            validate_merge_args(&args)?;
            let k_list = parse_k_list(args.kmax, args.ks.as_deref())?;

            let log_file = if let Some(log_path) = &args.log {
                std::fs::File::create(log_path)?
            } else {
                std::fs::File::create("merge.log")?
            };
            let mut logger = Logger::new(log_file);

            logger.log("=== PopStruct Merge Function Log ===")?;
            logger.log(&format!("Software Version: v{}", VERSION))?;
            logger.log(&format!(
                "Runtime: {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
            ))?;
            logger.log(&format!("Results Directory: {}", args.outpath))?;
            logger.log(&format!("Parameter File: {}", args.params))?;
            logger.log(&format!("K List: {:?}", k_list))?;
            logger.log(&format!("Monte Carlo Draws: {}", args.draws))?;
            logger.log(&format!("Confidence Level: {}", args.limit))?;
            logger.log("Starting result merging...")?;

            let result = merge::merge_results(&args, &k_list, &mut logger);
            match &result {
                Ok(_) => logger.log("Merging completed")?,
                Err(e) => logger.log(&format!("Merging failed: {}", e))?,
            }
            result
        }
        Commands::Plot(args) => {
            validate_plot_args(&args)?;

            let log_file = if let Some(log_path) = &args.log {
                std::fs::File::create(log_path)?
            } else {
                std::fs::File::create("plot.log")?
            };
            let mut logger = Logger::new(log_file);

            logger.log("=== PopStruct Plot Function Log ===")?;
            logger.log(&format!("Software Version: v{}", VERSION))?;
            logger.log(&format!(
                "Runtime: {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
            ))?;
            logger.log(&format!("Input Files: {}", args.input))?;
            logger.log(&format!("Format: {}", args.format))?;
            logger.log("Starting ancestry plotting...")?;

            let result = plot::plot_ancestry_charts(&args, &mut logger);
            match &result {
                Ok(_) => logger.log("Plotting completed")?,
                Err(e) => logger.log(&format!("Plotting failed: {}", e))?,
            }
            result
        }
    }
}

/// Build the candidate K list from either -K (1..=K) or an explicit --ks
/// list. The list must be non-empty, strictly positive and duplicate-free.
fn parse_k_list(kmax: Option<u32>, ks: Option<&str>) -> Result<Vec<u32>, Box<dyn Error>> {
    match (kmax, ks) {
        (Some(_), Some(_)) => Err("Error: -K and --ks are mutually exclusive".into()),
        (None, None) => Err("Error: one of -K or --ks is required".into()),
        (Some(kmax), None) => {
            if kmax == 0 {
                return Err("Error: K must be greater than 0".into());
            }
            Ok((1..=kmax).collect())
        }
        (None, Some(ks)) => {
            let mut k_list = Vec::new();
            for token in ks.split(',') {
                let token = token.trim();
                if token.is_empty() {
                    continue;
                }
                let k: u32 = token
                    .parse()
                    .map_err(|_| format!("Error: invalid K value: {}", token))?;
                if k == 0 {
                    return Err("Error: K values must be greater than 0".into());
                }
                if k_list.contains(&k) {
                    return Err(format!("Error: duplicate K value: {}", k).into());
                }
                k_list.push(k);
            }
            if k_list.is_empty() {
                return Err("Error: the K list cannot be empty".into());
            }
            Ok(k_list)
        }
    }
}

/// Validate run command arguments
fn validate_run_args(args: &run::RunArgs) -> Result<(), Box<dyn Error>> {
    if args.external_prog.trim().is_empty() {
        return Err("Error: external program path cannot be empty".into());
    }
    if args.infile.trim().is_empty() {
        return Err("Error: input file path cannot be empty".into());
    }
    if !Path::new(&args.infile).exists() {
        return Err(format!("Error: input file does not exist: {}", args.infile).into());
    }
    if args.params.trim().is_empty() {
        return Err("Error: parameter file path cannot be empty".into());
    }
    if !Path::new(&args.params).exists() {
        return Err(format!("Error: parameter file does not exist: {}", args.params).into());
    }
    if args.outpath.trim().is_empty() {
        return Err("Error: output directory path cannot be empty".into());
    }
    if let Some(threads) = args.threads {
        if threads == 0 {
            return Err("Error: thread count cannot be 0".into());
        }
        if threads > 64 {
            return Err(format!("Error: thread count cannot exceed 64 (current: {})", threads).into());
        }
    }
    Ok(())
}

/// Validate merge command arguments
fn validate_merge_args(args: &merge::MergeArgs) -> Result<(), Box<dyn Error>> {
    if args.outpath.trim().is_empty() {
        return Err("Error: results directory path cannot be empty".into());
    }
    if !Path::new(&args.outpath).is_dir() {
        return Err(format!("Error: results directory does not exist: {}", args.outpath).into());
    }
    if args.params.trim().is_empty() {
        return Err("Error: parameter file path cannot be empty".into());
    }
    if !Path::new(&args.params).exists() {
        return Err(format!("Error: parameter file does not exist: {}", args.params).into());
    }
    if args.draws == 0 {
        return Err("Error: the number of Monte Carlo draws cannot be 0".into());
    }
    if args.limit <= 0.0 || args.limit >= 100.0 {
        return Err(format!(
            "Error: the confidence level must be between 0 and 100, current: {}",
            args.limit
        )
        .into());
    }
    Ok(())
}

/// Validate plot command arguments
fn validate_plot_args(args: &plot::PlotArgs) -> Result<(), Box<dyn Error>> {
    if args.input.trim().is_empty() {
        return Err("Error: input file list cannot be empty".into());
    }
    for file in args.input.split(',') {
        let file = file.trim();
        if file.is_empty() {
            continue;
        }
        if !Path::new(file).exists() {
            return Err(format!("Error: ancestry file does not exist: {}", file).into());
        }
    }
    args.format.parse::<plot::AncestryFormat>()?;
    if args.output.trim().is_empty() {
        return Err("Error: output directory path cannot be empty".into());
    }
    if let Some(popfile) = &args.popfile {
        if !Path::new(popfile).exists() {
            return Err(format!("Error: popfile does not exist: {}", popfile).into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kmax_expands_from_one() {
        assert_eq!(parse_k_list(Some(4), None).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn explicit_list_keeps_order() {
        assert_eq!(
            parse_k_list(None, Some("3,2,5")).unwrap(),
            vec![3, 2, 5]
        );
    }

    #[test]
    fn invalid_k_lists_are_rejected() {
        assert!(parse_k_list(None, None).is_err());
        assert!(parse_k_list(Some(3), Some("1,2")).is_err());
        assert!(parse_k_list(Some(0), None).is_err());
        assert!(parse_k_list(None, Some("1,0")).is_err());
        assert!(parse_k_list(None, Some("2,2")).is_err());
        assert!(parse_k_list(None, Some("")).is_err());
        assert!(parse_k_list(None, Some("1,x")).is_err());
    }
}
