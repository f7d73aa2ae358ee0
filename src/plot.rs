use clap::Args;
use plotters::prelude::*;
use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Cluster palette from ColorBrewer Paired-12; wraps around past 12 clusters.
const CLUSTER_COLORS: [RGBColor; 12] = [
    RGBColor(166, 206, 227),
    RGBColor(31, 120, 180),
    RGBColor(178, 223, 138),
    RGBColor(51, 160, 44),
    RGBColor(251, 154, 153),
    RGBColor(227, 26, 28),
    RGBColor(253, 191, 111),
    RGBColor(255, 127, 0),
    RGBColor(202, 178, 214),
    RGBColor(106, 61, 154),
    RGBColor(255, 255, 153),
    RGBColor(177, 89, 40),
];

#[derive(Args, Debug)]
pub struct PlotArgs {
    /// Ancestry output files to plot (comma-separated)
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Input format (structure or faststructure)
    #[arg(short = 'f', long = "format", default_value = "structure")]
    pub format: String,
    /// Output directory
    #[arg(short = 'o', long = "output")]
    pub output: String,
    /// Population list file with name and sample count columns (optional)
    #[arg(long = "popfile")]
    pub popfile: Option<String>,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AncestryFormat {
    Structure,
    FastStructure,
}

impl std::str::FromStr for AncestryFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "structure" => Ok(AncestryFormat::Structure),
            "faststructure" => Ok(AncestryFormat::FastStructure),
            _ => Err(format!("Unknown ancestry format: {}", s)),
        }
    }
}

/// Population boundary: cumulative x position plus an optional label.
pub type PopBoundary = (usize, Option<String>);

/// Parse a structure/fastStructure ancestry output into a Q-matrix (one row
/// per individual, one column per cluster) and a population-boundary list.
///
/// Any replacement parser must keep this (matrix, boundary-list) pair: the
/// renderer depends on it.
pub fn parse_ancestry(
    path: &Path,
    format: AncestryFormat,
    popfile: Option<&Path>,
) -> Result<(Vec<Vec<f64>>, Vec<PopBoundary>), Box<dyn Error>> {
    let (qvalues, inferred_poplist) = match format {
        // fastStructure output carries no population column.
        AncestryFormat::FastStructure => (parse_faststructure_matrix(path)?, Vec::new()),
        AncestryFormat::Structure => {
            let (qvalues, pop_ids) = parse_structure_block(path)?;
            let poplist = boundaries_from_pop_ids(&pop_ids);
            (qvalues, poplist)
        }
    };

    let poplist = if let Some(popfile) = popfile {
        parse_popfile(popfile)?
    } else {
        inferred_poplist
    };

    if qvalues.is_empty() {
        return Err(format!(
            "Error: no individuals parsed from ancestry file: {}",
            path.display()
        )
        .into());
    }

    Ok((qvalues, poplist))
}

/// fastStructure meanQ files are a plain whitespace-delimited float matrix.
fn parse_faststructure_matrix(path: &Path) -> Result<Vec<Vec<f64>>, Box<dyn Error>> {
    let reader = BufReader::new(File::open(path)?);
    let mut qvalues: Vec<Vec<f64>> = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let row = trimmed
            .split_whitespace()
            .map(|v| v.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|e| format!("Error: bad ancestry value in {}: {}", path.display(), e))?;
        if let Some(first) = qvalues.first() {
            if first.len() != row.len() {
                return Err(format!(
                    "Error: ragged ancestry matrix in {} ({} vs {} clusters)",
                    path.display(),
                    first.len(),
                    row.len()
                )
                .into());
            }
        }
        qvalues.push(row);
    }
    Ok(qvalues)
}

/// Extract the "Inferred ancestry of individuals" block of a structure
/// output file. Returns the Q-matrix plus the per-individual population ids
/// (field 3 of each row).
fn parse_structure_block(path: &Path) -> Result<(Vec<Vec<f64>>, Vec<String>), Box<dyn Error>> {
    let reader = BufReader::new(File::open(path)?);
    let mut qvalues: Vec<Vec<f64>> = Vec::new();
    let mut pop_ids: Vec<String> = Vec::new();
    let mut parse = false;
    let mut skip_subheader = false;

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        let lowered = trimmed.to_lowercase();
        if lowered.starts_with("inferred ancestry of individuals:") {
            parse = true;
            skip_subheader = true;
            continue;
        }
        if lowered.starts_with("estimated allele frequencies in each cluster") {
            parse = false;
            continue;
        }
        if !parse {
            continue;
        }
        if skip_subheader {
            skip_subheader = false;
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }

        // Row layout: index, label, (%miss), pop, ':', then the proportions.
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() <= 5 {
            continue;
        }
        let row = fields[5..]
            .iter()
            .map(|v| v.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|e| format!("Error: bad ancestry value in {}: {}", path.display(), e))?;
        if let Some(first) = qvalues.first() {
            if first.len() != row.len() {
                return Err(format!(
                    "Error: ragged ancestry matrix in {} ({} vs {} clusters)",
                    path.display(),
                    first.len(),
                    row.len()
                )
                .into());
            }
        }
        qvalues.push(row);
        pop_ids.push(fields[3].to_string());
    }

    Ok((qvalues, pop_ids))
}

/// Cumulative unlabeled boundaries from per-individual population ids, in
/// first-seen order.
fn boundaries_from_pop_ids(pop_ids: &[String]) -> Vec<PopBoundary> {
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for id in pop_ids {
        if !counts.contains_key(id) {
            order.push(id.clone());
        }
        *counts.entry(id.clone()).or_insert(0) += 1;
    }

    let mut boundaries = Vec::with_capacity(order.len());
    let mut cumulative = 0;
    for id in order {
        cumulative += counts[&id];
        boundaries.push((cumulative, None));
    }
    boundaries
}

/// Popfile: two whitespace-separated columns, population name and sample
/// count, in sample order.
fn parse_popfile(path: &Path) -> Result<Vec<PopBoundary>, Box<dyn Error>> {
    let reader = BufReader::new(File::open(path)?);
    let mut boundaries = Vec::new();
    let mut cumulative = 0;
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut tokens = trimmed.split_whitespace();
        let name = tokens
            .next()
            .ok_or_else(|| format!("Error: malformed popfile line: '{}'", trimmed))?;
        let count: usize = tokens
            .next()
            .ok_or_else(|| format!("Error: malformed popfile line: '{}'", trimmed))?
            .parse()
            .map_err(|e| format!("Error: bad sample count in popfile: {}", e))?;
        cumulative += count;
        boundaries.push((cumulative, Some(name.to_string())));
    }
    Ok(boundaries)
}

/// Render the ancestry Q-matrix as a stacked bar chart: one full-width bar
/// per individual, clusters stacked bottom-up, population boundaries drawn
/// as vertical lines with a label under each block.
pub fn plot_ancestry(
    qvalues: &[Vec<f64>],
    poplist: &[PopBoundary],
    outfile: &Path,
) -> Result<(), Box<dyn Error>> {
    let numinds = qvalues.len();
    if numinds == 0 {
        return Err("Error: cannot plot an empty ancestry matrix".into());
    }

    // Chart width follows the sample count, within reason.
    let width = ((numinds as u32) * 8).clamp(640, 4000);
    let root = BitMapBackend::new(outfile, (width, 330)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(0f64..numinds as f64, -0.18f64..1f64)?;

    for (x, proportions) in qvalues.iter().enumerate() {
        let mut bottom = 0.0;
        for (cluster, &q) in proportions.iter().enumerate() {
            let color = CLUSTER_COLORS[cluster % CLUSTER_COLORS.len()];
            chart.draw_series(std::iter::once(Rectangle::new(
                [(x as f64, bottom), (x as f64 + 1.0, bottom + q)],
                color.filled(),
            )))?;
            bottom += q;
        }
    }

    let mut previous = 0usize;
    for (index, (position, label)) in poplist.iter().enumerate() {
        chart.draw_series(std::iter::once(PathElement::new(
            vec![(*position as f64, 0.0), (*position as f64, 1.0)],
            BLACK.stroke_width(2),
        )))?;

        let midpoint = previous as f64 + (*position - previous) as f64 / 2.0;
        let text = label
            .clone()
            .unwrap_or_else(|| format!("Pop{}", index + 1));
        chart.draw_series(std::iter::once(Text::new(
            text,
            (midpoint, -0.05),
            ("sans-serif", 16),
        )))?;
        previous = *position;
    }

    root.present()?;
    Ok(())
}

/// Entry point of the plot subcommand: one chart per input file.
pub fn plot_ancestry_charts(
    args: &PlotArgs,
    logger: &mut crate::Logger,
) -> Result<(), Box<dyn Error>> {
    let format: AncestryFormat = args.format.parse()?;
    std::fs::create_dir_all(&args.output)?;

    for file in args.input.split(',') {
        let file = file.trim();
        if file.is_empty() {
            continue;
        }
        let path = Path::new(file);
        let (qvalues, poplist) =
            parse_ancestry(path, format, args.popfile.as_deref().map(Path::new))?;

        let stem = path
            .file_stem()
            .ok_or_else(|| format!("Error: cannot derive an output name from: {}", file))?;
        let outfile = Path::new(&args.output).join(format!("{}.png", stem.to_string_lossy()));
        plot_ancestry(&qvalues, &poplist, &outfile)?;

        logger.log(&format!(
            "Plotted {} individuals x {} clusters: {}",
            qvalues.len(),
            qvalues[0].len(),
            outfile.display()
        ))?;
        println!("    Ancestry plot: {}", outfile.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    const STRUCTURE_OUTPUT: &str = "\
Run parameters:
   3 individuals

Inferred ancestry of individuals:
        Label (%Miss) Pop:  Inferred clusters
  1 ind1    (0)    1 :  0.90 0.10
  2 ind2    (0)    1 :  0.80 0.20
  3 ind3    (0)    2 :  0.10 0.90

Estimated allele frequencies in each cluster
  whatever 0.5
";

    #[test]
    fn structure_block_is_extracted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(tmp.path(), "out_K2_f", STRUCTURE_OUTPUT);

        let (qvalues, poplist) =
            parse_ancestry(&path, AncestryFormat::Structure, None).unwrap();
        assert_eq!(qvalues.len(), 3);
        assert_eq!(qvalues[0], vec![0.90, 0.10]);
        assert_eq!(qvalues[2], vec![0.10, 0.90]);
        // Two individuals in pop 1, one in pop 2 -> unlabeled boundaries.
        assert_eq!(poplist, vec![(2, None), (3, None)]);
    }

    #[test]
    fn faststructure_matrix_is_parsed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(tmp.path(), "run.3.meanQ", "0.9 0.05 0.05\n0.2 0.3 0.5\n");

        let (qvalues, poplist) =
            parse_ancestry(&path, AncestryFormat::FastStructure, None).unwrap();
        assert_eq!(qvalues.len(), 2);
        assert_eq!(qvalues[1], vec![0.2, 0.3, 0.5]);
        assert!(poplist.is_empty());
    }

    #[test]
    fn popfile_overrides_inferred_boundaries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(tmp.path(), "out_K2_f", STRUCTURE_OUTPUT);
        let popfile = write_file(tmp.path(), "popfile.txt", "Angola\t2\nKenya\t1\n");

        let (_, poplist) =
            parse_ancestry(&path, AncestryFormat::Structure, Some(&popfile)).unwrap();
        assert_eq!(
            poplist,
            vec![(2, Some("Angola".to_string())), (3, Some("Kenya".to_string()))]
        );
    }

    #[test]
    fn ragged_matrix_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(tmp.path(), "run.2.meanQ", "0.9 0.1\n0.2 0.3 0.5\n");
        assert!(parse_ancestry(&path, AncestryFormat::FastStructure, None).is_err());
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!("admixture".parse::<AncestryFormat>().is_err());
        assert_eq!(
            "fastStructure".parse::<AncestryFormat>().unwrap(),
            AncestryFormat::FastStructure
        );
    }
}
