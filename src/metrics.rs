use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::error::ConductorError;
use crate::fs_util;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisMetrics {
    pub total_reads: Option<u64>,
    pub autosomal_coverage: Option<f64>,
    pub percent_duplication: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualimapMetrics {
    pub total_reads: u64,
    pub autosomal_coverage: f64,
}

/// Reads `genome_results.txt` as written by QualiMap bamqc.
pub fn parse_qualimap(content: &str) -> Result<QualimapMetrics, ConductorError> {
    let mut total_reads = None;
    let mut in_contigs = false;
    let mut autosome_length = 0u64;
    let mut autosome_bases = 0u64;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with(">>>>>>>") {
            in_contigs = trimmed.contains("Coverage per contig");
            continue;
        }
        if let Some(value) = trimmed.strip_prefix("number of reads =") {
            total_reads = Some(parse_count(value)?);
            continue;
        }
        if !in_contigs || trimmed.is_empty() {
            continue;
        }
        let columns: Vec<&str> = trimmed.split_whitespace().collect();
        if columns.len() < 3 || !is_autosome(columns[0]) {
            continue;
        }
        autosome_length += parse_count(columns[1])?;
        autosome_bases += parse_count(columns[2])?;
    }

    let total_reads = total_reads
        .ok_or_else(|| ConductorError::MetricParse("qualimap: no read count".to_string()))?;
    if autosome_length == 0 {
        return Err(ConductorError::MetricParse(
            "qualimap: no autosomal contigs".to_string(),
        ));
    }
    Ok(QualimapMetrics {
        total_reads,
        autosomal_coverage: autosome_bases as f64 / autosome_length as f64,
    })
}

/// Percent duplication over every library of a Picard MarkDuplicates report.
pub fn parse_markduplicates(content: &str) -> Result<f64, ConductorError> {
    let mut lines = content
        .lines()
        .skip_while(|line| !line.starts_with("## METRICS CLASS"))
        .skip(1);
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| ConductorError::MetricParse("markduplicates: no metrics header".to_string()))?
        .split('\t')
        .collect();
    let column = |name: &str| {
        header
            .iter()
            .position(|col| *col == name)
            .ok_or_else(|| ConductorError::MetricParse(format!("markduplicates: no {name} column")))
    };
    let unpaired = column("UNPAIRED_READS_EXAMINED")?;
    let pairs = column("READ_PAIRS_EXAMINED")?;
    let unpaired_dups = column("UNPAIRED_READ_DUPLICATES")?;
    let pair_dups = column("READ_PAIR_DUPLICATES")?;

    let mut examined = 0f64;
    let mut duplicates = 0f64;
    for line in lines.take_while(|line| !line.trim().is_empty()) {
        let values: Vec<&str> = line.split('\t').collect();
        let value = |index: usize| -> Result<f64, ConductorError> {
            values
                .get(index)
                .and_then(|raw| raw.trim().parse::<f64>().ok())
                .ok_or_else(|| ConductorError::MetricParse(format!("markduplicates: bad row {line:?}")))
        };
        examined += value(unpaired)? + 2.0 * value(pairs)?;
        duplicates += value(unpaired_dups)? + 2.0 * value(pair_dups)?;
    }
    if examined == 0.0 {
        return Err(ConductorError::MetricParse(
            "markduplicates: no reads examined".to_string(),
        ));
    }
    Ok(100.0 * duplicates / examined)
}

/// QualiMap and MarkDuplicates reports anywhere below `results_dir`.
pub fn collect_alignment_metrics(results_dir: &Utf8Path) -> Result<AnalysisMetrics, ConductorError> {
    let files = fs_util::walk_files(results_dir)
        .map_err(|err| ConductorError::MetricParse(err.to_string()))?;
    let qualimap_path = find_report(
        &files,
        |path| path.ends_with("/genome_results.txt"),
        "genome_results.txt",
    )?;
    let markdup_path = find_report(
        &files,
        |path| path.ends_with(".metrics") && path.contains("dup"),
        "MarkDuplicates metrics",
    )?;

    let qualimap = parse_qualimap(&read_report(&qualimap_path)?)?;
    let duplication = parse_markduplicates(&read_report(&markdup_path)?)?;
    Ok(AnalysisMetrics {
        total_reads: Some(qualimap.total_reads),
        autosomal_coverage: Some(qualimap.autosomal_coverage),
        percent_duplication: Some(duplication),
    })
}

fn find_report(
    files: &[Utf8PathBuf],
    matches: impl Fn(&str) -> bool,
    what: &str,
) -> Result<Utf8PathBuf, ConductorError> {
    files
        .iter()
        .find(|path| matches(&path.as_str().to_lowercase()))
        .cloned()
        .ok_or_else(|| ConductorError::MetricParse(format!("no {what} report found")))
}

fn read_report(path: &Utf8Path) -> Result<String, ConductorError> {
    fs::read_to_string(path.as_std_path())
        .map_err(|err| ConductorError::MetricParse(format!("read {path}: {err}")))
}

fn parse_count(raw: &str) -> Result<u64, ConductorError> {
    let cleaned: String = raw
        .trim()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|ch| *ch != ',')
        .collect();
    cleaned
        .parse::<u64>()
        .map_err(|_| ConductorError::MetricParse(format!("not a count: {raw:?}")))
}

fn is_autosome(contig: &str) -> bool {
    let name = contig.strip_prefix("chr").unwrap_or(contig);
    matches!(name.parse::<u8>(), Ok(1..=22))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENOME_RESULTS: &str = "\
>>>>>>> Globals

     number of windows = 400
     number of reads = 1,000,000

>>>>>>> Coverage per contig

\tchr1\t1000\t30000\t30.0\t2.1
\tchr2\t1000\t10000\t10.0\t1.0
\tchrX\t1000\t99999\t99.9\t9.9
\tchrUn_KI270302v1\t500\t99\t0.2\t0.1
";

    const MARKDUP: &str = "\
## htsjdk.samtools.metrics.StringHeader
# MarkDuplicates INPUT=[x.bam]

## METRICS CLASS\tpicard.sam.DuplicationMetrics
LIBRARY\tUNPAIRED_READS_EXAMINED\tREAD_PAIRS_EXAMINED\tSECONDARY_OR_SUPPLEMENTARY_RDS\tUNMAPPED_READS\tUNPAIRED_READ_DUPLICATES\tREAD_PAIR_DUPLICATES\tREAD_PAIR_OPTICAL_DUPLICATES\tPERCENT_DUPLICATION\tESTIMATED_LIBRARY_SIZE
A\t100\t450\t0\t0\t10\t45\t0\t0.1\t1000

## HISTOGRAM\tjava.lang.Double
BIN\tVALUE
";

    #[test]
    fn qualimap_uses_autosomes_only() {
        let metrics = parse_qualimap(GENOME_RESULTS).unwrap();
        assert_eq!(metrics.total_reads, 1_000_000);
        assert!((metrics.autosomal_coverage - 20.0).abs() < 1e-9);
    }

    #[test]
    fn qualimap_without_contigs_is_an_error() {
        let err = parse_qualimap("     number of reads = 10\n").unwrap_err();
        assert!(matches!(err, ConductorError::MetricParse(_)));
    }

    #[test]
    fn markduplicates_weights_pairs() {
        let pct = parse_markduplicates(MARKDUP).unwrap();
        assert!((pct - 10.0).abs() < 1e-9);
        assert!(parse_markduplicates("garbage").is_err());
    }
}
