//! Report files
//!
//! A report is a JSON array of matches written by `scache search --output`.
//! Hand-written reports that list findings directly (rendered snippet as a
//! string) are accepted too.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::{Finding, Match};

#[derive(Deserialize)]
#[serde(untagged)]
enum ReportEntry {
    Match(Match),
    Finding(Finding),
}

impl From<ReportEntry> for Finding {
    fn from(entry: ReportEntry) -> Self {
        match entry {
            ReportEntry::Match(m) => Finding::from(&m),
            ReportEntry::Finding(f) => f,
        }
    }
}

pub fn write_report(path: &Path, matches: &[Match]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(matches).context("Failed to serialize report")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write report {}", path.display()))?;
    log::info!("Wrote {} match(es) to {}", matches.len(), path.display());
    Ok(())
}

pub fn load_report(path: &Path) -> Result<Vec<Finding>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read report {}", path.display()))?;
    let entries: Vec<ReportEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("Malformed report {}", path.display()))?;
    Ok(entries.into_iter().map(Finding::from).collect())
}

/// Finding `index` (0-based) from a report, with its file path made absolute
pub fn finding_at(report: &Path, index: usize) -> Result<Finding> {
    let findings = load_report(report)?;
    let total = findings.len();
    let mut finding = findings.into_iter().nth(index).with_context(|| {
        format!(
            "Finding index {} is out of range: {} contains {} finding(s)",
            index,
            report.display(),
            total
        )
    })?;

    let report_dir = report.parent().map(Path::to_path_buf).unwrap_or_default();
    finding.file_path = resolve_source(&report_dir, Path::new(&finding.file_path))
        .to_string_lossy()
        .into_owned();
    Ok(finding)
}

/// Relative paths try the report's directory, then the working directory
fn resolve_source(report_dir: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        return file.to_path_buf();
    }

    let beside_report = report_dir.join(file);
    if beside_report.exists() {
        return absolute(&beside_report);
    }
    absolute(file)
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
