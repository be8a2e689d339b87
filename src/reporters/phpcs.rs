use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::{PlacedViolation, Report, Reporter, ReporterError};
use crate::ci::BuildInfo;
use crate::config::PhpCsConfig;
use crate::pr::{diff, PullRecord, Violation};

/// Inline review comments from a PHP_CodeSniffer CSV report.
pub struct PhpCsReporter {
    artifact: String,
}

/// One row of `phpcs --report=csv`. Extra columns are ignored.
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "File")]
    file: String,
    #[serde(rename = "Line")]
    line: u64,
    #[serde(rename = "Message")]
    message: String,
}

impl PhpCsReporter {
    pub fn new(config: &PhpCsConfig) -> Self {
        Self {
            artifact: config.artifact.clone(),
        }
    }
}

/// Parse the CSV body. Rows that do not fit the expected columns are
/// skipped with a warning.
pub fn parse_violations(body: &str) -> Vec<Violation> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let mut violations = Vec::new();
    for row in reader.deserialize::<CsvRow>() {
        match row {
            Ok(row) => violations.push(Violation {
                file: row.file,
                line: row.line,
                message: row.message,
            }),
            Err(err) => warn!(error = %err, "skipping malformed phpcs row"),
        }
    }
    violations
}

/// Place violations on added or modified files. Lines already reported,
/// lines outside the diff, and repeated lines are dropped. Report paths are
/// absolute on the build host, so a violation belongs to a file when its
/// path contains the file's name.
pub fn place_violations(record: &PullRecord, violations: &[Violation]) -> Vec<PlacedViolation> {
    let mut placed = Vec::new();
    let mut seen = HashSet::new();
    let files = record
        .files
        .iter()
        .filter(|file| file.status == "added" || file.status == "modified");

    for file in files {
        for violation in violations.iter().filter(|v| v.file.contains(&file.filename)) {
            if file.reported.contains(&violation.line) {
                continue;
            }
            let Some(position) = diff::translate(&file.ranges, violation.line) else {
                continue;
            };
            if !seen.insert((file.filename.as_str(), violation.line)) {
                continue;
            }
            placed.push(PlacedViolation {
                file: file.filename.clone(),
                sha: file.sha.clone(),
                line: violation.line,
                position,
                message: violation.message.clone(),
            });
        }
    }
    placed
}

#[async_trait]
impl Reporter for PhpCsReporter {
    fn name(&self) -> &str {
        "phpcs"
    }

    fn artifact_path(&self) -> &str {
        &self.artifact
    }

    async fn report(
        &self,
        _build: &BuildInfo,
        record: &PullRecord,
        artifact: &str,
    ) -> Result<Report, ReporterError> {
        let violations = parse_violations(artifact);
        let inline = place_violations(record, &violations);
        debug!(
            violations = violations.len(),
            placed = inline.len(),
            "phpcs report read"
        );
        Ok(Report {
            inline,
            summary: None,
        })
    }
}
