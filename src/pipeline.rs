use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::compliance::{evaluate, Rule, Verdict};
use crate::extract::Extractor;
use crate::normalize::{self, normalize, NormalizeSpec};
use crate::report::{Reporter, Severity};
use crate::template::Template;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentStatus {
    Succeeded { hostname: String, records: usize },
    Skipped { reason: String },
}

#[derive(Debug, Clone)]
pub struct DocumentOutcome {
    pub source: String,
    pub status: DocumentStatus,
    pub verdicts: Vec<Verdict>,
}

impl DocumentOutcome {
    pub fn skipped(source: &str, reason: String) -> Self {
        DocumentOutcome {
            source: source.to_string(),
            status: DocumentStatus::Skipped { reason },
            verdicts: Vec::new(),
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        match &self.status {
            DocumentStatus::Succeeded { hostname, .. } => Some(hostname),
            DocumentStatus::Skipped { .. } => None,
        }
    }

    pub fn non_compliant(&self) -> usize {
        self.verdicts.iter().filter(|v| !v.compliant).count()
    }
}

/// Sorted files in `dir` with the given extension.
pub fn discover(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read config directory {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == extension))
        .collect();
    paths.sort();
    Ok(paths)
}

pub fn new_run_id() -> String {
    format!("run-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"))
}

pub struct Pipeline<'a> {
    extractor: Extractor<'a>,
    spec: NormalizeSpec,
    rule: &'a Rule,
}

impl<'a> Pipeline<'a> {
    pub fn new(template: &'a Template, max_depth: usize, spec: NormalizeSpec, rule: &'a Rule) -> Self {
        Pipeline {
            extractor: Extractor::new(template, max_depth),
            spec,
            rule,
        }
    }

    pub fn process(&self, source: &str, input: &[u8], reporter: &dyn Reporter) -> DocumentOutcome {
        let result = match self.extractor.extract(input) {
            Ok(r) => r,
            Err(e) => {
                reporter.record(Severity::Error, &format!("Skipping {}: {}", source, e));
                return DocumentOutcome::skipped(source, e.to_string());
            }
        };

        let records = normalize(&result, source, &self.spec);
        let hostname = normalize::hostname(&result, &self.spec);
        if hostname == normalize::UNKNOWN_HOST {
            reporter.record(Severity::Warning, &format!("{}: no hostname found", source));
        }
        let verdicts = evaluate(self.rule, &records, reporter);

        DocumentOutcome {
            source: source.to_string(),
            status: DocumentStatus::Succeeded {
                hostname,
                records: records.len(),
            },
            verdicts,
        }
    }

    /// Process files on a bounded pool; outcomes come back in `paths` order.
    pub fn process_paths(
        &self,
        paths: &[PathBuf],
        workers: usize,
        reporter: &dyn Reporter,
    ) -> Result<Vec<DocumentOutcome>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()
            .context("Failed to build worker pool")?;

        let pb = ProgressBar::new(paths.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")?
                .progress_chars("#>-"),
        );

        let outcomes = pool.install(|| {
            paths
                .par_iter()
                .map(|path| {
                    let source = path.display().to_string();
                    let outcome = match std::fs::read(path) {
                        Ok(bytes) => self.process(&source, &bytes, reporter),
                        Err(e) => {
                            reporter.record(Severity::Error, &format!("Skipping {}: {}", source, e));
                            DocumentOutcome::skipped(&source, format!("read failed: {}", e))
                        }
                    };
                    pb.inc(1);
                    outcome
                })
                .collect()
        });

        pb.finish_and_clear();
        Ok(outcomes)
    }
}

// ── Summary ──

pub fn summary_lines(outcomes: &[DocumentOutcome]) -> Vec<String> {
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o.status, DocumentStatus::Skipped { .. }))
        .count();

    let mut lines = vec![format!(
        "Documents: {} processed, {} succeeded, {} skipped",
        outcomes.len(),
        outcomes.len() - skipped,
        skipped
    )];
    for o in outcomes {
        match &o.status {
            DocumentStatus::Succeeded { hostname, records } => lines.push(format!(
                "  ok    {}  host={} records={} verdicts={} non-compliant={}",
                o.source,
                hostname,
                records,
                o.verdicts.len(),
                o.non_compliant()
            )),
            DocumentStatus::Skipped { reason } => {
                lines.push(format!("  skip  {}  {}", o.source, reason))
            }
        }
    }

    let failed: Vec<&Verdict> = outcomes
        .iter()
        .flat_map(|o| o.verdicts.iter())
        .filter(|v| !v.compliant)
        .collect();

    lines.push(String::new());
    lines.push("--- Compliance ---".to_string());
    if failed.is_empty() {
        lines.push("All access ports are compliant!".to_string());
    } else {
        lines.push(format!("Total non-compliant interfaces: {}", failed.len()));
        for v in failed {
            lines.push(format!("  {} - {}: {}", v.hostname, v.interface, v.issue));
        }
    }
    lines
}

pub fn print_summary(outcomes: &[DocumentOutcome]) {
    for line in summary_lines(outcomes) {
        println!("{}", line);
    }
}

// ── Tests ──
