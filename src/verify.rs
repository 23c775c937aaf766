use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::crossref::MetadataSource;
use crate::fuzzy;
use crate::store::Store;

/// How far a reference's fields may drift from the registry record
/// before we flag a mismatch.
const TITLE_MATCH_FLOOR: f64 = 0.70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyStatus {
    Ok,
    /// Title or year disagrees with the registry record.
    Mismatch,
    Retracted,
    /// The registry no longer knows the DOI.
    NotFound,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyIssue {
    pub cite_key: String,
    pub doi: String,
    pub status: VerifyStatus,
    pub details: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct VerifySummary {
    pub ok: usize,
    pub mismatch: usize,
    pub retracted: usize,
    pub not_found: usize,
    pub errors: usize,
}

/// Check every DOI-bearing reference against the registry. Verification
/// only flags: a retraction sets the record's `retracted` marker, and
/// everything else lands in the issue report. Stored fields are never
/// silently altered.
pub fn verify_all(
    store: &mut Store,
    source: &dyn MetadataSource,
    limit: usize,
    quiet: bool,
) -> (VerifySummary, Vec<VerifyIssue>) {
    let mut targets: Vec<(String, String, String, Option<i32>)> = store
        .references()
        .iter()
        .filter_map(|r| {
            r.doi
                .as_ref()
                .map(|d| (r.cite_key.clone(), d.clone(), r.title.clone(), r.year))
        })
        .collect();
    targets.sort();
    if limit > 0 {
        targets.truncate(limit);
    }

    let total = targets.len();
    let mut summary = VerifySummary::default();
    let mut issues = Vec::new();

    for (i, (cite_key, doi, title, year)) in targets.into_iter().enumerate() {
        if !quiet && (i + 1) % 25 == 0 {
            eprint!("\rVerifying DOIs: {}/{total}", i + 1);
        }
        let (status, details) = match source.fetch_work(&doi) {
            Err(e) => (VerifyStatus::Error, e.to_string()),
            Ok(None) => (VerifyStatus::NotFound, format!("DOI {doi} not in registry")),
            Ok(Some(work)) => {
                if work.retracted {
                    store.mark_retracted(&cite_key);
                    (VerifyStatus::Retracted, "RETRACTED".to_string())
                } else {
                    classify_drift(&title, year, &work.title, work.year)
                }
            }
        };
        match status {
            VerifyStatus::Ok => summary.ok += 1,
            VerifyStatus::Mismatch => summary.mismatch += 1,
            VerifyStatus::Retracted => summary.retracted += 1,
            VerifyStatus::NotFound => summary.not_found += 1,
            VerifyStatus::Error => summary.errors += 1,
        }
        if status != VerifyStatus::Ok {
            issues.push(VerifyIssue { cite_key, doi, status, details });
        }
    }
    if !quiet && total >= 25 {
        eprintln!();
    }
    (summary, issues)
}

fn classify_drift(
    title: &str,
    year: Option<i32>,
    registry_title: &str,
    registry_year: Option<i32>,
) -> (VerifyStatus, String) {
    let mut problems = Vec::new();
    if !title.is_empty() && !registry_title.is_empty() {
        let sim = fuzzy::title_similarity(title, registry_title);
        if sim < TITLE_MATCH_FLOOR {
            problems.push(format!(
                "title mismatch (similarity={sim:.2}): ours='{}' vs registry='{}'",
                truncate(title, 60),
                truncate(registry_title, 60)
            ));
        }
    }
    if let (Some(ours), Some(theirs)) = (year, registry_year)
        && ours != theirs
    {
        problems.push(format!("year mismatch: ours={ours} vs registry={theirs}"));
    }
    if problems.is_empty() {
        (VerifyStatus::Ok, "verified".to_string())
    } else {
        (VerifyStatus::Mismatch, problems.join("; "))
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[derive(Serialize)]
struct VerifyReport<'a> {
    summary: &'a VerifySummary,
    issues: &'a [VerifyIssue],
}

pub fn write_report(
    summary: &VerifySummary,
    issues: &[VerifyIssue],
    path: &Path,
) -> Result<()> {
    let json = serde_json::to_string_pretty(&VerifyReport { summary, issues })?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
