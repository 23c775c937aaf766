use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use crate::config::Config;
use crate::crossref::{CitedRecord, MetadataSource};
use crate::fuzzy;
use crate::store::Store;
use crate::types::{HarvestEntry, HarvestLog, HarvestStatus, Reference};

impl HarvestLog {
    /// Load the log, treating a missing file as an empty log. A present
    /// but unparsable file is fatal: overwriting a hand-edited log
    /// would silently lose operator state.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(HarvestLog::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read harvest log: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Harvest log is not valid JSON: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn contains(&self, doi: &str) -> bool {
        self.entries.contains_key(doi)
    }

    /// Record a terminal status for a DOI. Entries are final, including
    /// fetch-error; operators delete rows by hand to force a retry.
    pub fn record(&mut self, doi: &str, status: HarvestStatus) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.entries
            .insert(doi.to_string(), HarvestEntry { status, timestamp });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Counters for one expansion batch (or totals across batches).
#[derive(Debug, Default, Clone)]
pub struct BatchSummary {
    /// Candidates taken in this batch; zero means no pending work.
    pub candidates: usize,
    pub expanded: usize,
    pub no_refs: usize,
    pub fetch_errors: usize,
    /// Citations returned by the registry before dedup.
    pub raw_refs: usize,
    pub new_refs: usize,
    pub merged: usize,
}

impl BatchSummary {
    pub fn absorb(&mut self, other: &BatchSummary) {
        self.candidates += other.candidates;
        self.expanded += other.expanded;
        self.no_refs += other.no_refs;
        self.fetch_errors += other.fetch_errors;
        self.raw_refs += other.raw_refs;
        self.new_refs += other.new_refs;
        self.merged += other.merged;
    }
}

/// Walks the reference graph one hop outward: for each depth-N record
/// with a DOI and no harvest-log entry, fetches its reference list and
/// folds every citation into the store at depth N+1. Work is bounded
/// per batch and fully resumable: the pending set is re-derived from
/// committed state, and merging is idempotent under retry.
pub struct Engine<'a> {
    source: &'a dyn MetadataSource,
    cfg: &'a Config,
}

impl<'a> Engine<'a> {
    pub fn new(source: &'a dyn MetadataSource, cfg: &'a Config) -> Self {
        Engine { source, cfg }
    }

    /// (cite_key, doi) pairs still awaiting expansion, in cite-key
    /// order so batching is deterministic.
    pub fn pending(&self, store: &Store, log: &HarvestLog) -> Vec<(String, String)> {
        store
            .find_by_depth(self.cfg.source_depth)
            .into_iter()
            .filter_map(|r| r.doi.as_ref().map(|d| (r.cite_key.clone(), d.clone())))
            .filter(|(_, doi)| !log.contains(doi))
            .collect()
    }

    /// Process one batch of at most `batch_size` candidates. Mutates
    /// the store and log in memory only; the caller persists both
    /// together once the batch completes, so a crash mid-batch loses at
    /// most this batch and never corrupts prior state.
    pub fn run_batch(&self, store: &mut Store, log: &mut HarvestLog) -> BatchSummary {
        let mut pending = self.pending(store, log);
        pending.truncate(self.cfg.batch_size);

        let mut summary = BatchSummary { candidates: pending.len(), ..Default::default() };
        let total = pending.len();

        for (i, (cite_key, doi)) in pending.into_iter().enumerate() {
            if (i + 1) % 10 == 0 {
                eprint!(
                    "\rExpanding: {}/{total} (new refs: {}, errors: {})",
                    i + 1,
                    summary.new_refs,
                    summary.fetch_errors
                );
            }
            match self.source.fetch_work(&doi) {
                Ok(Some(work)) if !work.references.is_empty() => {
                    summary.raw_refs += work.references.len();
                    for cited in work.references {
                        let candidate =
                            reference_from_cited(cited, &cite_key, self.cfg.source_depth + 1);
                        let (_, created) = store.add_or_merge(candidate);
                        if created {
                            summary.new_refs += 1;
                        } else {
                            summary.merged += 1;
                        }
                    }
                    log.record(&doi, HarvestStatus::Success);
                    summary.expanded += 1;
                }
                // A 404 means the registry has no reference list to
                // give for this DOI; terminal, but not an error.
                Ok(Some(_)) | Ok(None) => {
                    log.record(&doi, HarvestStatus::NoReferencesFound);
                    summary.no_refs += 1;
                }
                // Transport failure: log it and keep going; one bad
                // candidate never aborts the batch.
                Err(_) => {
                    log.record(&doi, HarvestStatus::FetchError);
                    summary.fetch_errors += 1;
                }
            }
        }
        if total >= 10 {
            eprintln!();
        }
        summary
    }

    /// Repeatedly run batches until the pending set is empty, committing
    /// the store and log after each completed batch.
    pub fn run_until_exhausted(
        &self,
        store: &mut Store,
        log: &mut HarvestLog,
        bib_path: &Path,
        log_path: &Path,
    ) -> Result<BatchSummary> {
        let mut totals = BatchSummary::default();
        loop {
            let summary = self.run_batch(store, log);
            if summary.candidates == 0 {
                break;
            }
            store.save(bib_path)?;
            log.save(log_path)?;
            totals.absorb(&summary);
        }
        Ok(totals)
    }
}

/// Build a depth-(N+1) store candidate from a harvested citation.
fn reference_from_cited(cited: CitedRecord, source_key: &str, depth: u32) -> Reference {
    let mut r = Reference::new(make_cite_key(&cited, depth), depth);
    r.title = if cited.title.is_empty() {
        cited.unstructured.chars().take(200).collect()
    } else {
        cited.title
    };
    if !cited.author.is_empty() {
        r.authors = vec![cited.author];
    }
    r.year = cited.year;
    r.journal = cited.journal;
    r.doi = cited.doi;
    r.raw_text = cited.unstructured;
    r.source_keys.insert(source_key.to_string());
    r
}

/// `d{depth}_{surname}{year}`, with fallbacks mirroring how noisy
/// registry reference entries degrade: structured author, then the
/// first capitalized word of the unstructured text, then "unknown".
fn make_cite_key(cited: &CitedRecord, depth: u32) -> String {
    let surname = fuzzy::surname(&cited.author)
        .or_else(|| unstructured_surname(&cited.unstructured))
        .unwrap_or_else(|| "unknown".to_string());
    match cited.year {
        Some(year) => format!("d{depth}_{surname}{year}"),
        None => format!("d{depth}_{surname}"),
    }
}

fn unstructured_surname(text: &str) -> Option<String> {
    for word in text.split_whitespace() {
        let clean: String = word.chars().filter(|c| c.is_ascii_alphabetic()).collect();
        if clean.len() > 2 && clean.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
            return Some(clean.to_lowercase());
        }
    }
    None
}
