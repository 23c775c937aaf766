use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::fuzzy;
use crate::types::{Bibliography, Reference, normalize_doi};

/// Single owner of all reference records. Deduplicates on insert and
/// round-trips the bibliography file; nothing else writes records.
pub struct Store {
    bib: Bibliography,
    dedup_threshold: f64,
}

impl Store {
    pub fn new(dedup_threshold: f64) -> Self {
        Store { bib: Bibliography::default(), dedup_threshold }
    }

    /// Load a bibliography file. An unreadable or unparsable file is a
    /// hard error: proceeding would risk silent data loss on save.
    pub fn load(path: &Path, dedup_threshold: f64) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read bibliography: {}", path.display()))?;
        let mut bib: Bibliography = serde_json::from_str(&text)
            .with_context(|| format!("Bibliography is not valid JSON: {}", path.display()))?;
        for r in &mut bib.references {
            r.doi = r.doi.as_deref().and_then(normalize_doi);
        }
        Ok(Store { bib, dedup_threshold })
    }

    /// Write the bibliography via a temp file + rename so an
    /// interrupted save never leaves a half-written store behind.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.refresh_metadata();
        let json = serde_json::to_string_pretty(&self.bib)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn references(&self) -> &[Reference] {
        &self.bib.references
    }

    pub fn len(&self) -> usize {
        self.bib.references.len()
    }

    pub fn get(&self, cite_key: &str) -> Option<&Reference> {
        self.bib.references.iter().find(|r| r.cite_key == cite_key)
    }

    /// Insert a candidate record, merging it into an existing one when
    /// they identify the same work. Returns the cite key it ended up
    /// under and whether a new record was created.
    ///
    /// Match order: normalized DOI first, then fuzzy title match above
    /// the dedup threshold (only when the DOIs do not conflict). Merging
    /// is fill-in-blank only and keeps the minimum depth. Never fails:
    /// malformed fields are normalized or dropped and the record is
    /// still inserted, because partial data retains provenance value.
    pub fn add_or_merge(&mut self, mut candidate: Reference) -> (String, bool) {
        candidate.doi = candidate.doi.as_deref().and_then(normalize_doi);

        if let Some(doi) = candidate.doi.clone()
            && let Some(idx) = self.position_by_doi(&doi)
        {
            merge_into(&mut self.bib.references[idx], candidate);
            return (self.bib.references[idx].cite_key.clone(), false);
        }

        if let Some(idx) = self.fuzzy_match(&candidate) {
            merge_into(&mut self.bib.references[idx], candidate);
            return (self.bib.references[idx].cite_key.clone(), false);
        }

        candidate.cite_key = self.unique_key(&candidate.cite_key);
        let key = candidate.cite_key.clone();
        self.bib.references.push(candidate);
        (key, true)
    }

    /// Give `cite_key` a DOI through the merge path. Refuses to
    /// overwrite an existing DOI; if another record already holds the
    /// DOI the two are folded into one, keeping the minimum depth.
    pub fn assign_doi(&mut self, cite_key: &str, doi: &str) -> Option<String> {
        let normalized = normalize_doi(doi)?;
        let idx = self
            .bib
            .references
            .iter()
            .position(|r| r.cite_key == cite_key)?;
        if self.bib.references[idx].doi.is_some() {
            return None;
        }
        let mut record = self.bib.references.remove(idx);
        record.doi = Some(normalized);
        let (key, _) = self.add_or_merge(record);
        Some(key)
    }

    pub fn mark_retracted(&mut self, cite_key: &str) {
        if let Some(r) = self.bib.references.iter_mut().find(|r| r.cite_key == cite_key) {
            r.retracted = true;
        }
    }

    /// Records still lacking a DOI, in cite-key order.
    pub fn find_without_doi(&self) -> Vec<&Reference> {
        let mut refs: Vec<&Reference> = self
            .bib
            .references
            .iter()
            .filter(|r| r.doi.is_none())
            .collect();
        refs.sort_by(|a, b| a.cite_key.cmp(&b.cite_key));
        refs
    }

    /// Records at exactly depth `d`, in cite-key order.
    pub fn find_by_depth(&self, d: u32) -> Vec<&Reference> {
        let mut refs: Vec<&Reference> = self
            .bib
            .references
            .iter()
            .filter(|r| r.depth == d)
            .collect();
        refs.sort_by(|a, b| a.cite_key.cmp(&b.cite_key));
        refs
    }

    pub fn count_with_doi(&self) -> usize {
        self.bib.references.iter().filter(|r| r.doi.is_some()).count()
    }

    fn position_by_doi(&self, doi: &str) -> Option<usize> {
        self.bib
            .references
            .iter()
            .position(|r| r.doi.as_deref() == Some(doi))
    }

    /// Best title match at or above the dedup threshold, skipping
    /// records whose DOI conflicts with the candidate's. Dedup is keyed
    /// on the title alone: year and author agreement raise resolver
    /// confidence, but two distinct works by one group in one year must
    /// never merge on them.
    fn fuzzy_match(&self, candidate: &Reference) -> Option<usize> {
        if candidate.title.is_empty() {
            return None;
        }
        let mut best: Option<(usize, f64)> = None;
        for (idx, r) in self.bib.references.iter().enumerate() {
            if let (Some(a), Some(b)) = (&r.doi, &candidate.doi)
                && a != b
            {
                continue;
            }
            let s = fuzzy::title_similarity(&r.title, &candidate.title);
            if s >= self.dedup_threshold && best.is_none_or(|(_, bs)| s > bs) {
                best = Some((idx, s));
            }
        }
        best.map(|(idx, _)| idx)
    }

    fn unique_key(&self, base: &str) -> String {
        let base = if base.is_empty() { "unknown" } else { base };
        if self.get(base).is_none() {
            return base.to_string();
        }
        let mut counter = 1;
        loop {
            let key = format!("{base}_{counter}");
            if self.get(&key).is_none() {
                return key;
            }
            counter += 1;
        }
    }

    fn refresh_metadata(&mut self) {
        self.bib.metadata.total_references = self.bib.references.len();
        self.bib.metadata.with_doi = self.count_with_doi();
        self.bib.metadata.depth2_references =
            self.bib.references.iter().filter(|r| r.depth >= 2).count();
    }
}

/// Fill-in-blank merge: never overwrite a populated field with an empty
/// one, keep the minimum depth, union provenance.
fn merge_into(existing: &mut Reference, other: Reference) {
    if existing.title.is_empty() && !other.title.is_empty() {
        existing.title = other.title;
    }
    if existing.authors.is_empty() {
        existing.authors = other.authors;
    }
    if existing.year.is_none() {
        existing.year = other.year;
    }
    if existing.journal.is_empty() {
        existing.journal = other.journal;
    }
    if existing.doi.is_none() {
        existing.doi = other.doi;
    }
    if existing.raw_text.is_empty() {
        existing.raw_text = other.raw_text;
    }
    existing.depth = existing.depth.min(other.depth);
    existing.source_keys.extend(other.source_keys);
    existing.retracted |= other.retracted;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_doi(key: &str, title: &str, doi: &str, depth: u32) -> Reference {
        let mut r = Reference::new(key, depth);
        r.title = title.to_string();
        r.doi = Some(doi.to_string());
        r
    }

    #[test]
    fn merge_by_doi_keeps_minimum_depth() {
        let mut store = Store::new(0.92);
        store.add_or_merge(with_doi("friston2010", "The free-energy principle", "10.1038/nrn2787", 1));
        let (key, created) =
            store.add_or_merge(with_doi("d2_friston2010", "free energy principle", "10.1038/NRN2787", 2));
        assert!(!created);
        assert_eq!(key, "friston2010");
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("friston2010").unwrap().depth, 1);
    }

    #[test]
    fn merge_fills_blanks_without_destroying_data() {
        let mut store = Store::new(0.92);
        let mut a = with_doi("smith2019", "Quantum cognition models", "10.1/qc", 1);
        a.year = Some(2019);
        store.add_or_merge(a);

        let mut b = with_doi("d2_smith", "", "10.1/qc", 2);
        b.journal = "Cognitive Science".to_string();
        store.add_or_merge(b);

        let merged = store.get("smith2019").unwrap();
        assert_eq!(merged.year, Some(2019));
        assert_eq!(merged.title, "Quantum cognition models");
        assert_eq!(merged.journal, "Cognitive Science");
        assert_eq!(merged.depth, 1);
    }

    #[test]
    fn fuzzy_titles_merge_but_doi_conflict_blocks() {
        let mut store = Store::new(0.92);
        store.add_or_merge(with_doi("a1", "A Model of Neural Darwinism", "10.1/a", 1));

        // Same work, noisier title, no DOI: merges.
        let mut dup = Reference::new("d2_edelman", 2);
        dup.title = "A model of neural Darwinism.".to_string();
        let (key, created) = store.add_or_merge(dup);
        assert!(!created);
        assert_eq!(key, "a1");

        // Identical title but a different DOI: distinct work.
        let other = with_doi("a2", "A Model of Neural Darwinism", "10.1/b", 1);
        let (_, created) = store.add_or_merge(other);
        assert!(created);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn shared_author_and_year_never_force_a_merge() {
        let mut store = Store::new(0.92);
        let mut a = Reference::new("hopfield1982", 2);
        a.title = "Learning I".to_string();
        a.authors = vec!["Hopfield, J. J.".to_string()];
        a.year = Some(1982);
        let mut b = Reference::new("hopfield1982a", 2);
        b.title = "Learning II".to_string();
        b.authors = vec!["Hopfield, J. J.".to_string()];
        b.year = Some(1982);

        store.add_or_merge(a);
        let (_, created) = store.add_or_merge(b);
        assert!(created);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn doi_uniqueness_holds_after_merges() {
        let mut store = Store::new(0.92);
        store.add_or_merge(with_doi("k1", "Paper one", "10.1/x", 1));
        store.add_or_merge(with_doi("k2", "Totally different paper", "10.1/x", 2));
        store.add_or_merge(with_doi("k3", "Third thing entirely", "10.2/y", 1));

        let mut dois: Vec<&str> = store
            .references()
            .iter()
            .filter_map(|r| r.doi.as_deref())
            .collect();
        let before = dois.len();
        dois.sort();
        dois.dedup();
        assert_eq!(dois.len(), before);
    }

    #[test]
    fn colliding_cite_keys_are_uniquified() {
        let mut store = Store::new(0.92);
        let mut a = Reference::new("d2_unknown", 2);
        a.title = "First unrelated work".to_string();
        let mut b = Reference::new("d2_unknown", 2);
        b.title = "Second unrelated work".to_string();
        let (k1, _) = store.add_or_merge(a);
        let (k2, _) = store.add_or_merge(b);
        assert_eq!(k1, "d2_unknown");
        assert_eq!(k2, "d2_unknown_1");
    }

    #[test]
    fn malformed_input_still_inserts() {
        let mut store = Store::new(0.92);
        let mut r = Reference::new("", 2);
        r.doi = Some("not a doi".to_string());
        let (key, created) = store.add_or_merge(r);
        assert!(created);
        assert_eq!(key, "unknown");
        assert!(store.get("unknown").unwrap().doi.is_none());
    }

    #[test]
    fn assign_doi_never_overwrites_and_folds_duplicates() {
        let mut store = Store::new(0.92);
        store.add_or_merge(with_doi("holder", "Scale-free networks", "10.1/sfn", 1));
        let mut dup = Reference::new("dup", 2);
        dup.title = "On random graphs and other matters".to_string();
        dup.year = Some(1999);
        store.add_or_merge(dup);

        // Existing DOI is not re-resolved.
        assert_eq!(store.assign_doi("holder", "10.9/other"), None);
        assert_eq!(store.get("holder").unwrap().doi.as_deref(), Some("10.1/sfn"));

        // Late DOI assignment that collides folds the record in.
        let key = store.assign_doi("dup", "10.1/SFN").unwrap();
        assert_eq!(key, "holder");
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("holder").unwrap().depth, 1);
        assert_eq!(store.get("holder").unwrap().year, Some(1999));
    }

    #[test]
    fn finders_are_cite_key_ordered() {
        let mut store = Store::new(0.92);
        let mut b = Reference::new("bbb", 1);
        b.title = "B paper".to_string();
        let mut a = Reference::new("aaa", 1);
        a.title = "A paper".to_string();
        store.add_or_merge(b);
        store.add_or_merge(a);
        let keys: Vec<&str> = store
            .find_without_doi()
            .iter()
            .map(|r| r.cite_key.as_str())
            .collect();
        assert_eq!(keys, vec!["aaa", "bbb"]);
        assert_eq!(store.find_by_depth(2).len(), 0);
    }

    #[test]
    fn bibliography_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bibliography.json");

        let mut store = Store::new(0.92);
        let mut r = with_doi("kelso1995", "Dynamic patterns", "10.1/dp", 1);
        r.authors = vec!["Kelso, J. A. Scott".to_string()];
        r.year = Some(1995);
        r.source_keys.insert("seed_paper".to_string());
        store.add_or_merge(r);
        store.save(&path).unwrap();

        let reloaded = Store::load(&path, 0.92).unwrap();
        assert_eq!(reloaded.len(), 1);
        let r = reloaded.get("kelso1995").unwrap();
        assert_eq!(r.doi.as_deref(), Some("10.1/dp"));
        assert_eq!(r.year, Some(1995));
        assert!(r.source_keys.contains("seed_paper"));
    }

    #[test]
    fn unreadable_bibliography_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bibliography.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Store::load(&path, 0.92).is_err());
        assert!(Store::load(&dir.path().join("missing.json"), 0.92).is_err());
    }
}
