use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// One bibliographic entry in the store.
///
/// `cite_key` is the stable identity, assigned at extraction or harvest
/// time and independent of the DOI. `depth` is the hop-count from the
/// seed bibliography (1 = direct citation, 2 = citation-of-citation) and
/// always holds the minimum depth at which the work was ever reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub cite_key: String,
    #[serde(default)]
    pub title: String,
    /// Ordered author list, "Family, Given" strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub journal: String,
    /// Normalized (lowercase, prefix-stripped) DOI. At most one live
    /// record per DOI in the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    pub depth: u32,
    /// Cite keys of the records that cited this one (provenance).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub source_keys: BTreeSet<String>,
    /// Raw citation text when no structured fields were available.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_text: String,
    /// Set by verification when the registry reports a retraction.
    /// Records are flagged, never deleted.
    #[serde(default, skip_serializing_if = "is_false")]
    pub retracted: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Reference {
    pub fn match_fields(&self) -> crate::fuzzy::MatchFields<'_> {
        crate::fuzzy::MatchFields {
            title: &self.title,
            year: self.year,
            authors: &self.authors,
        }
    }

    pub fn new(cite_key: impl Into<String>, depth: u32) -> Self {
        Reference {
            cite_key: cite_key.into(),
            title: String::new(),
            authors: Vec::new(),
            year: None,
            journal: String::new(),
            doi: None,
            depth,
            source_keys: BTreeSet::new(),
            raw_text: String::new(),
            retracted: false,
        }
    }
}

/// The bibliography document as persisted on disk. Field order is
/// struct-declared and stable so the file stays diffable under version
/// control.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Bibliography {
    #[serde(default)]
    pub metadata: BibMetadata,
    #[serde(default)]
    pub references: Vec<Reference>,
}

/// Summary counts, recomputed on every save.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BibMetadata {
    #[serde(default)]
    pub total_references: usize,
    #[serde(default)]
    pub with_doi: usize,
    #[serde(default)]
    pub depth2_references: usize,
}

/// Outcome recorded per expanded DOI in the harvest log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HarvestStatus {
    /// The registry returned a non-empty reference list.
    Success,
    /// The fetch succeeded but the work cites nothing we can use.
    NoReferencesFound,
    /// Transport failure, unknown DOI, or malformed response.
    FetchError,
}

/// One harvest-log row: this DOI's outbound references have been
/// fetched (or the fetch failed terminally). At most one entry per DOI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestEntry {
    pub status: HarvestStatus,
    pub timestamp: i64,
}

/// Idempotence ledger for depth expansion. Advisory: losing it only
/// causes redundant refetches, since merging by DOI is itself
/// idempotent.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HarvestLog {
    #[serde(default)]
    pub entries: BTreeMap<String, HarvestEntry>,
}

/// Normalize a DOI for identity comparison: trim, strip resolver-URL
/// and `doi:` prefixes, lowercase. Returns None for strings that cannot
/// be a DOI (registry keys always start with "10.").
pub fn normalize_doi(raw: &str) -> Option<String> {
    let mut s = raw.trim().to_lowercase();
    for prefix in [
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
        "doi:",
    ] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.trim_start().to_string();
            break;
        }
    }
    if s.starts_with("10.") { Some(s) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doi_normalization_strips_prefixes_and_case() {
        assert_eq!(
            normalize_doi("https://doi.org/10.1038/NPHYS1170"),
            Some("10.1038/nphys1170".to_string())
        );
        assert_eq!(normalize_doi("DOI:10.1/ABC"), Some("10.1/abc".to_string()));
        assert_eq!(
            normalize_doi("  10.1016/j.biosystems.2019.104001  "),
            Some("10.1016/j.biosystems.2019.104001".to_string())
        );
    }

    #[test]
    fn doi_normalization_rejects_non_dois() {
        assert_eq!(normalize_doi(""), None);
        assert_eq!(normalize_doi("n/a"), None);
        assert_eq!(normalize_doi("https://doi.org/"), None);
    }

    #[test]
    fn harvest_status_serializes_kebab_case() {
        let e = HarvestEntry { status: HarvestStatus::NoReferencesFound, timestamp: 0 };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("no-references-found"));
    }
}
