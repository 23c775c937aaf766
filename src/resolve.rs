use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::cache::LookupCache;
use crate::config::Config;
use crate::crossref::{MetadataSource, WorkQuery};
use crate::fuzzy;
use crate::store::Store;
use crate::types::Reference;

/// Outcome of one resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Matched { doi: String, score: f64 },
    /// Best candidate scored below the acceptance threshold, or the
    /// registry returned nothing usable. Expected, not an error.
    NoMatch,
    /// Transport failure; the reference stays unresolved for a later
    /// retry, with no partial mutation.
    FetchError,
}

#[derive(Debug, Default, Clone)]
pub struct ResolveSummary {
    pub attempted: usize,
    pub matched: usize,
    /// Matches whose DOI collided with an existing record, folding the
    /// two into one.
    pub folded: usize,
    pub no_match: usize,
    pub fetch_errors: usize,
    pub skipped_no_title: usize,
    pub already_had_doi: usize,
}

/// A DOI accepted for a cite key, kept for dry-run previews.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub cite_key: String,
    pub doi: String,
    pub score: f64,
}

pub struct Resolver<'a> {
    source: &'a dyn MetadataSource,
    cache: Option<&'a LookupCache>,
    cfg: &'a Config,
}

impl<'a> Resolver<'a> {
    pub fn new(
        source: &'a dyn MetadataSource,
        cache: Option<&'a LookupCache>,
        cfg: &'a Config,
    ) -> Self {
        Resolver { source, cache, cfg }
    }

    /// Find a DOI for one reference: search the registry by title (and
    /// first-author surname when available), score each candidate with
    /// the fuzzy matcher, accept the best only at or above the
    /// acceptance threshold. References that already carry a DOI are
    /// never re-resolved.
    pub fn resolve(&self, r: &Reference) -> Resolution {
        if r.doi.is_some() {
            return Resolution::NoMatch;
        }
        let title = fuzzy::normalize_title(&r.title);
        if title.is_empty() {
            return Resolution::NoMatch;
        }

        let key = self.cache_key(r, &title);
        if let Some(cache) = self.cache
            && let Ok(Some(hit)) = cache.get(&key)
        {
            return match hit {
                Some((doi, score)) => Resolution::Matched { doi, score },
                None => Resolution::NoMatch,
            };
        }

        let author = r
            .authors
            .first()
            .and_then(|a| fuzzy::surname(a))
            .unwrap_or_default();
        let query = WorkQuery { title, author };
        let candidates = match self.source.search(&query) {
            Ok(c) => c,
            // Transient: do not cache, caller may retry later.
            Err(_) => return Resolution::FetchError,
        };

        let fields = r.match_fields();
        let best = candidates
            .iter()
            .take(self.cfg.search_rows)
            .filter(|c| !c.doi.is_empty())
            .map(|c| (c, fuzzy::score(&fields, &c.match_fields())))
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((c, score)) if score >= self.cfg.accept_threshold => {
                if let Some(cache) = self.cache {
                    let _ = cache.put(&key, Some((&c.doi, score)));
                }
                Resolution::Matched { doi: c.doi.clone(), score }
            }
            _ => {
                if let Some(cache) = self.cache {
                    let _ = cache.put(&key, None);
                }
                Resolution::NoMatch
            }
        }
    }

    /// Resolve every DOI-less reference in the store, in cite-key
    /// order. Matches are applied through the store's merge path unless
    /// `dry_run` is set.
    pub fn resolve_all(
        &self,
        store: &mut Store,
        limit: usize,
        dry_run: bool,
        quiet: bool,
    ) -> (ResolveSummary, Vec<ResolvedKey>) {
        let mut summary = ResolveSummary {
            already_had_doi: store.count_with_doi(),
            ..Default::default()
        };

        let mut targets: Vec<Reference> = Vec::new();
        for r in store.find_without_doi() {
            if fuzzy::normalize_title(&r.title).is_empty() {
                summary.skipped_no_title += 1;
            } else {
                targets.push(r.clone());
            }
        }
        if limit > 0 {
            targets.truncate(limit);
        }

        let total = targets.len();
        let mut resolved = Vec::new();
        for (i, r) in targets.iter().enumerate() {
            summary.attempted += 1;
            if !quiet && (i + 1) % 25 == 0 {
                eprint!(
                    "\rResolving DOIs: {}/{total} (matched: {})",
                    i + 1,
                    summary.matched
                );
            }
            match self.resolve(r) {
                Resolution::Matched { doi, score } => {
                    summary.matched += 1;
                    if !dry_run
                        && let Some(key) = store.assign_doi(&r.cite_key, &doi)
                        && key != r.cite_key
                    {
                        summary.folded += 1;
                    }
                    resolved.push(ResolvedKey { cite_key: r.cite_key.clone(), doi, score });
                }
                Resolution::NoMatch => summary.no_match += 1,
                Resolution::FetchError => summary.fetch_errors += 1,
            }
        }
        if !quiet && total >= 25 {
            eprintln!();
        }
        (summary, resolved)
    }

    fn cache_key(&self, r: &Reference, title: &str) -> String {
        let year = r.year.map(|y| y.to_string()).unwrap_or_default();
        format!("t:{title}|y:{year}")
    }
}

#[derive(Serialize)]
struct MissingDoi<'a> {
    cite_key: &'a str,
    title: &'a str,
    authors: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    year: Option<i32>,
}

/// Write the list of references that still need a DOI, for manual
/// follow-up.
pub fn write_missing_report(store: &Store, path: &Path) -> Result<usize> {
    let missing: Vec<MissingDoi> = store
        .find_without_doi()
        .into_iter()
        .filter(|r| !r.title.is_empty())
        .map(|r| MissingDoi {
            cite_key: &r.cite_key,
            title: &r.title,
            authors: &r.authors,
            year: r.year,
        })
        .collect();
    let json = serde_json::to_string_pretty(&missing)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(missing.len())
}
