use std::fmt;
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::config::Config;
use crate::fuzzy::MatchFields;

/// Transport failure, throttling, or a malformed registry response.
/// Always absorbed per candidate, never escalated to a batch failure.
#[derive(Debug, Clone)]
pub struct FetchError(pub String);

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registry fetch failed: {}", self.0)
    }
}

impl std::error::Error for FetchError {}

/// Bibliographic search terms sent to the registry.
#[derive(Debug, Clone, Default)]
pub struct WorkQuery {
    pub title: String,
    /// First-author surname, when one could be extracted.
    pub author: String,
}

/// A registry work: search candidate or full record for a DOI.
#[derive(Debug, Clone, Default)]
pub struct WorkRecord {
    pub doi: String,
    pub title: String,
    pub year: Option<i32>,
    /// "Family, Given" strings.
    pub authors: Vec<String>,
    /// Outbound reference list (populated on works/{doi} fetches).
    pub references: Vec<CitedRecord>,
    pub retracted: bool,
}

impl WorkRecord {
    pub fn match_fields(&self) -> MatchFields<'_> {
        MatchFields { title: &self.title, year: self.year, authors: &self.authors }
    }
}

/// One entry of a work's reference list. Registry reference entries are
/// noisy: any field may be missing, and sometimes only the unstructured
/// citation text is present.
#[derive(Debug, Clone, Default)]
pub struct CitedRecord {
    pub doi: Option<String>,
    pub title: String,
    /// Unstructured first-author string, usually "Family, Given".
    pub author: String,
    pub year: Option<i32>,
    pub journal: String,
    pub unstructured: String,
}

/// The external metadata collaborator. The engine and resolver only see
/// this trait, so tests substitute a canned registry.
pub trait MetadataSource {
    /// Ranked candidate works for a title/author query.
    fn search(&self, query: &WorkQuery) -> Result<Vec<WorkRecord>, FetchError>;

    /// Full metadata plus reference list for a DOI. `Ok(None)` means
    /// the registry does not know the DOI.
    fn fetch_work(&self, doi: &str) -> Result<Option<WorkRecord>, FetchError>;
}

/// Blocking CrossRef client. Every request is preceded by a fixed delay
/// and carries the mailto parameter, staying inside the polite pool.
pub struct CrossRefClient<'a> {
    cfg: &'a Config,
}

impl<'a> CrossRefClient<'a> {
    pub fn new(cfg: &'a Config) -> Self {
        CrossRefClient { cfg }
    }

    fn get(&self, url: &str) -> Result<Option<String>, FetchError> {
        thread::sleep(Duration::from_millis(self.cfg.rate_limit_ms));
        let resp = match ureq::get(url).call() {
            Ok(resp) => resp,
            Err(ureq::Error::StatusCode(404)) => return Ok(None),
            Err(e) => return Err(FetchError(e.to_string())),
        };
        let body = resp
            .into_body()
            .read_to_string()
            .map_err(|e| FetchError(e.to_string()))?;
        Ok(Some(body))
    }
}

impl MetadataSource for CrossRefClient<'_> {
    fn search(&self, query: &WorkQuery) -> Result<Vec<WorkRecord>, FetchError> {
        let mut url = format!(
            "{}?query.bibliographic={}&rows={}&mailto={}",
            self.cfg.api_base,
            encode_terms(&query.title),
            self.cfg.search_rows,
            self.cfg.mailto,
        );
        if !query.author.is_empty() {
            url.push_str("&query.author=");
            url.push_str(&encode_terms(&query.author));
        }
        let Some(body) = self.get(&url)? else {
            return Ok(Vec::new());
        };
        let data: ApiEnvelope<SearchMessage> =
            serde_json::from_str(&body).map_err(|e| FetchError(e.to_string()))?;
        Ok(data.message.items.into_iter().map(WorkRecord::from).collect())
    }

    fn fetch_work(&self, doi: &str) -> Result<Option<WorkRecord>, FetchError> {
        let url = format!("{}/{}?mailto={}", self.cfg.api_base, doi, self.cfg.mailto);
        let Some(body) = self.get(&url)? else {
            return Ok(None);
        };
        let data: ApiEnvelope<ApiWork> =
            serde_json::from_str(&body).map_err(|e| FetchError(e.to_string()))?;
        Ok(Some(WorkRecord::from(data.message)))
    }
}

/// Space-join query terms with '+', dropping characters that would
/// break the hand-built URL.
fn encode_terms(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '&' | '?' | '#' | '%' | '+' | '=' | '/' => ' ',
            c => c,
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("+")
}

// ── CrossRef wire format ───────────────────────────────────────────────

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    message: T,
}

#[derive(Deserialize)]
struct SearchMessage {
    #[serde(default)]
    items: Vec<ApiWork>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ApiWork {
    #[serde(rename = "DOI")]
    doi: String,
    title: Vec<String>,
    author: Vec<ApiAuthor>,
    #[serde(rename = "published-print")]
    published_print: Option<ApiDate>,
    #[serde(rename = "published-online")]
    published_online: Option<ApiDate>,
    reference: Vec<ApiReference>,
    #[serde(rename = "update-to")]
    update_to: Vec<ApiUpdate>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ApiAuthor {
    family: String,
    given: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ApiDate {
    #[serde(rename = "date-parts")]
    date_parts: Vec<Vec<Option<i32>>>,
}

impl ApiDate {
    fn year(&self) -> Option<i32> {
        self.date_parts.first()?.first().copied().flatten()
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ApiReference {
    #[serde(rename = "DOI")]
    doi: String,
    #[serde(rename = "article-title")]
    article_title: String,
    #[serde(rename = "volume-title")]
    volume_title: String,
    #[serde(rename = "journal-title")]
    journal_title: String,
    author: String,
    year: String,
    unstructured: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ApiUpdate {
    #[serde(rename = "type")]
    kind: String,
}

impl From<ApiWork> for WorkRecord {
    fn from(w: ApiWork) -> Self {
        let year = w
            .published_print
            .as_ref()
            .and_then(ApiDate::year)
            .or_else(|| w.published_online.as_ref().and_then(ApiDate::year));
        WorkRecord {
            doi: w.doi,
            title: w.title.join(" "),
            year,
            authors: w.author.iter().map(ApiAuthor::display).collect(),
            references: w.reference.into_iter().map(CitedRecord::from).collect(),
            retracted: w.update_to.iter().any(|u| u.kind == "retraction"),
        }
    }
}

impl ApiAuthor {
    fn display(&self) -> String {
        if self.given.is_empty() {
            self.family.clone()
        } else {
            format!("{}, {}", self.family, self.given)
        }
    }
}

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(19|20)\d{2}\b").unwrap());

impl From<ApiReference> for CitedRecord {
    fn from(r: ApiReference) -> Self {
        let title = if !r.article_title.is_empty() {
            r.article_title
        } else {
            r.volume_title
        };
        // Fall back to a year mentioned in the unstructured text.
        let year = r
            .year
            .parse::<i32>()
            .ok()
            .or_else(|| YEAR_RE.find(&r.unstructured)?.as_str().parse().ok());
        CitedRecord {
            doi: if r.doi.is_empty() { None } else { Some(r.doi) },
            title,
            author: r.author,
            year,
            journal: r.journal_title,
            unstructured: r.unstructured,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_BODY: &str = r#"{
        "message": {
            "items": [{
                "DOI": "10.1038/nrn2787",
                "title": ["The free-energy principle: a unified brain theory?"],
                "author": [{"family": "Friston", "given": "Karl"}],
                "published-print": {"date-parts": [[2010, 2]]}
            }]
        }
    }"#;

    const WORK_BODY: &str = r#"{
        "message": {
            "DOI": "10.1/x",
            "title": ["Seed paper"],
            "update-to": [{"type": "retraction", "label": "Retraction"}],
            "reference": [
                {"key": "ref1", "DOI": "10.2/a", "article-title": "Cited A",
                 "author": "Jones, B", "year": "2001", "journal-title": "J. Theor. Biol."},
                {"key": "ref2",
                 "unstructured": "Smith, A. Old result in passing. Proc. Conf. 1987."}
            ]
        }
    }"#;

    #[test]
    fn search_response_deserializes() {
        let data: ApiEnvelope<SearchMessage> = serde_json::from_str(SEARCH_BODY).unwrap();
        let works: Vec<WorkRecord> =
            data.message.items.into_iter().map(WorkRecord::from).collect();
        assert_eq!(works.len(), 1);
        assert_eq!(works[0].doi, "10.1038/nrn2787");
        assert_eq!(works[0].year, Some(2010));
        assert_eq!(works[0].authors, vec!["Friston, Karl".to_string()]);
    }

    #[test]
    fn work_response_carries_references_and_retraction() {
        let data: ApiEnvelope<ApiWork> = serde_json::from_str(WORK_BODY).unwrap();
        let work = WorkRecord::from(data.message);
        assert!(work.retracted);
        assert_eq!(work.references.len(), 2);
        assert_eq!(work.references[0].doi.as_deref(), Some("10.2/a"));
        assert_eq!(work.references[0].year, Some(2001));
        // Year recovered from unstructured text.
        assert_eq!(work.references[1].doi, None);
        assert_eq!(work.references[1].year, Some(1987));
    }

    #[test]
    fn query_terms_are_url_safe() {
        assert_eq!(
            encode_terms("What is life? Mind & matter"),
            "What+is+life+Mind+matter"
        );
        assert_eq!(encode_terms("a/b=c"), "a+b+c");
    }
}
