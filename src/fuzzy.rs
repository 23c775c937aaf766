use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

/// Field view scored by the matcher. Both stored references and
/// registry records project into this shape.
#[derive(Debug, Clone, Copy)]
pub struct MatchFields<'a> {
    pub title: &'a str,
    pub year: Option<i32>,
    pub authors: &'a [String],
}

const YEAR_EXACT_BONUS: f64 = 0.15;
const YEAR_ADJACENT_BONUS: f64 = 0.05;
const YEAR_MISMATCH_PENALTY: f64 = 0.15;
const AUTHOR_OVERLAP_BONUS: f64 = 0.05;

/// Similarity of two candidate records in [0, 1].
///
/// Normalized-title Levenshtein similarity, plus a year term when both
/// years are known (exact match preferred, off-by-one tolerated with
/// reduced confidence) and a small author-surname-overlap term.
/// Deterministic and side-effect free.
pub fn score(a: &MatchFields, b: &MatchFields) -> f64 {
    let mut s = title_similarity(a.title, b.title);
    if let (Some(ya), Some(yb)) = (a.year, b.year) {
        s += match (ya - yb).abs() {
            0 => YEAR_EXACT_BONUS,
            1 => YEAR_ADJACENT_BONUS,
            _ => -YEAR_MISMATCH_PENALTY,
        };
    }
    s += AUTHOR_OVERLAP_BONUS * surname_overlap(a.authors, b.authors);
    s.clamp(0.0, 1.0)
}

/// Case-insensitive, punctuation-stripped title similarity in [0, 1].
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_title(a);
    let b = normalize_title(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    strsim::normalized_levenshtein(&a, &b)
}

// \emph{...}, \textit{...} etc. keep their argument; stray markup dies.
static LATEX_CMD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\[a-zA-Z]+\{([^}]*)\}").unwrap());
static LATEX_JUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"[{}$\\]").unwrap());

/// Strip LaTeX markup and punctuation, collapse whitespace, lowercase.
pub fn normalize_title(title: &str) -> String {
    let t = LATEX_CMD.replace_all(title, "$1");
    let t = LATEX_JUNK.replace_all(&t, "");
    t.chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fraction of shared surnames relative to the shorter author list.
fn surname_overlap(a: &[String], b: &[String]) -> f64 {
    let sa: HashSet<String> = a.iter().filter_map(|x| surname(x)).collect();
    let sb: HashSet<String> = b.iter().filter_map(|x| surname(x)).collect();
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let common = sa.intersection(&sb).count();
    common as f64 / sa.len().min(sb.len()) as f64
}

/// Lowercased family name from "Family, Given" or "Given Family".
pub fn surname(author: &str) -> Option<String> {
    let head = author.split(',').next().unwrap_or("").trim();
    let last = head.split_whitespace().last()?;
    let clean: String = last
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_lowercase();
    if clean.is_empty() { None } else { Some(clean) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields<'a>(title: &'a str, year: Option<i32>, authors: &'a [String]) -> MatchFields<'a> {
        MatchFields { title, year, authors }
    }

    #[test]
    fn identical_titles_score_one() {
        let s = score(
            &fields("Simulated geometry of biosystems", None, &[]),
            &fields("Simulated Geometry of Biosystems", None, &[]),
        );
        assert_eq!(s, 1.0);
    }

    #[test]
    fn latex_markup_is_ignored() {
        assert_eq!(
            normalize_title(r"The \emph{quantum} brain: a {review}"),
            "the quantum brain a review"
        );
        assert_eq!(
            title_similarity(r"\textbf{Entropy} and life", "Entropy and life."),
            1.0
        );
    }

    #[test]
    fn year_agreement_adds_confidence() {
        // Titles differ by a leading article, so the base similarity
        // stays below 1.0 and the year term survives the clamp.
        let same = score(
            &fields("Free energy principle", Some(2010), &[]),
            &fields("The free energy principle", Some(2010), &[]),
        );
        let adjacent = score(
            &fields("Free energy principle", Some(2010), &[]),
            &fields("The free energy principle", Some(2011), &[]),
        );
        let far = score(
            &fields("Free energy principle", Some(2010), &[]),
            &fields("The free energy principle", Some(2015), &[]),
        );
        assert!(same > adjacent);
        assert!(adjacent > far);
    }

    #[test]
    fn score_is_clamped() {
        let authors = ["Friston, Karl".to_string()];
        let s = score(
            &fields("Active inference", Some(2017), &authors),
            &fields("Active inference", Some(2017), &authors),
        );
        assert_eq!(s, 1.0);
        let bad = score(
            &fields("x", Some(1990), &[]),
            &fields("completely different words here", Some(2020), &[]),
        );
        assert!((0.0..=1.0).contains(&bad));
    }

    #[test]
    fn empty_title_scores_zero() {
        assert_eq!(title_similarity("", "Anything"), 0.0);
    }

    #[test]
    fn surname_handles_both_name_orders() {
        assert_eq!(surname("Friston, Karl J."), Some("friston".to_string()));
        assert_eq!(surname("Karl J. Friston"), Some("friston".to_string()));
        assert_eq!(surname("  "), None);
    }

    #[test]
    fn author_overlap_is_fraction_of_shorter_list() {
        let a = ["Smith, A".to_string(), "Jones, B".to_string()];
        let b = ["Smith, Alice".to_string()];
        assert_eq!(surname_overlap(&a, &b), 1.0);
        let c = ["Brown, C".to_string()];
        assert_eq!(surname_overlap(&a, &c), 0.0);
    }
}
