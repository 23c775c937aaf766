/// All tunable knobs in one immutable struct, built once in main and
/// passed by reference into each component. Match thresholds, batch
/// size, and request pacing are deliberately plain fields rather than
/// process-wide state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Works endpoint of the metadata registry.
    pub api_base: String,
    /// Contact address sent with every request (polite-pool etiquette).
    pub mailto: String,
    /// Fixed delay before each registry request, in milliseconds.
    pub rate_limit_ms: u64,
    /// Candidate rows requested per bibliographic search.
    pub search_rows: usize,
    /// Minimum fuzzy score for the resolver to accept a DOI match.
    pub accept_threshold: f64,
    /// Minimum fuzzy score for the store to merge two records as the
    /// same work.
    pub dedup_threshold: f64,
    /// Maximum source references expanded per batch.
    pub batch_size: usize,
    /// Depth of the references whose citations are being harvested;
    /// discovered works land at `source_depth + 1`.
    pub source_depth: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_base: "https://api.crossref.org/works".to_string(),
            mailto: "refharvest@example.org".to_string(),
            rate_limit_ms: 120,
            search_rows: 3,
            accept_threshold: 0.80,
            dedup_threshold: 0.92,
            batch_size: 200,
            source_depth: 1,
        }
    }
}
