mod cache;
mod config;
mod crossref;
mod expand;
mod fuzzy;
mod resolve;
mod store;
mod types;
mod verify;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

use cache::LookupCache;
use config::Config;
use crossref::CrossRefClient;
use expand::Engine;
use resolve::Resolver;
use store::Store;
use types::{HarvestLog, HarvestStatus};

#[derive(Parser)]
#[command(name = "refharvest", about = "Resolve, deduplicate, and depth-expand bibliographies")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Contact address sent with registry requests (polite pool)
    #[arg(long, env = "REFHARVEST_MAILTO", global = true)]
    mailto: Option<String>,

    /// Delay between registry requests in milliseconds
    #[arg(long, global = true)]
    delay_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve missing DOIs via the registry
    Resolve {
        /// Path to bibliography.json
        bibliography: PathBuf,

        /// Preview matches without saving changes
        #[arg(long)]
        dry_run: bool,

        /// Max references to resolve (0 = all)
        #[arg(long, default_value_t = 0)]
        limit: usize,

        /// Suppress progress output
        #[arg(long)]
        quiet: bool,

        /// Skip the on-disk lookup cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Run one depth-expansion batch
    Expand {
        /// Directory containing bibliography.json and harvest_log.json
        data_dir: PathBuf,

        /// Max source references to expand this batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Depth of the references to expand from
        #[arg(long, default_value_t = 1)]
        depth: u32,
    },

    /// Run expansion batches until no pending work remains
    Run {
        /// Directory containing bibliography.json and harvest_log.json
        data_dir: PathBuf,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long, default_value_t = 1)]
        depth: u32,
    },

    /// Report store and harvest-log counts
    Status {
        /// Directory containing bibliography.json and harvest_log.json
        data_dir: PathBuf,
    },

    /// Verify assigned DOIs against registry metadata
    Verify {
        /// Path to bibliography.json
        bibliography: PathBuf,

        /// Max references to verify (0 = all)
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = Config::default();
    if let Some(mailto) = cli.mailto {
        cfg.mailto = mailto;
    }
    if let Some(delay) = cli.delay_ms {
        cfg.rate_limit_ms = delay;
    }

    match cli.command {
        Command::Resolve { bibliography, dry_run, limit, quiet, no_cache } => {
            run_resolve(&cfg, &bibliography, dry_run, limit, quiet, no_cache)
        }
        Command::Expand { data_dir, batch_size, depth } => {
            cfg.source_depth = depth;
            if let Some(size) = batch_size {
                cfg.batch_size = size;
            }
            run_expand(&cfg, &data_dir, false)
        }
        Command::Run { data_dir, batch_size, depth } => {
            cfg.source_depth = depth;
            if let Some(size) = batch_size {
                cfg.batch_size = size;
            }
            run_expand(&cfg, &data_dir, true)
        }
        Command::Status { data_dir } => run_status(&cfg, &data_dir),
        Command::Verify { bibliography, limit } => run_verify(&cfg, &bibliography, limit),
    }
}

fn run_resolve(
    cfg: &Config,
    bib_path: &Path,
    dry_run: bool,
    limit: usize,
    quiet: bool,
    no_cache: bool,
) -> Result<()> {
    let mut store = Store::load(bib_path, cfg.dedup_threshold)?;
    let client = CrossRefClient::new(cfg);
    let cache = if no_cache { None } else { Some(LookupCache::open()?) };
    let resolver = Resolver::new(&client, cache.as_ref(), cfg);

    let (summary, resolved) = resolver.resolve_all(&mut store, limit, dry_run, quiet);

    print_rule();
    println!("DOI Resolution Report");
    print_rule();
    println!("  Attempted:     {}", summary.attempted);
    println!("  Matched:       {}", summary.matched);
    if summary.folded > 0 {
        println!("  Folded dupes:  {}", summary.folded);
    }
    println!("  No match:      {}", summary.no_match);
    println!("  Fetch errors:  {}", summary.fetch_errors);
    println!("  No title:      {}", summary.skipped_no_title);
    println!("  Already had:   {}", summary.already_had_doi);
    println!("  Total DOI now: {}/{}", store.count_with_doi(), store.len());
    print_rule();

    if dry_run {
        println!("\n[DRY RUN] No changes saved.");
        for hit in resolved.iter().take(20) {
            println!("  {}: {} (score={:.3})", hit.cite_key, hit.doi, hit.score);
        }
        if resolved.len() > 20 {
            println!("  ... and {} more", resolved.len() - 20);
        }
        return Ok(());
    }

    store.save(bib_path)?;
    let missing_path = sibling(bib_path, "missing_dois.json");
    let missing = resolve::write_missing_report(&store, &missing_path)?;
    println!("\nUpdated {}", bib_path.display());
    println!("{missing} refs still need DOIs ({})", missing_path.display());

    if summary.fetch_errors > 0 {
        std::process::exit(2);
    }
    Ok(())
}

fn run_expand(cfg: &Config, data_dir: &Path, until_exhausted: bool) -> Result<()> {
    let bib_path = data_dir.join("bibliography.json");
    let log_path = data_dir.join("harvest_log.json");
    let mut store = Store::load(&bib_path, cfg.dedup_threshold)?;
    let mut log = HarvestLog::load(&log_path)?;
    let client = CrossRefClient::new(cfg);
    let engine = Engine::new(&client, cfg);

    let pending_before = engine.pending(&store, &log).len();
    let summary = if until_exhausted {
        engine.run_until_exhausted(&mut store, &mut log, &bib_path, &log_path)?
    } else {
        let summary = engine.run_batch(&mut store, &mut log);
        if summary.candidates > 0 {
            store.save(&bib_path)?;
            log.save(&log_path)?;
        }
        summary
    };

    if summary.candidates == 0 {
        println!("No pending work: every depth-{} DOI is already harvested.", cfg.source_depth);
        return Ok(());
    }

    print_rule();
    println!("Depth-{} Reference Harvesting", cfg.source_depth + 1);
    print_rule();
    println!("  Pending before run:   {pending_before}");
    println!("  Expanded:             {}", summary.expanded);
    println!("  No references found:  {}", summary.no_refs);
    println!("  Fetch errors:         {}", summary.fetch_errors);
    println!("  Raw references:       {}", summary.raw_refs);
    println!("  New refs added:       {}", summary.new_refs);
    println!("  Merged into existing: {}", summary.merged);
    println!("  Still pending:        {}", engine.pending(&store, &log).len());
    print_rule();
    println!("Bibliography now has {} references ({})", store.len(), bib_path.display());

    if summary.fetch_errors > 0 {
        std::process::exit(2);
    }
    Ok(())
}

fn run_status(cfg: &Config, data_dir: &Path) -> Result<()> {
    let bib_path = data_dir.join("bibliography.json");
    let log_path = data_dir.join("harvest_log.json");
    let store = Store::load(&bib_path, cfg.dedup_threshold)?;
    let log = HarvestLog::load(&log_path)?;
    let client = CrossRefClient::new(cfg);
    let engine = Engine::new(&client, cfg);

    let count_status = |status: HarvestStatus| {
        log.entries.values().filter(|e| e.status == status).count()
    };

    print_rule();
    println!("Pipeline Status");
    print_rule();
    println!("  Total references:  {}", store.len());
    println!("  With DOI:          {}", store.count_with_doi());
    for depth in 1..=3 {
        let n = store.find_by_depth(depth).len();
        if n > 0 {
            println!("  At depth {depth}:        {n}");
        }
    }
    println!("  Expansion pending: {}", engine.pending(&store, &log).len());
    println!("  Expansion done:    {}", log.len());
    println!("    success:             {}", count_status(HarvestStatus::Success));
    println!("    no-references-found: {}", count_status(HarvestStatus::NoReferencesFound));
    println!("    fetch-error:         {}", count_status(HarvestStatus::FetchError));
    print_rule();
    Ok(())
}

fn run_verify(cfg: &Config, bib_path: &Path, limit: usize) -> Result<()> {
    let mut store = Store::load(bib_path, cfg.dedup_threshold)?;
    let client = CrossRefClient::new(cfg);

    let (summary, issues) = verify::verify_all(&mut store, &client, limit, false);

    print_rule();
    println!("DOI Verification Report");
    print_rule();
    println!("  Verified:   {}", summary.ok);
    println!("  Mismatch:   {}", summary.mismatch);
    println!("  Retracted:  {}", summary.retracted);
    println!("  Not found:  {}", summary.not_found);
    println!("  Errors:     {}", summary.errors);
    print_rule();

    if !issues.is_empty() {
        println!("\nIssues found:");
        for issue in &issues {
            println!("  {}: {}", issue.cite_key, issue.details);
        }
    }

    // Persist retraction flags set during verification.
    store.save(bib_path)?;
    let report_path = sibling(bib_path, "verification_report.json");
    verify::write_report(&summary, &issues, &report_path)?;
    println!("\nReport saved to {}", report_path.display());

    if summary.errors > 0 {
        std::process::exit(2);
    }
    Ok(())
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    path.parent().unwrap_or_else(|| Path::new(".")).join(name)
}

fn print_rule() {
    println!("{}", "=".repeat(60));
}
