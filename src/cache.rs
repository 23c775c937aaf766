use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

/// Sqlite cache of resolution lookups, so re-running the resolver does
/// not re-query the registry for references it already attempted.
/// Negative outcomes are cached too; transient failures never are.
pub struct LookupCache {
    conn: Connection,
}

/// A cached positive hit: DOI and the fuzzy score it was accepted at.
pub type CachedHit = Option<(String, f64)>;

impl LookupCache {
    pub fn open() -> Result<Self> {
        let cache_dir = dirs::cache_dir()
            .context("Could not determine cache directory")?
            .join("refharvest");
        std::fs::create_dir_all(&cache_dir)?;
        let conn = Connection::open(cache_dir.join("lookup_cache.db"))?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS lookup_cache (
                key TEXT PRIMARY KEY,
                doi TEXT,
                score REAL,
                created_at INTEGER NOT NULL
            )",
        )?;
        Ok(Self { conn })
    }

    /// None = not cached, Some(None) = negative hit, Some(Some(..)) =
    /// cached match.
    pub fn get(&self, key: &str) -> Result<Option<CachedHit>> {
        let mut stmt = self
            .conn
            .prepare("SELECT doi, score FROM lookup_cache WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => {
                let doi: Option<String> = row.get(0)?;
                let score: Option<f64> = row.get(1)?;
                Ok(Some(doi.map(|d| (d, score.unwrap_or(0.0)))))
            }
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &str, hit: Option<(&str, f64)>) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let (doi, score) = match hit {
            Some((doi, score)) => (Some(doi), Some(score)),
            None => (None, None),
        };
        self.conn.execute(
            "INSERT OR REPLACE INTO lookup_cache (key, doi, score, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, doi, score, now],
        )?;
        Ok(())
    }
}
