use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use url::Url;

use crate::pipeline::RunReport;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating database directory {}", dir.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("opening database {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS published (
            key          TEXT PRIMARY KEY,
            url          TEXT NOT NULL,
            title        TEXT NOT NULL,
            source       TEXT NOT NULL,
            post_id      INTEGER,
            published_at TEXT NOT NULL
        );

        -- Held back for review: too much text was removed
        CREATE TABLE IF NOT EXISTS flagged (
            key            TEXT PRIMARY KEY,
            url            TEXT NOT NULL,
            title          TEXT NOT NULL,
            source         TEXT NOT NULL,
            ratio          REAL NOT NULL,
            original_len   INTEGER NOT NULL,
            final_len      INTEGER NOT NULL,
            cleaned_html   TEXT NOT NULL,
            featured_image TEXT,
            flagged_at     TEXT NOT NULL
        );

        -- Publish deferred to a later run; cleaned output is cached
        CREATE TABLE IF NOT EXISTS pending (
            key            TEXT PRIMARY KEY,
            url            TEXT NOT NULL,
            title          TEXT NOT NULL,
            source         TEXT NOT NULL,
            cleaned_html   TEXT NOT NULL,
            featured_image TEXT,
            ratio          REAL NOT NULL,
            attempts       INTEGER NOT NULL DEFAULT 1,
            last_error     TEXT,
            updated_at     TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            run_id         INTEGER PRIMARY KEY,
            started_at     TEXT NOT NULL,
            finished_at    TEXT NOT NULL,
            feeds          INTEGER NOT NULL,
            feeds_failed   INTEGER NOT NULL,
            seen           INTEGER NOT NULL,
            published      INTEGER NOT NULL,
            duplicates     INTEGER NOT NULL,
            skipped        INTEGER NOT NULL,
            flagged        INTEGER NOT NULL,
            deferred       INTEGER NOT NULL,
            failed         INTEGER NOT NULL,
            light_cleaning INTEGER NOT NULL,
            ratio_min      REAL,
            ratio_mean     REAL,
            ratio_max      REAL,
            stopped        BOOLEAN NOT NULL DEFAULT 0
        );
        ",
    )?;
    Ok(())
}

// ── Keys ──

/// Lowercased scheme and host, no fragment, no `utm_*` parameters, no
/// trailing slash. `None` for anything that is not an http(s) URL.
pub fn canonical_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);

    let mut out = url.to_string();
    if url.query().is_none() && out.ends_with('/') {
        out.pop();
    }
    Some(out)
}

/// Dedup key: hex SHA-256 of the canonical URL.
pub fn article_key(raw_url: &str) -> Option<String> {
    let canonical = canonical_url(raw_url)?;
    Some(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

// ── Published ──

pub struct PublishedRow {
    pub key: String,
    pub url: String,
    pub title: String,
    pub source: String,
    pub post_id: Option<i64>,
}

pub fn has(conn: &Connection, key: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM published WHERE key = ?1", [key], |r| r.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Mark an article published. Clears any flagged entry for it.
pub fn record(conn: &Connection, row: &PublishedRow) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT OR IGNORE INTO published (key, url, title, source, post_id, published_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            row.key,
            row.url,
            row.title,
            row.source,
            row.post_id,
            Utc::now().to_rfc3339()
        ],
    )?;
    tx.execute("DELETE FROM flagged WHERE key = ?1", [&row.key])?;
    tx.commit()?;
    Ok(())
}

// ── Flagged ──

#[derive(Debug, Clone)]
pub struct FlaggedRow {
    pub key: String,
    pub url: String,
    pub title: String,
    pub source: String,
    pub ratio: f64,
    pub original_len: usize,
    pub final_len: usize,
    pub cleaned_html: String,
    pub featured_image: Option<String>,
    pub flagged_at: String,
}

pub fn flag(conn: &Connection, row: &FlaggedRow) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO flagged
         (key, url, title, source, ratio, original_len, final_len, cleaned_html, featured_image, flagged_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            row.key,
            row.url,
            row.title,
            row.source,
            row.ratio,
            row.original_len as i64,
            row.final_len as i64,
            row.cleaned_html,
            row.featured_image,
            row.flagged_at,
        ],
    )?;
    Ok(())
}

pub fn is_flagged(conn: &Connection, key: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM flagged WHERE key = ?1", [key], |r| r.get(0))
        .optional()?;
    Ok(found.is_some())
}

const FLAGGED_COLUMNS: &str = "key, url, title, source, ratio, original_len, final_len, cleaned_html, featured_image, flagged_at";

fn flagged_from_row(row: &rusqlite::Row) -> rusqlite::Result<FlaggedRow> {
    Ok(FlaggedRow {
        key: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        source: row.get(3)?,
        ratio: row.get(4)?,
        original_len: row.get(5)?,
        final_len: row.get(6)?,
        cleaned_html: row.get(7)?,
        featured_image: row.get(8)?,
        flagged_at: row.get(9)?,
    })
}

/// Most recently flagged first.
pub fn flagged(conn: &Connection, limit: usize) -> Result<Vec<FlaggedRow>> {
    let sql = format!(
        "SELECT {} FROM flagged ORDER BY flagged_at DESC, key LIMIT ?1",
        FLAGGED_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([limit as i64], flagged_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Full keys of flagged entries starting with `prefix`.
pub fn find_flagged(conn: &Connection, prefix: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT key FROM flagged WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
    )?;
    let keys = stmt
        .query_map([prefix], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
}

/// Remove a flagged entry and return it, for operator approval.
pub fn take_flagged(conn: &Connection, key: &str) -> Result<Option<FlaggedRow>> {
    let tx = conn.unchecked_transaction()?;
    let sql = format!("SELECT {} FROM flagged WHERE key = ?1", FLAGGED_COLUMNS);
    let row = tx.query_row(&sql, [key], flagged_from_row).optional()?;
    if row.is_some() {
        tx.execute("DELETE FROM flagged WHERE key = ?1", [key])?;
    }
    tx.commit()?;
    Ok(row)
}

// ── Pending ──

#[derive(Debug, Clone)]
pub struct PendingRow {
    pub key: String,
    pub url: String,
    pub title: String,
    pub source: String,
    pub cleaned_html: String,
    pub featured_image: Option<String>,
    pub ratio: f64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Cache an article whose publish failed. Re-deferring bumps `attempts`.
pub fn defer(conn: &Connection, row: &PendingRow) -> Result<()> {
    conn.execute(
        "INSERT INTO pending
         (key, url, title, source, cleaned_html, featured_image, ratio, attempts, last_error, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9)
         ON CONFLICT(key) DO UPDATE SET
             attempts = attempts + 1,
             last_error = excluded.last_error,
             updated_at = excluded.updated_at",
        rusqlite::params![
            row.key,
            row.url,
            row.title,
            row.source,
            row.cleaned_html,
            row.featured_image,
            row.ratio,
            row.last_error,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

const PENDING_COLUMNS: &str =
    "key, url, title, source, cleaned_html, featured_image, ratio, attempts, last_error";

fn pending_from_row(row: &rusqlite::Row) -> rusqlite::Result<PendingRow> {
    Ok(PendingRow {
        key: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        source: row.get(3)?,
        cleaned_html: row.get(4)?,
        featured_image: row.get(5)?,
        ratio: row.get(6)?,
        attempts: row.get(7)?,
        last_error: row.get(8)?,
    })
}

/// Oldest first.
pub fn pending(conn: &Connection) -> Result<Vec<PendingRow>> {
    let sql = format!("SELECT {} FROM pending ORDER BY updated_at, key", PENDING_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], pending_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn pending_for(conn: &Connection, key: &str) -> Result<Option<PendingRow>> {
    let sql = format!("SELECT {} FROM pending WHERE key = ?1", PENDING_COLUMNS);
    Ok(conn.query_row(&sql, [key], pending_from_row).optional()?)
}

pub fn clear_pending(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM pending WHERE key = ?1", [key])?;
    Ok(())
}

// ── Runs ──

pub fn save_run(conn: &Connection, report: &RunReport) -> Result<i64> {
    conn.execute(
        "INSERT INTO runs (started_at, finished_at, feeds, feeds_failed, seen, published,
                           duplicates, skipped, flagged, deferred, failed, light_cleaning,
                           ratio_min, ratio_mean, ratio_max, stopped)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        rusqlite::params![
            report.started_at.to_rfc3339(),
            Utc::now().to_rfc3339(),
            report.feeds as i64,
            report.feeds_failed as i64,
            report.seen as i64,
            report.published as i64,
            report.duplicates as i64,
            report.skipped as i64,
            report.flagged as i64,
            report.deferred as i64,
            report.failed as i64,
            report.light_cleaning as i64,
            report.ratio_min(),
            report.ratio_mean(),
            report.ratio_max(),
            report.stopped,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

// ── Stats ──

pub struct LastRun {
    pub finished_at: String,
    pub published: usize,
    pub flagged: usize,
    pub deferred: usize,
    pub ratio_mean: Option<f64>,
}

pub struct Stats {
    pub published: usize,
    pub flagged: usize,
    pub pending: usize,
    pub runs: usize,
    pub mean_ratio: Option<f64>,
    pub last_run: Option<LastRun>,
}

pub fn stats(conn: &Connection) -> Result<Stats> {
    let published: usize = conn.query_row("SELECT COUNT(*) FROM published", [], |r| r.get(0))?;
    let flagged: usize = conn.query_row("SELECT COUNT(*) FROM flagged", [], |r| r.get(0))?;
    let pending: usize = conn.query_row("SELECT COUNT(*) FROM pending", [], |r| r.get(0))?;
    let runs: usize = conn.query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))?;
    let mean_ratio: Option<f64> =
        conn.query_row("SELECT AVG(ratio_mean) FROM runs", [], |r| r.get(0))?;
    let last_run = conn
        .query_row(
            "SELECT finished_at, published, flagged, deferred, ratio_mean
             FROM runs ORDER BY run_id DESC LIMIT 1",
            [],
            |r| {
                Ok(LastRun {
                    finished_at: r.get(0)?,
                    published: r.get(1)?,
                    flagged: r.get(2)?,
                    deferred: r.get(3)?,
                    ratio_mean: r.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(Stats {
        published,
        flagged,
        pending,
        runs,
        mean_ratio,
        last_run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_row(key: &str, err: &str) -> PendingRow {
        PendingRow {
            key: key.into(),
            url: format!("https://news.example.com/{}", key),
            title: "Derby report".into(),
            source: "Desk".into(),
            cleaned_html: "<p>The derby ended level.</p>".into(),
            featured_image: None,
            ratio: 0.82,
            attempts: 0,
            last_error: Some(err.into()),
        }
    }

    #[test]
    fn canonical_urls() {
        assert_eq!(
            canonical_url("HTTPS://News.Example.COM/story/?utm_source=rss&id=7#comments").as_deref(),
            Some("https://news.example.com/story?id=7")
        );
        assert_eq!(
            canonical_url("https://news.example.com/").as_deref(),
            Some("https://news.example.com")
        );
        assert_eq!(
            canonical_url("https://news.example.com/a/b///?utm_medium=x").as_deref(),
            Some("https://news.example.com/a/b")
        );
        assert_eq!(canonical_url(""), None);
        assert_eq!(canonical_url("mailto:desk@example.com"), None);
        assert_eq!(canonical_url("not a url"), None);
    }

    #[test]
    fn keys_agree_across_url_variants() {
        let a = article_key("https://news.example.com/final").unwrap();
        let b = article_key("https://NEWS.example.com/final/?utm_campaign=feed#top").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, article_key("https://news.example.com/semi-final").unwrap());
    }

    #[test]
    fn record_and_has() {
        let conn = open_in_memory().unwrap();
        assert!(!has(&conn, "k1").unwrap());
        defer(&conn, &pending_row("k1", "timeout")).unwrap();
        record(
            &conn,
            &PublishedRow {
                key: "k1".into(),
                url: "https://news.example.com/k1".into(),
                title: "Derby report".into(),
                source: "Desk".into(),
                post_id: Some(42),
            },
        )
        .unwrap();
        assert!(has(&conn, "k1").unwrap());
        assert!(!has(&conn, "k2").unwrap());
    }

    #[test]
    fn defer_bumps_attempts() {
        let conn = open_in_memory().unwrap();
        defer(&conn, &pending_row("k1", "HTTP 502")).unwrap();
        defer(&conn, &pending_row("k1", "HTTP 503")).unwrap();
        defer(&conn, &pending_row("k2", "timeout")).unwrap();

        let row = pending_for(&conn, "k1").unwrap().unwrap();
        assert_eq!(row.attempts, 2);
        assert_eq!(row.last_error.as_deref(), Some("HTTP 503"));
        assert_eq!(pending(&conn).unwrap().len(), 2);

        clear_pending(&conn, "k1").unwrap();
        assert!(pending_for(&conn, "k1").unwrap().is_none());
    }

    #[test]
    fn flag_and_take() {
        let conn = open_in_memory().unwrap();
        let row = FlaggedRow {
            key: "k9".into(),
            url: "https://news.example.com/k9".into(),
            title: "Gallery".into(),
            source: "Desk".into(),
            ratio: 0.45,
            original_len: 100,
            final_len: 45,
            cleaned_html: "<p>bbbb</p>".into(),
            featured_image: None,
            flagged_at: Utc::now().to_rfc3339(),
        };
        flag(&conn, &row).unwrap();
        assert!(is_flagged(&conn, "k9").unwrap());
        assert_eq!(flagged(&conn, 10).unwrap().len(), 1);
        assert_eq!(find_flagged(&conn, "k").unwrap(), ["k9"]);
        assert!(find_flagged(&conn, "x").unwrap().is_empty());
        // Prefixes are literal: no LIKE wildcards.
        assert!(find_flagged(&conn, "%").unwrap().is_empty());
        assert!(find_flagged(&conn, "_9").unwrap().is_empty());

        let taken = take_flagged(&conn, "k9").unwrap().unwrap();
        assert_eq!(taken.final_len, 45);
        assert!(take_flagged(&conn, "k9").unwrap().is_none());
        assert!(!is_flagged(&conn, "k9").unwrap());
    }

    #[test]
    fn runs_feed_stats() {
        let conn = open_in_memory().unwrap();
        let mut report = RunReport::new();
        report.published = 3;
        report.record_ratio(0.8);
        report.record_ratio(0.9);
        save_run(&conn, &report).unwrap();

        let s = stats(&conn).unwrap();
        assert_eq!(s.runs, 1);
        let last = s.last_run.unwrap();
        assert_eq!(last.published, 3);
        assert!((last.ratio_mean.unwrap() - 0.85).abs() < 1e-9);
    }
}
