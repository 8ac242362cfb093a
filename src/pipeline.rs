use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::cleaner::catalog::PatternCatalog;
use crate::cleaner::{clean_article, CleanedArticle};
use crate::config::{FeedConfig, Settings, Thresholds};
use crate::error::{OverRemovalWarning, ParseError, PublishError};
use crate::feeds::{self, ArticleRecord};
use crate::publish::{build_post, Post, PublishReceipt, Publisher};
use crate::store::{self, FlaggedRow, PendingRow, PublishedRow};

const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Already published, or already handled earlier in this run.
    Duplicate,
    MissingUrl,
    /// Flagged in an earlier run and waiting for an operator.
    AwaitingReview,
    /// The run was stopped before the article was reached.
    Stopped,
}

#[derive(Debug)]
pub enum ArticleOutcome {
    Published(PublishReceipt),
    Skipped(SkipReason),
    Flagged(OverRemovalWarning),
    Deferred(PublishError),
    Failed(ParseError),
}

/// Per-run counters, printed at the end and saved to the `runs` table.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub feeds: usize,
    pub feeds_failed: usize,
    pub seen: usize,
    pub pending_retried: usize,
    pub published: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub flagged: usize,
    pub deferred: usize,
    pub failed: usize,
    /// Published with a ratio above the upper bound: little or nothing removed.
    pub light_cleaning: usize,
    pub stopped: bool,
    ratios: Vec<f64>,
}

impl RunReport {
    pub fn new() -> Self {
        RunReport {
            started_at: Utc::now(),
            feeds: 0,
            feeds_failed: 0,
            seen: 0,
            pending_retried: 0,
            published: 0,
            duplicates: 0,
            skipped: 0,
            flagged: 0,
            deferred: 0,
            failed: 0,
            light_cleaning: 0,
            stopped: false,
            ratios: Vec::new(),
        }
    }

    pub fn record_ratio(&mut self, ratio: f64) {
        self.ratios.push(ratio);
    }

    pub fn ratio_min(&self) -> Option<f64> {
        self.ratios.iter().copied().reduce(f64::min)
    }

    pub fn ratio_max(&self) -> Option<f64> {
        self.ratios.iter().copied().reduce(f64::max)
    }

    pub fn ratio_mean(&self) -> Option<f64> {
        if self.ratios.is_empty() {
            None
        } else {
            Some(self.ratios.iter().sum::<f64>() / self.ratios.len() as f64)
        }
    }

    fn tally(&mut self, outcome: &ArticleOutcome) {
        match outcome {
            ArticleOutcome::Published(_) => self.published += 1,
            ArticleOutcome::Skipped(SkipReason::Duplicate) => self.duplicates += 1,
            ArticleOutcome::Skipped(_) => self.skipped += 1,
            ArticleOutcome::Flagged(_) => self.flagged += 1,
            ArticleOutcome::Deferred(_) => self.deferred += 1,
            ArticleOutcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn print(&self) {
        println!(
            "Feeds: {} ({} failed) | articles seen: {} | pending retried: {}",
            self.feeds, self.feeds_failed, self.seen, self.pending_retried
        );
        println!(
            "Published {}, duplicates {}, skipped {}, flagged {}, deferred {}, failed {}.",
            self.published, self.duplicates, self.skipped, self.flagged, self.deferred, self.failed,
        );
        match (self.ratio_min(), self.ratio_mean(), self.ratio_max()) {
            (Some(min), Some(mean), Some(max)) => println!(
                "Preservation ratio: min {:.2}, mean {:.2}, max {:.2} ({} lightly cleaned)",
                min, mean, max, self.light_cleaning
            ),
            _ => println!("Preservation ratio: no articles cleaned"),
        }
        if self.stopped {
            println!("Run stopped early; remaining articles left for the next run.");
        }
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

enum Precheck {
    Done(ArticleOutcome),
    Cached(PendingRow),
    Fresh(String),
}

enum Work {
    Cached(PendingRow),
    Fresh { key: String, record: ArticleRecord },
}

enum Ready {
    Cached(PendingRow),
    Fresh {
        key: String,
        record: ArticleRecord,
        cleaned: Result<CleanedArticle, ParseError>,
    },
}

pub struct Pipeline<'a> {
    conn: &'a Connection,
    catalog: &'a PatternCatalog,
    publisher: &'a dyn Publisher,
    thresholds: Thresholds,
    settings: Settings,
    stop: Arc<AtomicBool>,
    /// Store writes are skipped; dedup checks still read the store.
    dry_run: bool,
    /// Set by the first authentication failure; later publishes are deferred.
    auth_failed: Option<u16>,
    /// Keys handled this run, so a story listed twice is only processed once.
    attempted: HashSet<String>,
    report: RunReport,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        conn: &'a Connection,
        catalog: &'a PatternCatalog,
        publisher: &'a dyn Publisher,
        thresholds: Thresholds,
        settings: Settings,
    ) -> Self {
        Pipeline {
            conn,
            catalog,
            publisher,
            thresholds,
            settings,
            stop: Arc::new(AtomicBool::new(false)),
            dry_run: false,
            auth_failed: None,
            attempted: HashSet::new(),
            report: RunReport::new(),
        }
    }

    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn into_report(self) -> RunReport {
        self.report
    }

    fn stopped(&mut self) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            self.report.stopped = true;
        }
        self.report.stopped
    }

    /// Retry pending articles, then process every feed in order.
    /// A feed that fails to fetch or parse is skipped.
    pub async fn run(
        &mut self,
        client: &reqwest::Client,
        feeds: &[FeedConfig],
        limit: Option<usize>,
    ) -> Result<()> {
        self.drain_pending().await?;

        let per_feed = limit.unwrap_or(self.settings.articles_per_feed);
        for feed in feeds {
            if self.stopped() {
                break;
            }
            self.report.feeds += 1;
            let records = match feeds::fetch_feed(client, feed).await {
                Ok(records) => records,
                Err(e) => {
                    warn!("Skipping feed {}: {}", feed.name, e);
                    self.report.feeds_failed += 1;
                    continue;
                }
            };
            let records: Vec<_> = records.into_iter().take(per_feed).collect();
            self.process_batch(records, Some(client)).await?;
        }
        Ok(())
    }

    /// Publish articles deferred by earlier runs from their cached output.
    pub async fn drain_pending(&mut self) -> Result<()> {
        let rows = store::pending(self.conn)?;
        if rows.is_empty() {
            return Ok(());
        }
        info!("Retrying {} pending articles", rows.len());
        for row in rows {
            if self.stopped() {
                break;
            }
            if !self.attempted.insert(row.key.clone()) {
                continue;
            }
            self.report.pending_retried += 1;
            let outcome = self.publish_cached(row).await?;
            self.report.tally(&outcome);
        }
        Ok(())
    }

    /// Process one article end to end.
    pub async fn process_article(&mut self, record: ArticleRecord) -> Result<ArticleOutcome> {
        let mut outcomes = self.process_batch(vec![record], None).await?;
        Ok(outcomes
            .pop()
            .unwrap_or(ArticleOutcome::Skipped(SkipReason::Stopped)))
    }

    /// Dedup checks and store writes run in order on one connection; cleaning
    /// of the batch runs on rayon workers in between.
    pub async fn process_batch(
        &mut self,
        records: Vec<ArticleRecord>,
        client: Option<&reqwest::Client>,
    ) -> Result<Vec<ArticleOutcome>> {
        let mut outcomes = Vec::with_capacity(records.len());
        let mut work = Vec::new();

        for record in records {
            self.report.seen += 1;
            match self.precheck(&record)? {
                Precheck::Done(outcome) => {
                    debug!(url = %record.url, ?outcome, "skipped");
                    self.report.tally(&outcome);
                    outcomes.push(outcome);
                }
                Precheck::Cached(row) => work.push(Work::Cached(row)),
                Precheck::Fresh(key) => work.push(Work::Fresh { key, record }),
            }
        }

        if let Some(client) = client {
            for item in work.iter_mut() {
                if let Work::Fresh { record, .. } = item {
                    feeds::ensure_body(client, record, self.settings.min_body_chars).await;
                }
            }
        }

        let catalog = self.catalog;
        let max_bytes = self.settings.max_body_bytes;
        let ready: Vec<Ready> = work
            .into_par_iter()
            .map(|item| match item {
                Work::Fresh { key, record } => {
                    let cleaned = clean_article(&record.html, catalog, max_bytes);
                    Ready::Fresh { key, record, cleaned }
                }
                Work::Cached(row) => Ready::Cached(row),
            })
            .collect();

        let pb = ProgressBar::new(ready.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );

        for item in ready {
            if self.stopped() {
                break;
            }
            let outcome = match item {
                Ready::Fresh {
                    key,
                    record,
                    cleaned,
                } => {
                    pb.set_message(record.title.chars().take(40).collect::<String>());
                    self.finish(key, &record, cleaned).await?
                }
                Ready::Cached(row) => self.publish_cached(row).await?,
            };
            self.report.tally(&outcome);
            let published = matches!(outcome, ArticleOutcome::Published(_));
            outcomes.push(outcome);
            pb.inc(1);

            if published && self.settings.delay_between_posts_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.settings.delay_between_posts_ms)).await;
            }
        }

        pb.finish_and_clear();
        Ok(outcomes)
    }

    fn precheck(&mut self, record: &ArticleRecord) -> Result<Precheck> {
        let Some(key) = store::article_key(&record.url) else {
            return Ok(Precheck::Done(ArticleOutcome::Skipped(SkipReason::MissingUrl)));
        };
        if !self.attempted.insert(key.clone()) || store::has(self.conn, &key)? {
            return Ok(Precheck::Done(ArticleOutcome::Skipped(SkipReason::Duplicate)));
        }
        if store::is_flagged(self.conn, &key)? {
            return Ok(Precheck::Done(ArticleOutcome::Skipped(SkipReason::AwaitingReview)));
        }
        if let Some(row) = store::pending_for(self.conn, &key)? {
            return Ok(Precheck::Cached(row));
        }
        Ok(Precheck::Fresh(key))
    }

    async fn finish(
        &mut self,
        key: String,
        record: &ArticleRecord,
        cleaned: Result<CleanedArticle, ParseError>,
    ) -> Result<ArticleOutcome> {
        let cleaned = match cleaned {
            Ok(c) => c,
            Err(e) => {
                warn!(url = %record.url, "Skipping unparseable article: {}", e);
                return Ok(ArticleOutcome::Failed(e));
            }
        };

        let m = &cleaned.metrics;
        let ratio = m.preservation_ratio();
        self.report.record_ratio(ratio);
        debug!(
            url = %record.url,
            published = ?record.published_at,
            original = m.original_len,
            final_len = m.final_len,
            removed = m.removed_elements,
            protected = m.protected,
            spans = m.spans_removed,
            ratio,
            "cleaned"
        );

        let featured = record
            .image_url
            .clone()
            .or_else(|| cleaned.images.first().map(|i| i.src.clone()));

        if ratio < self.thresholds.min_preservation {
            let warning = OverRemovalWarning {
                ratio,
                floor: self.thresholds.min_preservation,
                original_len: m.original_len,
                final_len: m.final_len,
            };
            warn!(url = %record.url, "Flagged for review: {}", warning);
            if !self.dry_run {
                store::flag(
                    self.conn,
                    &FlaggedRow {
                        key,
                        url: record.url.clone(),
                        title: record.title.clone(),
                        source: record.source.clone(),
                        ratio,
                        original_len: m.original_len,
                        final_len: m.final_len,
                        cleaned_html: cleaned.html.clone(),
                        featured_image: featured,
                        flagged_at: Utc::now().to_rfc3339(),
                    },
                )?;
            }
            return Ok(ArticleOutcome::Flagged(warning));
        }

        if ratio > self.thresholds.max_preservation {
            self.report.light_cleaning += 1;
        }

        let pending = PendingRow {
            key,
            url: record.url.clone(),
            title: record.title.clone(),
            source: record.source.clone(),
            cleaned_html: cleaned.html,
            featured_image: featured,
            ratio,
            attempts: 0,
            last_error: None,
        };
        self.deliver(pending).await
    }

    /// Operator override: publish a flagged article from its stored output.
    /// A failed publish moves it to the pending queue.
    pub async fn approve(&mut self, row: FlaggedRow) -> Result<ArticleOutcome> {
        self.attempted.insert(row.key.clone());
        let outcome = self
            .deliver(PendingRow {
                key: row.key,
                url: row.url,
                title: row.title,
                source: row.source,
                cleaned_html: row.cleaned_html,
                featured_image: row.featured_image,
                ratio: row.ratio,
                attempts: 0,
                last_error: None,
            })
            .await?;
        self.report.tally(&outcome);
        Ok(outcome)
    }

    async fn publish_cached(&mut self, row: PendingRow) -> Result<ArticleOutcome> {
        debug!(url = %row.url, attempts = row.attempts, "publishing from cache");
        self.deliver(row).await
    }

    /// Publish; on success record the key, otherwise cache the cleaned output.
    async fn deliver(&mut self, mut row: PendingRow) -> Result<ArticleOutcome> {
        let post = build_post(
            &row.title,
            &row.cleaned_html,
            &row.url,
            &row.source,
            row.featured_image.clone(),
        );

        match self.publish_with_retry(&post).await {
            Ok(receipt) => {
                info!(post_id = ?receipt.post_id, media = ?receipt.featured_media, "Published: {}", post.title);
                if !self.dry_run {
                    store::record(
                        self.conn,
                        &PublishedRow {
                            key: row.key.clone(),
                            url: row.url,
                            title: post.title,
                            source: row.source,
                            post_id: receipt.post_id,
                        },
                    )?;
                    store::clear_pending(self.conn, &row.key)?;
                }
                Ok(ArticleOutcome::Published(receipt))
            }
            Err(e) => {
                warn!("Deferred {}: {}", row.url, e);
                if !self.dry_run {
                    row.last_error = Some(e.to_string());
                    store::defer(self.conn, &row)?;
                }
                Ok(ArticleOutcome::Deferred(e))
            }
        }
    }

    async fn publish_with_retry(&mut self, post: &Post) -> Result<PublishReceipt, PublishError> {
        if let Some(status) = self.auth_failed {
            return Err(PublishError::Auth { status });
        }

        let max_retries = self.settings.max_retries;
        let mut attempt = 0;
        loop {
            let err = match self.publisher.publish(post).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => e,
            };
            if let PublishError::Auth { status } = err {
                warn!("Publisher rejected credentials (HTTP {}); publishing stopped for this run", status);
                self.auth_failed = Some(status);
                return Err(err);
            }
            if !err.is_retryable() || attempt == max_retries {
                return Err(err);
            }

            let delay = backoff(self.settings.base_backoff_ms, attempt);
            warn!(
                "Publish failed for {} (attempt {}/{}): {}, backing off {:.1}s",
                post.source_url,
                attempt + 1,
                max_retries + 1,
                err,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// `base * 2^attempt`, capped at [`MAX_BACKOFF`].
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    2u64.checked_pow(attempt)
        .and_then(|factor| base_ms.checked_mul(factor))
        .map(Duration::from_millis)
        .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}
