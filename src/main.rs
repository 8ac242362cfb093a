use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, warn};

use sportswire::cleaner::{self, catalog::PatternCatalog};
use sportswire::config::AppConfig;
use sportswire::error::ConfigError;
use sportswire::pipeline::{ArticleOutcome, Pipeline};
use sportswire::publish::{DryRun, Publisher, WordPress};
use sportswire::store;

#[derive(Parser)]
#[command(
    name = "sportswire",
    about = "Sports news aggregator: strips ads from feed articles and republishes them"
)]
struct Cli {
    /// Configuration file (default: ./sportswire.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll feeds, clean new articles and publish them
    Run {
        /// Max articles per feed (default: settings.articles_per_feed)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Clean and log, but publish nothing and write nothing to the database
        #[arg(long)]
        dry_run: bool,
    },
    /// Clean one HTML file and report what was removed
    Clean {
        file: PathBuf,
        /// Print the cleaned HTML
        #[arg(long)]
        html: bool,
    },
    /// List articles held back for removing too much text
    Flagged {
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Publish a flagged article as stored
    Approve {
        /// Article key, as shown by `flagged`
        key: String,
    },
    /// Show publishing statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let cfg = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let catalog = PatternCatalog::from_config(&cfg.catalog).context("compiling pattern catalog")?;
    debug!(
        selectors = catalog.structural_ad_selectors().len(),
        patterns = catalog.promotional_text_patterns().len(),
        terms = catalog.content_indicator_terms().len(),
        "pattern catalog loaded"
    );

    let result = match cli.command {
        Commands::Run { limit, dry_run } => run(&cfg, &catalog, limit, dry_run).await,
        Commands::Clean { file, html } => clean_file(&cfg, &catalog, &file, html),
        Commands::Flagged { limit } => {
            let conn = store::connect(Path::new(&cfg.settings.db_path))?;
            store::init_schema(&conn)?;
            let rows = store::flagged(&conn, limit)?;
            if rows.is_empty() {
                println!("No flagged articles.");
                return Ok(());
            }

            println!(
                "{:<16} | {:>5} | {:>11} | {:<14} | {:<40}",
                "Key", "Ratio", "Kept", "Source", "Title"
            );
            println!("{}", "-".repeat(100));
            for r in &rows {
                println!(
                    "{:<16} | {:>5.2} | {:>11} | {:<14} | {:<40}",
                    &r.key[..16],
                    r.ratio,
                    format!("{}/{}", r.final_len, r.original_len),
                    truncate(&r.source, 14),
                    truncate(&r.title, 40),
                );
            }
            println!("\n{} flagged | approve with: sportswire approve <key>", rows.len());
            Ok(())
        }
        Commands::Approve { key } => approve(&cfg, &catalog, &key).await,
        Commands::Stats => {
            let conn = store::connect(Path::new(&cfg.settings.db_path))?;
            store::init_schema(&conn)?;
            let s = store::stats(&conn)?;
            println!("Published: {}", s.published);
            println!("Flagged:   {}", s.flagged);
            println!("Pending:   {}", s.pending);
            println!("Runs:      {}", s.runs);
            if let Some(mean) = s.mean_ratio {
                println!("Mean preservation ratio: {:.2}", mean);
            }
            if let Some(last) = s.last_run {
                println!(
                    "Last run:  {} ({} published, {} flagged, {} deferred{})",
                    last.finished_at,
                    last.published,
                    last.flagged,
                    last.deferred,
                    last.ratio_mean
                        .map(|m| format!(", mean ratio {:.2}", m))
                        .unwrap_or_default(),
                );
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn publisher(cfg: &AppConfig, dry_run: bool) -> anyhow::Result<Box<dyn Publisher>> {
    if dry_run {
        return Ok(Box::new(DryRun));
    }
    let wp = cfg.wordpress.as_ref().ok_or(ConfigError::MissingWordPress)?;
    let wp = WordPress::new(wp, cfg.settings.publish_timeout(), &cfg.settings.user_agent)
        .context("building WordPress client")?;
    Ok(Box::new(wp))
}

async fn run(
    cfg: &AppConfig,
    catalog: &PatternCatalog,
    limit: Option<usize>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let feeds: Vec<_> = cfg.enabled_feeds().cloned().collect();
    if feeds.is_empty() {
        println!("No feeds configured. Add [[feeds]] entries to sportswire.toml.");
        return Ok(());
    }

    let conn = store::connect(Path::new(&cfg.settings.db_path))?;
    store::init_schema(&conn)?;
    let publisher = publisher(cfg, dry_run)?;
    let client = reqwest::Client::builder()
        .timeout(cfg.settings.feed_timeout())
        .user_agent(&cfg.settings.user_agent)
        .build()?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Stop requested, finishing the current article");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let mut pipeline = Pipeline::new(
        &conn,
        catalog,
        publisher.as_ref(),
        cfg.thresholds,
        cfg.settings.clone(),
    )
    .with_stop_flag(stop)
    .dry_run(dry_run);

    println!(
        "Processing {} feeds{}...",
        feeds.len(),
        if dry_run { " (dry run)" } else { "" }
    );
    pipeline.run(&client, &feeds, limit).await?;

    let report = pipeline.into_report();
    if !dry_run {
        store::save_run(&conn, &report)?;
    }
    report.print();
    Ok(())
}

fn clean_file(
    cfg: &AppConfig,
    catalog: &PatternCatalog,
    file: &Path,
    print_html: bool,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let cleaned = cleaner::clean_article(&raw, catalog, cfg.settings.max_body_bytes)
        .with_context(|| format!("cleaning {}", file.display()))?;

    let m = &cleaned.metrics;
    let ratio = m.preservation_ratio();
    let verdict = if ratio < cfg.thresholds.min_preservation {
        "below floor, would be flagged"
    } else if ratio > cfg.thresholds.max_preservation {
        "light cleaning"
    } else {
        "ok"
    };

    println!("Visible chars: {} -> {} -> {}", m.original_len, m.sanitized_len, m.final_len);
    println!("Preservation ratio: {:.2} ({})", ratio, verdict);
    println!(
        "Removed {} elements, {} promotional spans, {} empty containers ({} kept by protection)",
        m.removed_elements, m.spans_removed, m.pruned, m.protected
    );
    for r in &cleaned.removed {
        let mut sel = r.tag.clone();
        if let Some(id) = &r.id {
            sel.push_str(&format!("#{}", id));
        }
        for c in &r.classes {
            sel.push_str(&format!(".{}", c));
        }
        println!("  - {:<40} {:?}, {} chars", truncate(&sel, 40), r.rule, r.visible_len);
    }
    if !cleaned.images.is_empty() {
        println!("Images:");
        for img in &cleaned.images {
            match &img.alt {
                Some(alt) => println!("  - {} ({})", img.src, truncate(alt, 40)),
                None => println!("  - {}", img.src),
            }
        }
    }
    if print_html {
        println!("\n{}", cleaned.html);
    }
    Ok(())
}

async fn approve(cfg: &AppConfig, catalog: &PatternCatalog, key: &str) -> anyhow::Result<()> {
    let conn = store::connect(Path::new(&cfg.settings.db_path))?;
    store::init_schema(&conn)?;

    let matches = store::find_flagged(&conn, key)?;
    let full_key = match matches.as_slice() {
        [one] => one.clone(),
        [] => anyhow::bail!("no flagged article with key {}", key),
        _ => anyhow::bail!("key prefix {} is ambiguous ({} matches)", key, matches.len()),
    };
    let row = store::take_flagged(&conn, &full_key)?
        .with_context(|| format!("flagged article {} disappeared", full_key))?;
    let title = row.title.clone();

    let publisher = publisher(cfg, false)?;
    let mut pipeline = Pipeline::new(
        &conn,
        catalog,
        publisher.as_ref(),
        cfg.thresholds,
        cfg.settings.clone(),
    );
    match pipeline.approve(row).await? {
        ArticleOutcome::Published(receipt) => {
            println!(
                "Published {}{}",
                title,
                receipt.link.map(|l| format!(" at {}", l)).unwrap_or_default()
            );
        }
        ArticleOutcome::Deferred(e) => {
            println!("Publish failed ({}); queued for the next run.", e);
        }
        other => println!("{:?}", other),
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
