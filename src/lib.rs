//! Sports news aggregator: pulls articles from RSS/Atom feeds, strips
//! advertising and promotional material from each body, and republishes the
//! cleaned article to WordPress.
//!
//! - `cleaner`: pattern catalog, element classifier, tree sanitizer and text filter
//! - `pipeline`: per-article dedup, cleaning, ratio checks and publishing with retry
//! - `feeds`: feed fetching and RSS/Atom parsing
//! - `store`: SQLite dedup, review and retry tables
//! - `publish`: the publisher trait and its WordPress and dry-run implementations

pub mod cleaner;
pub mod config;
pub mod error;
pub mod feeds;
pub mod pipeline;
pub mod publish;
pub mod store;
