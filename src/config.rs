use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_CONFIG_FILE: &str = "sportswire";
const ENV_PREFIX: &str = "SPORTSWIRE";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    pub wordpress: Option<WordPressConfig>,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct WordPressConfig {
    /// Site root, e.g. `https://example.com` (no `/wp-json` suffix).
    pub url: String,
    pub username: String,
    pub app_password: String,
    pub category_id: Option<u64>,
    #[serde(default = "default_post_status")]
    pub status: String,
}

fn default_post_status() -> String {
    "publish".to_string()
}

/// Raw catalog values. Compiled into a `PatternCatalog` at start-up.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// `.class`, `#id` or bare tag name.
    pub selectors: Vec<String>,
    pub promotional_patterns: Vec<String>,
    pub content_terms: Vec<String>,
    pub protected_tags: Vec<String>,
    /// Visible text longer than this protects an element from removal.
    pub min_protected_len: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        let selectors = [
            ".ad",
            ".ads",
            ".ad-banner",
            ".ad-container",
            ".advertisement",
            ".sponsored",
            ".sponsored-post",
            ".promo",
            ".promotion",
            ".newsletter-signup",
            ".newsletter-form",
            ".subscribe-form",
            ".social-share",
            ".social-sharing",
            ".share-buttons",
            "#ad",
            "#ads",
            "#advertisement",
            "#sponsored",
        ];
        let patterns = [
            r"sponsored\s+by\s+\w+[.!]?",
            r"\bbuy\s+now\b[!.]?",
            r"\bshop\s+now\b[!.]?",
            r"\bsign\s+up\s+now\b[!.]?",
            r"\bsubscribe\s+to\s+our\s+newsletter\b[!.]?",
            r"\bspecial\s+offer\b[!.]?",
            r"\blimited\s+time\s+(?:offer|only)\b[!.]?",
            r"\bwhile\s+supplies\s+last\b[!.]?",
            r"\bclick\s+here\s+to\s+\w+[!.]?",
            r"\b\d{1,3}%\s+off\b[!.]?",
        ];
        let terms = [
            "team",
            "player",
            "coach",
            "championship",
            "season",
            "league",
            "tournament",
            "match",
            "goal",
            "score",
            "stadium",
            "victory",
            "defeat",
            "playoff",
            "final",
            "game",
            "athlete",
            "injury",
            "transfer",
            "manager",
            "quarterback",
            "innings",
            "halftime",
            "referee",
            "fixture",
            "squad",
            "striker",
            "midfielder",
            "defender",
            "goalkeeper",
            "pitcher",
            "touchdown",
            "olympic",
        ];
        CatalogConfig {
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            promotional_patterns: patterns.iter().map(|s| s.to_string()).collect(),
            content_terms: terms.iter().map(|s| s.to_string()).collect(),
            protected_tags: ["article", "main", "h1", "h2"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_protected_len: 200,
        }
    }
}

/// Acceptable preservation-ratio band. Below `min_preservation` an article is
/// held for review; above `max_preservation` it is published but counted as
/// lightly cleaned.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub min_preservation: f64,
    pub max_preservation: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            min_preservation: 0.70,
            max_preservation: 0.90,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(self.min_preservation)
            || !in_range(self.max_preservation)
            || self.min_preservation > self.max_preservation
        {
            return Err(ConfigError::InvalidBounds {
                min: self.min_preservation,
                max: self.max_preservation,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: String,
    pub articles_per_feed: usize,
    pub delay_between_posts_ms: u64,
    pub feed_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    /// Feed bodies with less visible text than this trigger a full-page fetch.
    pub min_body_chars: usize,
    pub max_body_bytes: usize,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            db_path: "data/sportswire.sqlite".to_string(),
            articles_per_feed: 10,
            delay_between_posts_ms: 2000,
            feed_timeout_secs: 15,
            publish_timeout_secs: 30,
            max_retries: 3,
            base_backoff_ms: 2000,
            min_body_chars: 100,
            max_body_bytes: 2 * 1024 * 1024,
            user_agent: concat!("sportswire/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Upper bound on `max_retries`; past this the backoff alone spans hours.
pub const MAX_RETRIES_LIMIT: u32 = 10;

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::InvalidRetries {
                max_retries: self.max_retries,
                limit: MAX_RETRIES_LIMIT,
            });
        }
        Ok(())
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

impl AppConfig {
    /// Load from an optional file, then `SPORTSWIRE_*` environment variables
    /// (nested keys separated by `__`, e.g. `SPORTSWIRE_WORDPRESS__APP_PASSWORD`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;
        let cfg: AppConfig = settings.try_deserialize()?;
        cfg.thresholds.validate()?;
        cfg.settings.validate()?;
        Ok(cfg)
    }

    pub fn enabled_feeds(&self) -> impl Iterator<Item = &FeedConfig> {
        self.feeds.iter().filter(|f| f.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let t = Thresholds::default();
        assert!(t.validate().is_ok());
        assert_eq!(t.min_preservation, 0.70);

        let c = CatalogConfig::default();
        assert!(c.selectors.iter().any(|s| s == ".ad-container"));
        assert!(c.content_terms.iter().any(|s| s == "championship"));
        assert_eq!(c.min_protected_len, 200);
    }

    #[test]
    fn bounds_rejected() {
        let inverted = Thresholds {
            min_preservation: 0.9,
            max_preservation: 0.5,
        };
        assert!(matches!(
            inverted.validate(),
            Err(ConfigError::InvalidBounds { .. })
        ));
        let out_of_range = Thresholds {
            min_preservation: -0.1,
            max_preservation: 0.5,
        };
        assert!(out_of_range.validate().is_err());
    }

    #[test]
    fn retry_count_bounded() {
        assert!(Settings::default().validate().is_ok());
        let settings = Settings {
            max_retries: 60,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidRetries {
                max_retries: 60,
                limit: MAX_RETRIES_LIMIT
            })
        ));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let toml = r#"
            [[feeds]]
            name = "ESPN"
            url = "https://www.espn.com/espn/rss/news"

            [[feeds]]
            name = "Old"
            url = "https://example.com/rss"
            enabled = false

            [thresholds]
            min_preservation = 0.6

            [catalog]
            min_protected_len = 300
        "#;
        let cfg: AppConfig = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.feeds.len(), 2);
        assert_eq!(cfg.enabled_feeds().count(), 1);
        assert_eq!(cfg.thresholds.min_preservation, 0.6);
        assert_eq!(cfg.thresholds.max_preservation, 0.90);
        assert_eq!(cfg.catalog.min_protected_len, 300);
        assert!(!cfg.catalog.selectors.is_empty());
        assert_eq!(cfg.settings.max_retries, 3);
        assert!(cfg.wordpress.is_none());
    }
}
