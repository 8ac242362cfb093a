pub mod catalog;
pub mod classify;
pub mod filter;
pub mod sanitize;

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use crate::error::ParseError;
use catalog::PatternCatalog;
use classify::{visible_len, Classifier};
use sanitize::{content_root, ratio, sanitize, RemovedElement, SanitizationResult};

static IMG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef {
    pub src: String,
    pub alt: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanMetrics {
    pub original_len: usize,
    /// Visible length after element removal, before the text filter.
    pub sanitized_len: usize,
    pub final_len: usize,
    pub removed_elements: usize,
    pub protected: usize,
    pub spans_removed: usize,
    pub pruned: usize,
}

impl CleanMetrics {
    pub fn preservation_ratio(&self) -> f64 {
        ratio(self.final_len, self.original_len)
    }
}

#[derive(Debug, Clone)]
pub struct CleanedArticle {
    pub html: String,
    pub images: Vec<ImageRef>,
    pub metrics: CleanMetrics,
    pub removed: Vec<RemovedElement>,
}

/// Four passes: parse → element removal → promotional text filter → empty
/// container pruning. The document never outlives this call.
pub fn clean_article(
    raw: &str,
    catalog: &PatternCatalog,
    max_bytes: usize,
) -> Result<CleanedArticle, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    if raw.len() > max_bytes {
        return Err(ParseError::Oversized {
            bytes: raw.len(),
            limit: max_bytes,
        });
    }

    let classifier = Classifier::new(catalog);
    let SanitizationResult {
        mut document,
        metrics,
    } = sanitize(Html::parse_document(raw), &classifier);

    if metrics.original_len == 0 {
        return Err(ParseError::NoVisibleText);
    }

    let spans_removed = filter::filter_document(&mut document, catalog.promotional_text_patterns());
    let pruned = filter::prune_empty(&mut document, &classifier);

    let root = content_root(&document);
    let final_len = visible_len(root);

    Ok(CleanedArticle {
        html: root.inner_html().trim().to_string(),
        images: collect_images(root),
        metrics: CleanMetrics {
            original_len: metrics.original_len,
            sanitized_len: metrics.final_len,
            final_len,
            removed_elements: metrics.removed_count(),
            protected: metrics.protected,
            spans_removed,
            pruned,
        },
        removed: metrics.removed,
    })
}

/// Plain visible length of an HTML string, measured the way cleaning does.
pub fn measure(raw: &str) -> usize {
    visible_len(content_root(&Html::parse_document(raw)))
}

fn collect_images(root: ElementRef) -> Vec<ImageRef> {
    let mut images: Vec<ImageRef> = Vec::new();
    for img in root.select(&IMG) {
        let value = img.value();
        let Some(src) = value.attr("src").or_else(|| value.attr("data-src")) else {
            continue;
        };
        let src = src.trim();
        if !(src.starts_with("http://") || src.starts_with("https://")) {
            continue;
        }
        if images.iter().any(|i| i.src == src) {
            continue;
        }
        images.push(ImageRef {
            src: src.to_string(),
            alt: value.attr("alt").map(str::to_string).filter(|a| !a.is_empty()),
        });
    }
    images
}
