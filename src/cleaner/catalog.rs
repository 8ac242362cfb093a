use std::collections::HashSet;

use regex::{Regex, RegexBuilder};

use crate::config::CatalogConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectorKind {
    Class,
    Id,
    Tag,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructuralSelector {
    pub kind: SelectorKind,
    pub value: String,
}

impl StructuralSelector {
    /// Parse `.class`, `#id` or a bare tag name.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let (kind, value) = if let Some(v) = raw.strip_prefix('.') {
            (SelectorKind::Class, v)
        } else if let Some(v) = raw.strip_prefix('#') {
            (SelectorKind::Id, v)
        } else {
            (SelectorKind::Tag, raw)
        };

        let valid = !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ConfigError::InvalidSelector(raw.to_string()));
        }

        let value = match kind {
            SelectorKind::Tag => value.to_ascii_lowercase(),
            _ => value.to_string(),
        };
        Ok(StructuralSelector { kind, value })
    }
}

/// Immutable classification data: structural ad signatures, promotional text
/// patterns and the content-indicator vocabulary. Built once per run and
/// shared by reference.
#[derive(Debug, Clone)]
pub struct PatternCatalog {
    selectors: Vec<StructuralSelector>,
    ad_classes: HashSet<String>,
    ad_ids: HashSet<String>,
    ad_tags: HashSet<String>,
    patterns: Vec<Regex>,
    terms: Vec<String>,
    protected_tags: HashSet<String>,
    min_protected_len: usize,
}

impl PatternCatalog {
    pub fn from_config(cfg: &CatalogConfig) -> Result<Self, ConfigError> {
        let selectors = cfg
            .selectors
            .iter()
            .map(|s| StructuralSelector::parse(s))
            .collect::<Result<Vec<_>, _>>()?;

        let values_of = |kind: SelectorKind| -> HashSet<String> {
            selectors
                .iter()
                .filter(|s| s.kind == kind)
                .map(|s| s.value.clone())
                .collect()
        };
        let ad_classes = values_of(SelectorKind::Class);
        let ad_ids = values_of(SelectorKind::Id);
        let ad_tags = values_of(SelectorKind::Tag);

        let mut patterns = Vec::with_capacity(cfg.promotional_patterns.len());
        for p in &cfg.promotional_patterns {
            let re = RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|source| ConfigError::InvalidPattern {
                    pattern: p.clone(),
                    source,
                })?;
            // A pattern that can match nothing would never shrink the text.
            if re.is_match("") {
                return Err(ConfigError::EmptyMatchPattern(p.clone()));
            }
            patterns.push(re);
        }

        let mut terms: Vec<String> = cfg
            .content_terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        terms.sort();
        terms.dedup();

        Ok(PatternCatalog {
            selectors,
            ad_classes,
            ad_ids,
            ad_tags,
            patterns,
            terms,
            protected_tags: cfg
                .protected_tags
                .iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .collect(),
            min_protected_len: cfg.min_protected_len,
        })
    }

    pub fn structural_ad_selectors(&self) -> &[StructuralSelector] {
        &self.selectors
    }

    pub fn promotional_text_patterns(&self) -> &[Regex] {
        &self.patterns
    }

    pub fn content_indicator_terms(&self) -> &[String] {
        &self.terms
    }

    pub fn protected_tags(&self) -> &HashSet<String> {
        &self.protected_tags
    }

    pub fn min_protected_len(&self) -> usize {
        self.min_protected_len
    }

    pub fn is_ad_class(&self, class: &str) -> bool {
        self.ad_classes.contains(class)
    }

    pub fn is_ad_id(&self, id: &str) -> bool {
        self.ad_ids.contains(id)
    }

    pub fn is_ad_tag(&self, tag: &str) -> bool {
        self.ad_tags.contains(tag)
    }

    pub fn is_protected_tag(&self, tag: &str) -> bool {
        self.protected_tags.contains(tag)
    }

    pub fn is_promotional(&self, text: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(text))
    }

    /// True if `lowered` contains any indicator term, anywhere: "preseason"
    /// counts for "season".
    pub fn has_content_term(&self, lowered: &str) -> bool {
        self.terms.iter().any(|term| lowered.contains(term.as_str()))
    }
}
