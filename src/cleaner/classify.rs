use scraper::ElementRef;

use super::catalog::PatternCatalog;

/// Raw-text elements that carry nothing worth publishing.
pub const ALWAYS_REMOVE: &[&str] = &["script", "style", "iframe", "noscript"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ad,
    Content,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    AlwaysRemove,
    StructuralSelector,
    PromotionalText,
}

impl Rule {
    /// Precedence order. The first rule that matches decides the verdict.
    pub const ORDER: [Rule; 3] = [
        Rule::AlwaysRemove,
        Rule::StructuralSelector,
        Rule::PromotionalText,
    ];

    /// Whether the content-protection override can veto this rule.
    fn protectable(self) -> bool {
        !matches!(self, Rule::AlwaysRemove)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    pub rule: Option<Rule>,
    /// An ad rule matched but the element was kept as main content.
    pub protected: bool,
}

impl Classification {
    const NEUTRAL: Classification = Classification {
        verdict: Verdict::Neutral,
        rule: None,
        protected: false,
    };
}

pub struct Classifier<'c> {
    catalog: &'c PatternCatalog,
}

impl<'c> Classifier<'c> {
    pub fn new(catalog: &'c PatternCatalog) -> Self {
        Classifier { catalog }
    }

    pub fn classify(&self, el: ElementRef) -> Classification {
        for rule in Rule::ORDER {
            if !self.matches(rule, el) {
                continue;
            }
            if rule.protectable() && self.is_main_content(el) {
                return Classification {
                    verdict: Verdict::Content,
                    rule: Some(rule),
                    protected: true,
                };
            }
            return Classification {
                verdict: Verdict::Ad,
                rule: Some(rule),
                protected: false,
            };
        }
        Classification::NEUTRAL
    }

    /// Evaluate a single rule's predicate, ignoring precedence and protection.
    pub fn matches(&self, rule: Rule, el: ElementRef) -> bool {
        let value = el.value();
        match rule {
            Rule::AlwaysRemove => ALWAYS_REMOVE.contains(&value.name()),
            Rule::StructuralSelector => {
                self.catalog.is_ad_tag(value.name())
                    || value.classes().any(|c| self.catalog.is_ad_class(c))
                    || value.id().is_some_and(|id| self.catalog.is_ad_id(id))
            }
            Rule::PromotionalText => {
                let own = own_text(el);
                !own.trim().is_empty() && self.catalog.is_promotional(&own)
            }
        }
    }

    /// Content-protection check: indicator term in the visible text, a
    /// protected tag on the element or anywhere below it, or enough visible
    /// text to count as long-form prose.
    pub fn is_main_content(&self, el: ElementRef) -> bool {
        if self.catalog.is_protected_tag(el.value().name()) {
            return true;
        }

        let text = visible_text(el);
        if count_visible(&text) > self.catalog.min_protected_len() {
            return true;
        }
        if self.catalog.has_content_term(&text.to_lowercase()) {
            return true;
        }

        el.descendants()
            .skip(1)
            .filter_map(ElementRef::wrap)
            .any(|d| self.catalog.is_protected_tag(d.value().name()))
    }
}

/// Text of the element's direct text children only.
pub fn own_text(el: ElementRef) -> String {
    el.children()
        .filter_map(|n| n.value().as_text())
        .map(|t| &**t)
        .collect::<Vec<&str>>()
        .join(" ")
}

/// Own and descendant text, skipping the contents of raw-text elements.
pub fn visible_text(el: ElementRef) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in el.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element())
            .is_some_and(|p| ALWAYS_REMOVE.contains(&p.name()));
        if !hidden {
            parts.push(&**text);
        }
    }
    parts.join(" ")
}

pub fn visible_len(el: ElementRef) -> usize {
    count_visible(&visible_text(el))
}

/// Visible length is the number of non-whitespace characters, so markup
/// indentation never counts.
pub fn count_visible(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}
