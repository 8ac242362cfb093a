use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::classify::{visible_len, Classification, Classifier, Rule, Verdict};

static BODY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

/// An ad subtree root that was detached.
#[derive(Debug, Clone)]
pub struct RemovedElement {
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub rule: Option<Rule>,
    pub visible_len: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SanitizeMetrics {
    pub original_len: usize,
    pub final_len: usize,
    pub ad: usize,
    pub content: usize,
    pub neutral: usize,
    /// Elements an ad rule matched but the protection override kept.
    pub protected: usize,
    pub removed: Vec<RemovedElement>,
}

impl SanitizeMetrics {
    fn tally(&mut self, c: Classification) {
        match c.verdict {
            Verdict::Ad => self.ad += 1,
            Verdict::Content => self.content += 1,
            Verdict::Neutral => self.neutral += 1,
        }
        if c.protected {
            self.protected += 1;
        }
    }

    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    pub fn preservation_ratio(&self) -> f64 {
        ratio(self.final_len, self.original_len)
    }
}

pub struct SanitizationResult {
    pub document: Html,
    pub metrics: SanitizeMetrics,
}

impl SanitizationResult {
    pub fn preservation_ratio(&self) -> f64 {
        self.metrics.preservation_ratio()
    }
}

/// `final / original`, clamped to [0, 1]. An empty original loses nothing.
pub fn ratio(final_len: usize, original_len: usize) -> f64 {
    if original_len == 0 {
        return 1.0;
    }
    (final_len as f64 / original_len as f64).clamp(0.0, 1.0)
}

/// The element sanitization walks from: `<body>`, or the root element when the
/// document has none.
pub fn content_root(doc: &Html) -> ElementRef<'_> {
    doc.select(&BODY).next().unwrap_or_else(|| doc.root_element())
}

/// Two passes: classify the tree read-only, recording ad subtree roots without
/// descending into them, then detach the recorded roots.
pub fn sanitize(mut document: Html, classifier: &Classifier) -> SanitizationResult {
    let mut metrics = SanitizeMetrics::default();

    let ad_roots = {
        let root = content_root(&document);
        metrics.original_len = visible_len(root);

        let mut ad_roots = Vec::new();
        let mut stack: Vec<ElementRef> = children_of(root);
        stack.reverse();

        // Pre-order: children are pushed in reverse so the first child pops first.
        while let Some(el) = stack.pop() {
            let c = classifier.classify(el);
            metrics.tally(c);

            if c.verdict == Verdict::Ad {
                let removed = describe(el, c.rule);
                debug!(
                    tag = %removed.tag,
                    classes = ?removed.classes,
                    rule = ?removed.rule,
                    chars = removed.visible_len,
                    "removing ad element"
                );
                metrics.removed.push(removed);
                ad_roots.push(el.id());
                continue;
            }

            if c.protected {
                debug!(tag = el.value().name(), rule = ?c.rule, "ad rule overridden by content protection");
            }

            let mut children = children_of(el);
            children.reverse();
            stack.extend(children);
        }
        ad_roots
    };

    for id in ad_roots {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }

    metrics.final_len = visible_len(content_root(&document));
    debug!(
        ad = metrics.ad,
        content = metrics.content,
        neutral = metrics.neutral,
        protected = metrics.protected,
        ratio = metrics.preservation_ratio(),
        "sanitized"
    );

    SanitizationResult { document, metrics }
}

fn children_of(el: ElementRef) -> Vec<ElementRef> {
    el.children().filter_map(ElementRef::wrap).collect()
}

fn describe(el: ElementRef, rule: Option<Rule>) -> RemovedElement {
    let value = el.value();
    RemovedElement {
        tag: value.name().to_string(),
        id: value.id().map(str::to_string),
        classes: value.classes().map(str::to_string).collect(),
        rule,
        visible_len: visible_len(el),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::cleaner::catalog::PatternCatalog;
    use crate::config::CatalogConfig;

    fn catalog() -> PatternCatalog {
        PatternCatalog::from_config(&CatalogConfig::default()).unwrap()
    }

    fn run(html: &str) -> SanitizationResult {
        let cat = catalog();
        sanitize(Html::parse_document(html), &Classifier::new(&cat))
    }

    fn body_html(result: &SanitizationResult) -> String {
        content_root(&result.document).inner_html()
    }

    #[test]
    fn ad_container_removed_article_kept() {
        let html = r#"<div class="ad-container"><p>Sponsored by Acme</p></div><article><p>Breaking: Team wins championship 3-2 after a late goal from player Smith.</p></article>"#;
        let result = run(html);
        let out = body_html(&result);

        assert!(out.contains(
            "<article><p>Breaking: Team wins championship 3-2 after a late goal from player Smith.</p></article>"
        ));
        assert!(!out.contains("Sponsored"));
        assert!(!out.contains("ad-container"));
        assert_eq!(result.metrics.removed_count(), 1);
        assert_eq!(result.metrics.original_len, 77);
        assert_eq!(result.metrics.final_len, 62);
        assert!(result.preservation_ratio() > 0.7);
    }

    #[test]
    fn ad_class_with_indicator_terms_survives() {
        let html = r#"<div class="ad">Player Smith's championship analysis continues here with detailed commentary...</div>"#;
        let result = run(html);
        let out = body_html(&result);
        assert!(out.contains(r#"<div class="ad">Player Smith's championship analysis"#));
        assert_eq!(result.metrics.removed_count(), 0);
        assert_eq!(result.metrics.protected, 1);
        assert_eq!(result.preservation_ratio(), 1.0);
    }

    #[test]
    fn indicator_term_inside_a_word_protects() {
        let html = r#"<div class="promo">Preseason preview</div><p>Rain delayed play again today.</p>"#;
        let result = run(html);
        let out = body_html(&result);
        assert!(out.contains(r#"<div class="promo">Preseason preview</div>"#));
        assert_eq!(result.metrics.removed_count(), 0);
        assert_eq!(result.metrics.protected, 1);
    }

    #[test]
    fn scripts_removed_wherever_they_are() {
        let html = r#"<article><h2>Final score</h2><div><p>The team won. <script>track("player championship goal")</script></p></div></article><script>window.ads = 1;</script>"#;
        let result = run(html);
        let out = body_html(&result);
        assert!(!out.contains("<script"));
        assert!(!out.contains("track("));
        assert!(out.contains("The team won."));
        assert_eq!(result.metrics.removed_count(), 2);
        assert!(result
            .metrics
            .removed
            .iter()
            .all(|r| r.rule == Some(Rule::AlwaysRemove)));
        // Script text is never visible, so removing it costs nothing.
        assert_eq!(result.preservation_ratio(), 1.0);
    }

    #[test]
    fn removal_is_subtree_granular() {
        // The inner paragraph would be neutral on its own; it goes with its parent.
        let html = r#"<div id="sponsored"><p>Quarterly report</p><div><span>Visit our store</span></div></div><p>Rain delayed play.</p>"#;
        let result = run(html);
        let out = body_html(&result);
        assert!(!out.contains("Quarterly report"));
        assert!(!out.contains("Visit our store"));
        assert!(out.contains("Rain delayed play."));
        assert_eq!(result.metrics.removed_count(), 1);
        assert_eq!(result.metrics.removed[0].id.as_deref(), Some("sponsored"));
    }

    #[test]
    fn images_outside_ad_selectors_survive() {
        let html = r#"<p><img src="https://cdn.example.com/match.jpg" alt=""></p><div class="promo"><img src="https://ads.example.com/banner.gif"></div>"#;
        let out = body_html(&run(html));
        assert!(out.contains("match.jpg"));
        assert!(!out.contains("banner.gif"));
    }

    #[test]
    fn empty_document() {
        let result = run("");
        assert_eq!(result.metrics.original_len, 0);
        assert_eq!(result.preservation_ratio(), 1.0);
    }

    // ── Randomized synthetic trees ──

    const TAGS: &[&str] = &["div", "section", "aside", "span", "p", "h2", "article"];
    const CLASSES: &[&str] = &["", "ad", "promo", "ad-container", "sponsored", "story", "body-copy"];
    const TEXTS: &[&str] = &[
        "Sponsored by Acme.",
        "Buy now!",
        "Limited time offer!",
        "Weather was mild.",
        "Tickets sold out early.",
        "The player scored a late goal.",
        "Coach praised the squad.",
        "",
    ];

    fn random_tree(rng: &mut StdRng, depth: usize, next_id: &mut usize, out: &mut String) {
        let tag = TAGS[rng.random_range(0..TAGS.len())];
        let class = CLASSES[rng.random_range(0..CLASSES.len())];
        let text = TEXTS[rng.random_range(0..TEXTS.len())];
        let id = *next_id;
        *next_id += 1;

        out.push_str(&format!(r#"<{tag} id="n{id}" class="{class}">{text}"#));
        if rng.random_bool(0.15) {
            out.push_str("<script>var x = 'team player';</script>");
        }
        if depth > 0 && tag != "p" && tag != "h2" && tag != "span" {
            for _ in 0..rng.random_range(0..4) {
                random_tree(rng, depth - 1, next_id, out);
            }
        }
        out.push_str(&format!("</{tag}>"));
    }

    fn ids_of(doc: &Html) -> HashSet<String> {
        content_root(doc)
            .descendants()
            .filter_map(ElementRef::wrap)
            .filter_map(|e| e.value().id().map(str::to_string))
            .collect()
    }

    #[test]
    fn randomized_trees_hold_invariants() {
        let cat = catalog();
        let classifier = Classifier::new(&cat);
        let mut rng = StdRng::seed_from_u64(0x5EED);

        for _ in 0..200 {
            let mut html = String::new();
            let mut next_id = 0;
            for _ in 0..rng.random_range(1..4) {
                random_tree(&mut rng, 3, &mut next_id, &mut html);
            }

            let original = Html::parse_document(&html);
            let root = content_root(&original);
            let protected: HashSet<String> = root
                .descendants()
                .filter_map(ElementRef::wrap)
                .filter(|e| classifier.is_main_content(*e))
                .filter_map(|e| e.value().id().map(str::to_string))
                .collect();
            // Descendant ids per element id, taken from the original tree.
            let subtree = |id: &str| -> Vec<String> {
                root.descendants()
                    .filter_map(ElementRef::wrap)
                    .find(|e| e.value().id() == Some(id))
                    .map(|e| {
                        e.descendants()
                            .skip(1)
                            .filter_map(ElementRef::wrap)
                            .filter_map(|d| d.value().id().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default()
            };

            let result = sanitize(Html::parse_document(&html), &classifier);
            let surviving = ids_of(&result.document);

            for id in &protected {
                assert!(surviving.contains(id), "protected {} removed from {}", id, html);
            }
            for removed in &result.metrics.removed {
                let Some(id) = removed.id.as_deref() else {
                    continue;
                };
                assert!(!surviving.contains(id));
                for d in subtree(id) {
                    assert!(!surviving.contains(&d), "descendant {} of {} survived", d, id);
                }
            }

            let m = &result.metrics;
            assert!(m.final_len <= m.original_len);
            let r = m.preservation_ratio();
            assert!((0.0..=1.0).contains(&r));
        }
    }
}
