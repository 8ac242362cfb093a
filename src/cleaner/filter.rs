use std::ops::Range;

use ego_tree::NodeId;
use regex::Regex;
use scraper::{ElementRef, Html, Node};

use super::classify::{visible_len, Classifier, ALWAYS_REMOVE};
use super::sanitize::content_root;

const PRUNABLE: &[&str] = &["p", "div", "span"];
const MEDIA: &[&str] = &["img", "picture", "video", "audio", "source", "figure", "svg"];

/// Phrasing elements. Text runs straight through them, so a phrase split as
/// `Sponsored by <a>Acme</a>` is still one match.
const INLINE: &[&str] = &[
    "a", "abbr", "b", "bdi", "bdo", "cite", "code", "data", "del", "dfn", "em", "font", "i",
    "ins", "kbd", "mark", "q", "s", "samp", "small", "span", "strong", "sub", "sup", "time",
    "u", "var",
];

/// Remove every span matched by `patterns`, repeating until nothing matches.
/// Running it twice is the same as running it once.
pub fn filter_text(text: &str, patterns: &[Regex]) -> String {
    filter_text_counted(text, patterns).0
}

/// Same as [`filter_text`], also returning how many spans were removed.
pub fn filter_text_counted(text: &str, patterns: &[Regex]) -> (String, usize) {
    let mut out = text.to_string();
    let removed = remove_spans(&mut out, patterns, |_| {});
    (out, removed)
}

/// The fixpoint loop behind [`filter_text`]. `on_remove` sees each span, in
/// offsets of the text as it was just before that removal.
fn remove_spans(
    out: &mut String,
    patterns: &[Regex],
    mut on_remove: impl FnMut(Range<usize>),
) -> usize {
    let mut removed = 0;
    loop {
        let mut changed = false;
        for re in patterns {
            while let Some(m) = re.find(out.as_str()) {
                if m.start() == m.end() {
                    break;
                }
                let span = widen_over_whitespace(out, m.range());
                on_remove(span.clone());
                out.replace_range(span, "");
                removed += 1;
                changed = true;
            }
        }
        if !changed {
            return removed;
        }
    }
}

/// Extend a removed span over one side's adjoining whitespace so the
/// neighbouring sentences join with the spacing they already had.
fn widen_over_whitespace(text: &str, span: Range<usize>) -> Range<usize> {
    let before = &text[..span.start];
    let after = &text[span.end..];

    if after.trim().is_empty() {
        let leading = before.len() - before.trim_end().len();
        return span.start - leading..span.end;
    }
    if before.is_empty() || before.ends_with(char::is_whitespace) {
        let trailing = after.len() - after.trim_start().len();
        return span.start..span.end + trailing;
    }
    span
}

/// Adjacent text nodes with no block boundary between them, flattened.
#[derive(Default)]
struct TextRun {
    text: String,
    nodes: Vec<(NodeId, Range<usize>)>,
}

impl TextRun {
    fn push(&mut self, id: NodeId, text: &str) {
        let start = self.text.len();
        self.text.push_str(text);
        self.nodes.push((id, start..self.text.len()));
    }
}

fn flush(current: &mut TextRun, runs: &mut Vec<TextRun>) {
    if !current.nodes.is_empty() {
        runs.push(std::mem::take(current));
    }
}

fn collect_runs(el: ElementRef, current: &mut TextRun, runs: &mut Vec<TextRun>) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            current.push(child.id(), text);
            continue;
        }
        let Some(child_el) = ElementRef::wrap(child) else {
            continue;
        };
        let name = child_el.value().name();
        if INLINE.contains(&name) {
            collect_runs(child_el, current, runs);
        } else {
            flush(current, runs);
            if !ALWAYS_REMOVE.contains(&name) {
                collect_runs(child_el, current, runs);
                flush(current, runs);
            }
        }
    }
}

/// Apply the text filter to the flattened text of each block, so matches may
/// span inline markup. Removed bytes are cut from the text nodes that held
/// them, and inline elements the filter empties are detached.
/// Returns the number of spans removed.
pub fn filter_document(document: &mut Html, patterns: &[Regex]) -> usize {
    let mut runs = Vec::new();
    let mut current = TextRun::default();
    collect_runs(content_root(document), &mut current, &mut runs);
    flush(&mut current, &mut runs);

    let mut total = 0;
    let mut emptied = Vec::new();
    for run in runs {
        let mut text = run.text.clone();
        // Offset in `run.text` of every byte still present in `text`.
        let mut origin: Vec<usize> = (0..text.len()).collect();
        let removed = remove_spans(&mut text, patterns, |span| {
            origin.drain(span);
        });
        if removed == 0 {
            continue;
        }
        total += removed;

        let mut keep = vec![false; run.text.len()];
        for at in origin {
            keep[at] = true;
        }
        let bytes = run.text.as_bytes();
        for (id, range) in run.nodes {
            if keep[range.clone()].iter().all(|k| *k) {
                continue;
            }
            // Spans end on char boundaries, so the kept bytes stay valid UTF-8.
            let kept: Vec<u8> = range
                .filter(|at| keep[*at])
                .map(|at| bytes[at])
                .collect();
            let kept = String::from_utf8_lossy(&kept).into_owned();
            if kept.trim().is_empty() {
                emptied.push(id);
            }
            if let Some(mut node) = document.tree.get_mut(id) {
                if let Node::Text(t) = node.value() {
                    t.text = kept.as_str().into();
                }
            }
        }
    }

    let husks: Vec<_> = emptied
        .into_iter()
        .filter_map(|id| emptied_wrapper(document, id))
        .collect();
    for id in husks {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }
    total
}

/// Outermost inline ancestor of `text_id` left with no visible text or media.
fn emptied_wrapper(document: &Html, text_id: NodeId) -> Option<NodeId> {
    let mut husk = None;
    let mut parent = document.tree.get(text_id).and_then(|n| n.parent());
    while let Some(el) = parent.and_then(ElementRef::wrap) {
        if !INLINE.contains(&el.value().name()) || visible_len(el) > 0 || has_media(el) {
            break;
        }
        husk = Some(el.id());
        parent = el.parent();
    }
    husk
}

fn has_media(el: ElementRef) -> bool {
    el.descendants()
        .filter_map(ElementRef::wrap)
        .any(|d| MEDIA.contains(&d.value().name()))
}

/// Detach `p`/`div`/`span` elements left without visible text or media.
/// Main content is never pruned. Returns the number of elements detached.
pub fn prune_empty(document: &mut Html, classifier: &Classifier) -> usize {
    let targets: Vec<_> = content_root(document)
        .descendants()
        .skip(1)
        .filter_map(ElementRef::wrap)
        .filter(|el| PRUNABLE.contains(&el.value().name()))
        .filter(|el| visible_len(*el) == 0)
        .filter(|el| !has_media(*el))
        .filter(|el| !classifier.is_main_content(*el))
        .map(|el| el.id())
        .collect();

    let count = targets.len();
    for id in targets {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }
    count
}
