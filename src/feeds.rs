use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use crate::cleaner::classify::visible_len;
use crate::config::FeedConfig;
use crate::error::FeedError;

/// Containers tried, in order, when a feed body is too thin and the source
/// page has to be fetched.
const ARTICLE_CONTAINERS: &[&str] = &[
    "article",
    "[role=\"main\"]",
    ".article-content",
    ".post-content",
    ".entry-content",
    ".story-body",
    ".article-body",
    "#content",
    ".main-content",
    ".story-content",
    "main",
];
const MIN_CONTAINER_CHARS: usize = 200;

static CONTAINER_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    ARTICLE_CONTAINERS
        .iter()
        .map(|s| Selector::parse(s).unwrap())
        .collect()
});

/// One feed item, the unit the pipeline works on end to end.
#[derive(Debug, Clone, Default)]
pub struct ArticleRecord {
    pub source: String,
    pub url: String,
    pub title: String,
    pub html: String,
    pub published_at: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
}

pub async fn fetch_feed(
    client: &reqwest::Client,
    feed: &FeedConfig,
) -> Result<Vec<ArticleRecord>, FeedError> {
    info!("Fetching feed {}: {}", feed.name, feed.url);
    let xml = fetch_text(client, &feed.url).await?;
    let records = parse_feed(&feed.name, &xml).map_err(|source| FeedError::Xml {
        url: feed.url.clone(),
        source,
    })?;
    info!("Feed {}: {} items", feed.name, records.len());
    Ok(records)
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String, FeedError> {
    let to_feed_error = |source: reqwest::Error| {
        if source.is_timeout() {
            FeedError::Timeout {
                url: url.to_string(),
            }
        } else {
            FeedError::Fetch {
                url: url.to_string(),
                source,
            }
        }
    };
    client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(to_feed_error)?
        .text()
        .await
        .map_err(to_feed_error)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Guid,
    Description,
    Content,
    PubDate,
    Updated,
}

fn field_for(name: &[u8]) -> Option<Field> {
    match name {
        b"title" => Some(Field::Title),
        b"link" => Some(Field::Link),
        b"guid" | b"id" => Some(Field::Guid),
        b"description" | b"summary" => Some(Field::Description),
        b"content:encoded" | b"content" => Some(Field::Content),
        b"pubDate" => Some(Field::PubDate),
        b"updated" | b"published" => Some(Field::Updated),
        _ => None,
    }
}

#[derive(Default)]
struct ItemBuilder {
    title: String,
    link: String,
    guid: String,
    description: String,
    content: String,
    published: Option<DateTime<Utc>>,
    image_url: Option<String>,
}

impl ItemBuilder {
    fn set(&mut self, field: Field, text: String) {
        match field {
            Field::Title => self.title = text,
            // Atom `<link href="..."></link>` has already set the link.
            Field::Link if text.trim().is_empty() => {}
            Field::Link => self.link = text,
            Field::Guid => self.guid = text,
            Field::Description => self.description = text,
            Field::Content => self.content = text,
            Field::PubDate => {
                self.published = DateTime::parse_from_rfc2822(text.trim())
                    .ok()
                    .map(|d| d.with_timezone(&Utc));
            }
            Field::Updated => {
                if self.published.is_none() {
                    self.published = DateTime::parse_from_rfc3339(text.trim())
                        .ok()
                        .map(|d| d.with_timezone(&Utc));
                }
            }
        }
    }

    /// Media references: `<enclosure>`, `<media:content>`, `<media:thumbnail>`
    /// and Atom `<link href>`.
    fn attributes(&mut self, e: &BytesStart) -> Result<(), quick_xml::Error> {
        let attr = |key: &str| -> Result<Option<String>, quick_xml::Error> {
            Ok(match e.try_get_attribute(key)? {
                Some(a) => Some(a.unescape_value()?.into_owned()),
                None => None,
            })
        };

        match e.name().as_ref() {
            b"link" => {
                let rel = attr("rel")?;
                if let Some(href) = attr("href")? {
                    match rel.as_deref() {
                        None | Some("alternate") if self.link.is_empty() => self.link = href,
                        Some("enclosure") if is_image(attr("type")?.as_deref()) => {
                            self.image_url.get_or_insert(href);
                        }
                        _ => {}
                    }
                }
            }
            b"enclosure" => {
                if is_image(attr("type")?.as_deref()) {
                    if let Some(url) = attr("url")? {
                        self.image_url.get_or_insert(url);
                    }
                }
            }
            b"media:content" => {
                let medium_image = attr("medium")?.as_deref() == Some("image");
                if medium_image || is_image(attr("type")?.as_deref()) {
                    if let Some(url) = attr("url")? {
                        self.image_url.get_or_insert(url);
                    }
                }
            }
            b"media:thumbnail" => {
                if let Some(url) = attr("url")? {
                    self.image_url.get_or_insert(url);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self, source: &str) -> Option<ArticleRecord> {
        let title = self.title.split_whitespace().collect::<Vec<_>>().join(" ");
        let url = if !self.link.trim().is_empty() {
            self.link.trim().to_string()
        } else if self.guid.trim().starts_with("http") {
            self.guid.trim().to_string()
        } else {
            String::new()
        };
        if title.is_empty() && url.is_empty() {
            return None;
        }
        let html = if self.content.trim().is_empty() {
            self.description
        } else {
            self.content
        };
        Some(ArticleRecord {
            source: source.to_string(),
            url,
            title,
            html,
            published_at: self.published,
            image_url: self.image_url,
        })
    }
}

fn is_image(mime: Option<&str>) -> bool {
    mime.is_some_and(|m| m.to_ascii_lowercase().starts_with("image/"))
}

/// Parse RSS 2.0 `<item>`s or Atom `<entry>`s into article records.
pub fn parse_feed(source: &str, xml: &str) -> Result<Vec<ArticleRecord>, quick_xml::Error> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut records = Vec::new();
    let mut item: Option<ItemBuilder> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"item" | b"entry" => item = Some(ItemBuilder::default()),
                name => {
                    if let Some(current) = item.as_mut() {
                        current.attributes(&e)?;
                        // Nested markup inside a field keeps accumulating into it.
                        if field.is_none() {
                            field = field_for(name);
                            text.clear();
                        }
                    }
                }
            },
            Event::Empty(e) => {
                if let Some(current) = item.as_mut() {
                    current.attributes(&e)?;
                }
            }
            Event::Text(e) if field.is_some() => {
                let t = e
                    .unescape()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&e).into_owned());
                text.push_str(&t);
            }
            Event::CData(e) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Event::End(e) => match e.name().as_ref() {
                b"item" | b"entry" => {
                    field = None;
                    if let Some(record) = item.take().and_then(|b| b.finish(source)) {
                        records.push(record);
                    }
                }
                name => {
                    if let (Some(current), Some(f)) = (item.as_mut(), field) {
                        if field_for(name) == Some(f) {
                            current.set(f, std::mem::take(&mut text));
                            field = None;
                        }
                    }
                }
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(records)
}

/// Outer HTML of the first article container with enough visible text.
pub fn extract_article_container(page_html: &str) -> Option<String> {
    let doc = Html::parse_document(page_html);
    CONTAINER_SELECTORS.iter().find_map(|sel| {
        doc.select(sel)
            .find(|el| visible_len(*el) > MIN_CONTAINER_CHARS)
            .map(|el| el.html())
    })
}

/// Replace a thin feed body with the source page's article container.
/// Keeps the feed body when the page cannot be fetched or has no container.
pub async fn ensure_body(client: &reqwest::Client, record: &mut ArticleRecord, min_chars: usize) {
    if record.url.is_empty() || crate::cleaner::measure(&record.html) >= min_chars {
        return;
    }
    debug!("Thin feed body for {}, fetching source page", record.url);
    match fetch_text(client, &record.url).await {
        Ok(page) => match extract_article_container(&page) {
            Some(body) => record.html = body,
            None => debug!("No article container found on {}", record.url),
        },
        Err(e) => warn!("Could not fetch full article {}: {}", record.url, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/" xmlns:media="http://search.yahoo.com/mrss/">
  <channel>
    <title>Sports Desk</title>
    <link>https://sports.example.com</link>
    <item>
      <title>  Team wins
        championship </title>
      <link>https://sports.example.com/news/final?utm_source=rss</link>
      <description>&lt;p&gt;Short summary&lt;/p&gt;</description>
      <content:encoded><![CDATA[<p>The full story of the final.</p><div class="ad">Buy now!</div>]]></content:encoded>
      <pubDate>Sun, 12 Oct 2025 18:30:00 +0000</pubDate>
      <media:content url="https://cdn.example.com/final.jpg" medium="image" />
    </item>
    <item>
      <title>Transfer rumours</title>
      <guid isPermaLink="true">https://sports.example.com/news/rumours</guid>
      <description>&lt;p&gt;Gossip roundup&lt;/p&gt;</description>
      <enclosure url="https://cdn.example.com/podcast.mp3" type="audio/mpeg" length="1" />
      <enclosure url="https://cdn.example.com/rumours.png" type="image/png" length="1" />
    </item>
    <item>
      <description>No title, no link</description>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Sports</title>
  <link href="https://atom.example.com/" />
  <entry>
    <title>Cup draw announced</title>
    <link rel="alternate" href="https://atom.example.com/cup-draw" />
    <link rel="enclosure" type="image/jpeg" href="https://atom.example.com/draw.jpg" />
    <id>urn:uuid:1225c695</id>
    <updated>2025-10-12T09:00:00Z</updated>
    <summary>Draw summary</summary>
    <content type="html">&lt;p&gt;Full draw details.&lt;/p&gt;</content>
  </entry>
</feed>"#;

    #[test]
    fn parses_rss_items() {
        let items = parse_feed("Sports Desk", RSS).unwrap();
        assert_eq!(items.len(), 2);

        let first = &items[0];
        assert_eq!(first.source, "Sports Desk");
        assert_eq!(first.title, "Team wins championship");
        assert_eq!(first.url, "https://sports.example.com/news/final?utm_source=rss");
        assert!(first.html.starts_with("<p>The full story of the final.</p>"));
        assert_eq!(first.image_url.as_deref(), Some("https://cdn.example.com/final.jpg"));
        assert_eq!(
            first.published_at.map(|d| d.to_rfc3339()),
            Some("2025-10-12T18:30:00+00:00".to_string())
        );

        let second = &items[1];
        assert_eq!(second.url, "https://sports.example.com/news/rumours");
        assert_eq!(second.html, "<p>Gossip roundup</p>");
        assert_eq!(second.image_url.as_deref(), Some("https://cdn.example.com/rumours.png"));
        assert!(second.published_at.is_none());
    }

    #[test]
    fn parses_atom_entries() {
        let items = parse_feed("Atom", ATOM).unwrap();
        assert_eq!(items.len(), 1);
        let e = &items[0];
        assert_eq!(e.title, "Cup draw announced");
        assert_eq!(e.url, "https://atom.example.com/cup-draw");
        assert_eq!(e.html, "<p>Full draw details.</p>");
        assert_eq!(e.image_url.as_deref(), Some("https://atom.example.com/draw.jpg"));
        assert!(e.published_at.is_some());
    }

    #[test]
    fn malformed_feed_is_error() {
        assert!(parse_feed("Broken", "<rss><channel><item><title>x</item></rss>").is_err());
    }

    #[test]
    fn container_extraction() {
        let long = "The goalkeeper kept a clean sheet for the fourth straight game. ".repeat(5);
        let page = format!(
            r#"<html><body><nav>Home | Scores</nav><article><p>Too short</p></article><div class="story-body"><p>{}</p></div></body></html>"#,
            long
        );
        let body = extract_article_container(&page).unwrap();
        assert!(body.starts_with(r#"<div class="story-body">"#));
        assert!(extract_article_container("<p>nothing here</p>").is_none());
    }
}
