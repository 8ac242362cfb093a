use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::WordPressConfig;
use crate::error::PublishError;

const FALLBACK_TITLE: &str = "Sports News Update";
const MAX_ERROR_BODY: usize = 200;

static TITLE_PREFIXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^\s*(News|Update|Report|Breaking)\s*[-:|]\s*",
        r"(?i)^\s*Latest\s*[-:|]\s*",
        r"^\s*\[\w+\]\s*",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// A cleaned article ready for the CMS.
#[derive(Debug, Clone)]
pub struct Post {
    pub title: String,
    pub content: String,
    pub source_url: String,
    pub featured_image: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PublishReceipt {
    pub post_id: Option<i64>,
    pub link: Option<String>,
    pub featured_media: Option<i64>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, post: &Post) -> Result<PublishReceipt, PublishError>;
}

/// Collapse whitespace and drop wire-style prefixes such as `Breaking:` or
/// `[NFL]`.
pub fn clean_title(raw: &str) -> String {
    let mut title = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    for re in TITLE_PREFIXES.iter() {
        title = re.replace(&title, "").into_owned();
    }
    let title = title.trim();
    if title.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        title.to_string()
    }
}

/// Cleaned body followed by a link back to the source article.
pub fn compose_body(cleaned_html: &str, url: &str, source: &str) -> String {
    format!(
        "{}\n\n<hr>\n<p><em>Originally published at: <a href=\"{}\" target=\"_blank\" rel=\"noopener noreferrer\">{}</a></em></p>",
        cleaned_html.trim(),
        html_escape::encode_double_quoted_attribute(url),
        html_escape::encode_text(source),
    )
}

pub fn build_post(
    title: &str,
    cleaned_html: &str,
    url: &str,
    source: &str,
    featured_image: Option<String>,
) -> Post {
    Post {
        title: clean_title(title),
        content: compose_body(cleaned_html, url, source),
        source_url: url.to_string(),
        featured_image,
    }
}

// ── WordPress ──

#[derive(Deserialize)]
struct Created {
    id: i64,
    #[serde(default)]
    link: Option<String>,
}

pub struct WordPress {
    client: reqwest::Client,
    api: String,
    username: String,
    app_password: String,
    category_id: Option<u64>,
    status: String,
}

impl WordPress {
    pub fn new(
        cfg: &WordPressConfig,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(WordPress {
            client,
            api: format!("{}/wp-json/wp/v2", cfg.url.trim_end_matches('/')),
            username: cfg.username.clone(),
            app_password: cfg.app_password.clone(),
            category_id: cfg.category_id,
            status: cfg.status.clone(),
        })
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, PublishError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY)
                .rev()
                .find(|i| body.is_char_boundary(*i))
                .unwrap_or(0);
            body.truncate(cut);
        }
        Err(PublishError::from_status(status.as_u16(), body))
    }

    /// Download an image and upload it to the media library unchanged.
    async fn upload_media(&self, image_url: &str, title: &str) -> Result<i64, PublishError> {
        let image = Self::check(self.client.get(image_url).send().await?).await?;
        let content_type = image
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = image.bytes().await?;

        let resp = self
            .client
            .post(format!("{}/media", self.api))
            .basic_auth(&self.username, Some(&self.app_password))
            .header(reqwest::header::CONTENT_TYPE, content_type.as_str())
            .header(
                reqwest::header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", media_filename(title, &content_type)),
            )
            .body(bytes)
            .send()
            .await?;
        let created: Created = Self::check(resp).await?.json().await?;
        Ok(created.id)
    }
}

#[async_trait]
impl Publisher for WordPress {
    async fn publish(&self, post: &Post) -> Result<PublishReceipt, PublishError> {
        let featured_media = match &post.featured_image {
            Some(image_url) => match self.upload_media(image_url, &post.title).await {
                Ok(id) => Some(id),
                // Credentials are shared with the post request; let that one fail.
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!("Featured image upload failed for {}: {}", post.source_url, e);
                    None
                }
            },
            None => None,
        };

        let mut body = json!({
            "title": post.title,
            "content": post.content,
            "status": self.status,
        });
        if let Some(category) = self.category_id {
            body["categories"] = json!([category]);
        }
        if let Some(media) = featured_media {
            body["featured_media"] = json!(media);
        }

        let resp = self
            .client
            .post(format!("{}/posts", self.api))
            .basic_auth(&self.username, Some(&self.app_password))
            .json(&body)
            .send()
            .await?;
        let created: Created = Self::check(resp).await?.json().await?;
        debug!(post_id = created.id, "post created");

        Ok(PublishReceipt {
            post_id: Some(created.id),
            link: created.link,
            featured_media,
        })
    }
}

/// ASCII filename derived from the post title, `title[..50]` plus extension.
fn media_filename(title: &str, content_type: &str) -> String {
    let ext = match content_type {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "jpg",
    };
    let mut stem: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .take(50)
        .collect();
    while stem.contains("--") {
        stem = stem.replace("--", "-");
    }
    let stem = stem.trim_matches('-');
    if stem.is_empty() {
        format!("image.{}", ext)
    } else {
        format!("{}.{}", stem, ext)
    }
}

// ── Dry run ──

/// Logs what would be published and always succeeds.
pub struct DryRun;

#[async_trait]
impl Publisher for DryRun {
    async fn publish(&self, post: &Post) -> Result<PublishReceipt, PublishError> {
        info!(
            title = %post.title,
            chars = post.content.len(),
            image = post.featured_image.as_deref().unwrap_or("-"),
            "dry run: would publish"
        );
        Ok(PublishReceipt::default())
    }
}
