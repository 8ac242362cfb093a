use thiserror::Error;

/// Article body could not be turned into a document worth cleaning.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("article body is empty")]
    Empty,

    #[error("article body has no visible text")]
    NoVisibleText,

    #[error("article body is {bytes} bytes, limit is {limit}")]
    Oversized { bytes: usize, limit: usize },
}

/// Raised when cleaning kept less of the article than the configured floor.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("preservation ratio {ratio:.2} is below the {floor:.2} floor ({final_len} of {original_len} chars kept)")]
pub struct OverRemovalWarning {
    pub ratio: f64,
    pub floor: f64,
    pub original_len: usize,
    pub final_len: usize,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher responded with HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("publisher rejected credentials (HTTP {status})")]
    Auth { status: u16 },

    #[error("publisher rejected the post (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

impl PublishError {
    /// Whether another attempt in the same run can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::Http { status, .. } => *status == 429 || *status >= 500,
            PublishError::Timeout | PublishError::Transport(_) => true,
            PublishError::Auth { .. } | PublishError::Rejected { .. } => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, PublishError::Auth { .. })
    }

    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => PublishError::Auth { status },
            429 | 500..=599 => PublishError::Http { status, message },
            _ => PublishError::Rejected { status, message },
        }
    }
}

impl From<reqwest::Error> for PublishError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PublishError::Timeout
        } else if let Some(status) = e.status() {
            PublishError::from_status(status.as_u16(), e.to_string())
        } else {
            PublishError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("fetching {url} timed out")]
    Timeout { url: String },

    #[error("fetching {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("feed {url} is not valid XML: {source}")]
    Xml {
        url: String,
        #[source]
        source: quick_xml::Error,
    },
}

/// Fatal at start-up: nothing runs without a valid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid structural selector {0:?} (expected .class, #id or tag)")]
    InvalidSelector(String),

    #[error("invalid promotional pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("promotional pattern {0:?} matches the empty string")]
    EmptyMatchPattern(String),

    #[error("invalid preservation bounds: min {min}, max {max}")]
    InvalidBounds { min: f64, max: f64 },

    #[error("settings.max_retries is {max_retries}, limit is {limit}")]
    InvalidRetries { max_retries: u32, limit: u32 },

    #[error("no [wordpress] section configured")]
    MissingWordPress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(PublishError::from_status(401, String::new()).is_auth());
        assert!(PublishError::from_status(403, String::new()).is_auth());
        assert!(PublishError::from_status(503, String::new()).is_retryable());
        assert!(PublishError::from_status(429, String::new()).is_retryable());
        assert!(!PublishError::from_status(400, String::new()).is_retryable());
        assert!(!PublishError::Auth { status: 401 }.is_retryable());
        assert!(PublishError::Timeout.is_retryable());
    }

    #[test]
    fn warning_message() {
        let w = OverRemovalWarning {
            ratio: 0.45,
            floor: 0.7,
            original_len: 200,
            final_len: 90,
        };
        assert_eq!(
            w.to_string(),
            "preservation ratio 0.45 is below the 0.70 floor (90 of 200 chars kept)"
        );
    }
}
