use std::io;

/// Network failure fetching a page or an image.
#[derive(Debug, Clone, thiserror::Error)]
#[error("fetch failed for {url}: {reason}")]
pub struct FetchError {
    pub url: String,
    pub reason: String,
}

impl FetchError {
    pub fn new(url: &str, reason: impl Into<String>) -> Self {
        FetchError {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure resolving a single image node. Always recoverable: the
/// extractor drops the token and moves on.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("empty asset downloaded from {url}")]
    EmptyAsset { url: String },

    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl ResolveError {
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::Fetch(_) => "fetch",
            ResolveError::EmptyAsset { .. } => "empty_asset",
            ResolveError::Io { .. } => "io",
        }
    }
}

/// Page-level failures reported by the page parser. `MalformedDom` is
/// recoverable: the page is kept with empty blocks.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("problem container not found on {url}")]
    MissingBlock { url: String },

    #[error("malformed problem page {url}: {detail}")]
    MalformedDom { url: String, detail: String },
}
