//! Download sources and transfer identity.
//!
//! A transfer either fetches a plain URL directly or starts from a locator of
//! the form `scheme://host/path/<object-id>#<key>` whose fetchable URL is
//! produced by an external [`UrlResolver`] at start time.

use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use thiserror::Error;

use crate::transfer::checksum::sha256_hex;
use crate::transfer::BoxFuture;

/// Stable registry key of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(String);

impl TransferId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// First 16 hex digits of the URL's SHA-256.
    pub fn from_url(url: &str) -> Self {
        let mut digest = sha256_hex(url.as_bytes());
        digest.truncate(16);
        Self(digest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransferId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TransferId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    #[error("malformed locator {0:?}: expected scheme://host/path")]
    Malformed(String),

    #[error("locator {0:?} names no object")]
    MissingObjectId(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("object {0} not found")]
    NotFound(String),

    #[error("resolver request failed: {0}")]
    Request(String),

    #[error("invalid resolver response: {0}")]
    InvalidResponse(String),
}

fn locator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // scheme :// authority [path] [?query] [#fragment]
        Regex::new(
            r"^(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*)://(?P<host>[^/?#\s]+)(?P<path>/[^?#\s]*)?(?:\?[^#\s]*)?(?:#(?P<key>.*))?$",
        )
        .unwrap()
    })
}

/// A parsed `scheme://host/path#key` locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocator {
    url: String,
    object_id: String,
    key: Option<String>,
}

impl SourceLocator {
    /// Splits a locator into its fetchable part, object id and key.
    ///
    /// The object id is the last non-empty path segment; the key is the
    /// fragment, if present and non-empty.
    pub fn parse(input: &str) -> Result<Self, LocatorError> {
        let input = input.trim();
        let caps = locator_pattern()
            .captures(input)
            .ok_or_else(|| LocatorError::Malformed(input.to_string()))?;

        let object_id = caps
            .name("path")
            .and_then(|path| path.as_str().rsplit('/').find(|segment| !segment.is_empty()))
            .ok_or_else(|| LocatorError::MissingObjectId(input.to_string()))?
            .to_string();

        let key = caps
            .name("key")
            .map(|k| k.as_str().to_string())
            .filter(|k| !k.is_empty());

        let url = match input.split_once('#') {
            Some((url, _)) => url.to_string(),
            None => input.to_string(),
        };

        Ok(Self {
            url,
            object_id,
            key,
        })
    }

    /// The locator without its fragment.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

/// Turns an object id (and optional key) into a fetchable URL.
pub trait UrlResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        object_id: &'a str,
        key: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String, ResolveError>>;
}

/// Where a transfer's bytes come from.
#[derive(Clone)]
pub enum DownloadSource {
    Direct(String),
    Resolved {
        locator: SourceLocator,
        resolver: Arc<dyn UrlResolver>,
    },
}

impl DownloadSource {
    pub fn direct(url: impl Into<String>) -> Self {
        DownloadSource::Direct(url.into())
    }

    pub fn resolved(locator: SourceLocator, resolver: Arc<dyn UrlResolver>) -> Self {
        DownloadSource::Resolved { locator, resolver }
    }

    /// Identity derived from the source: the object id of a locator, or a
    /// digest of a direct URL.
    pub fn id(&self) -> TransferId {
        match self {
            DownloadSource::Direct(url) => TransferId::from_url(url),
            DownloadSource::Resolved { locator, .. } => TransferId::new(locator.object_id()),
        }
    }

    /// The URL shown to users. Never includes a key.
    pub fn display_url(&self) -> &str {
        match self {
            DownloadSource::Direct(url) => url,
            DownloadSource::Resolved { locator, .. } => locator.url(),
        }
    }

    /// File name suggested by a direct URL's last path segment.
    pub fn file_name(&self) -> Option<String> {
        match self {
            DownloadSource::Direct(url) => SourceLocator::parse(url)
                .ok()
                .map(|locator| locator.object_id().to_string()),
            DownloadSource::Resolved { .. } => None,
        }
    }

    /// Produces the URL to fetch.
    pub async fn resolve(&self) -> Result<String, ResolveError> {
        match self {
            DownloadSource::Direct(url) => Ok(url.clone()),
            DownloadSource::Resolved { locator, resolver } => {
                resolver.resolve(locator.object_id(), locator.key()).await
            }
        }
    }
}

impl fmt::Debug for DownloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadSource::Direct(url) => f.debug_tuple("Direct").field(url).finish(),
            DownloadSource::Resolved { locator, .. } => f
                .debug_struct("Resolved")
                .field("url", &locator.url())
                .field("object_id", &locator.object_id())
                .finish_non_exhaustive(),
        }
    }
}
