//! # Resource metadata probes
//!
//! A probe issues one lightweight metadata query against a resource location
//! and turns the answer into a [`FreshnessToken`]. Probes are stateless and
//! never retry: a failed probe is reported as a [`ProbeError`] and the cache
//! treats the resource as changed.
//!
//! [`UrlMetadataProbe`] is the default implementation:
//!
//! | Scheme          | Query                           | Token fields                     |
//! |-----------------|---------------------------------|----------------------------------|
//! | `file`          | filesystem metadata             | modification time, length        |
//! | `http`, `https` | `HEAD` request                  | Last-Modified, Content-Length, ETag |
//! | `jar`           | probes the inner archive URL    | as for the inner scheme          |
//!
//! Any other scheme fails with [`ProbeError::UnsupportedScheme`].

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use std::fs;
use std::io;
use std::time::Duration;
use tracing::{trace, warn};
use url::Url;

use crate::{CacheConfig, ProbeError};

/// Metadata observed for one resource at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceMetadata {
    pub last_modified: Option<DateTime<Utc>>,
    pub length: Option<u64>,
    pub etag: Option<String>,
}

impl ResourceMetadata {
    fn is_empty(&self) -> bool {
        self.last_modified.is_none() && self.length.is_none() && self.etag.is_none()
    }
}

/// Comparable marker of a resource's state.
///
/// `Unknown` never matches anything, itself included, so an entry holding an
/// unknown token is always considered stale by a refresh sweep.
///
/// # Examples
///
/// ```
/// use loadercache_core::{FreshnessToken, ResourceMetadata};
///
/// let a = FreshnessToken::from(ResourceMetadata { length: Some(10), ..Default::default() });
/// let b = FreshnessToken::from(ResourceMetadata { length: Some(10), ..Default::default() });
/// let c = FreshnessToken::from(ResourceMetadata { length: Some(11), ..Default::default() });
///
/// assert!(a.matches(&b));
/// assert!(!a.matches(&c));
/// assert!(!FreshnessToken::Unknown.matches(&FreshnessToken::Unknown));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FreshnessToken {
    Unknown,
    Observed(ResourceMetadata),
}

impl FreshnessToken {
    /// Returns true if `current` shows the resource unchanged since `self` was taken.
    pub fn matches(&self, current: &FreshnessToken) -> bool {
        match (self, current) {
            (FreshnessToken::Observed(before), FreshnessToken::Observed(now)) => before == now,
            _ => false,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, FreshnessToken::Unknown)
    }
}

impl From<ResourceMetadata> for FreshnessToken {
    /// Metadata with no field set carries no information and becomes `Unknown`.
    fn from(metadata: ResourceMetadata) -> Self {
        if metadata.is_empty() {
            FreshnessToken::Unknown
        } else {
            FreshnessToken::Observed(metadata)
        }
    }
}

/// A source of freshness tokens for resource locations.
///
/// Implemented for closures, which keeps test doubles short:
///
/// ```
/// use loadercache_core::{FreshnessToken, MetadataProbe, ProbeError};
/// use url::Url;
///
/// let probe = |_: &Url| -> Result<FreshnessToken, ProbeError> { Ok(FreshnessToken::Unknown) };
/// let url = Url::parse("file:///tmp/a.jar").unwrap();
/// assert!(probe.probe(&url).unwrap().is_unknown());
/// ```
pub trait MetadataProbe: Send + Sync {
    fn probe(&self, location: &Url) -> Result<FreshnessToken, ProbeError>;
}

impl<F> MetadataProbe for F
where
    F: Fn(&Url) -> Result<FreshnessToken, ProbeError> + Send + Sync,
{
    fn probe(&self, location: &Url) -> Result<FreshnessToken, ProbeError> {
        self(location)
    }
}

/// Probes a location and folds any failure into [`FreshnessToken::Unknown`].
pub(crate) fn probe_or_unknown(probe: &dyn MetadataProbe, location: &Url) -> FreshnessToken {
    match probe.probe(location) {
        Ok(token) => {
            trace!(location = %location, ?token, "probed resource");
            token
        }
        Err(err) => {
            warn!(location = %location, error = %err, "metadata probe failed, assuming changed");
            FreshnessToken::Unknown
        }
    }
}

/// Default probe for `file`, `http`, `https` and `jar` locations.
pub struct UrlMetadataProbe {
    timeout: Duration,
    user_agent: String,
    agent: OnceCell<ureq::Agent>,
}

impl UrlMetadataProbe {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            timeout: config.probe_timeout,
            user_agent: config.user_agent.clone(),
            agent: OnceCell::new(),
        }
    }

    // Built on first HTTP probe; file-only caches never create one.
    fn agent(&self) -> &ureq::Agent {
        self.agent.get_or_init(|| {
            ureq::AgentBuilder::new()
                .timeout(self.timeout)
                .user_agent(&self.user_agent)
                .build()
        })
    }

    fn probe_file(&self, location: &Url) -> Result<FreshnessToken, ProbeError> {
        let path = location
            .to_file_path()
            .map_err(|_| ProbeError::unavailable(location, "not a local file path"))?;
        let metadata = fs::metadata(&path).map_err(|e| ProbeError::unavailable(location, e))?;
        let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);

        Ok(ResourceMetadata {
            last_modified,
            length: Some(metadata.len()),
            etag: None,
        }
        .into())
    }

    fn probe_http(&self, location: &Url) -> Result<FreshnessToken, ProbeError> {
        let response = match self.agent().head(location.as_str()).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(status, _)) => {
                return Err(ProbeError::Status {
                    location: location.to_string(),
                    status,
                })
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(if is_timeout(&transport) {
                    ProbeError::Timeout {
                        location: location.to_string(),
                        timeout: self.timeout,
                    }
                } else {
                    ProbeError::unavailable(location, transport)
                })
            }
        };

        if !(200..300).contains(&response.status()) {
            return Err(ProbeError::Status {
                location: location.to_string(),
                status: response.status(),
            });
        }

        Ok(ResourceMetadata {
            last_modified: response
                .header("Last-Modified")
                .and_then(parse_http_date),
            length: response
                .header("Content-Length")
                .and_then(|v| v.trim().parse().ok()),
            etag: response.header("ETag").map(|v| v.trim().to_string()),
        }
        .into())
    }
}

impl MetadataProbe for UrlMetadataProbe {
    fn probe(&self, location: &Url) -> Result<FreshnessToken, ProbeError> {
        match location.scheme() {
            "file" => self.probe_file(location),
            "http" | "https" => self.probe_http(location),
            "jar" => {
                let inner = jar_archive_url(location)?;
                self.probe(&inner)
            }
            scheme => Err(ProbeError::UnsupportedScheme {
                location: location.to_string(),
                scheme: scheme.to_string(),
            }),
        }
    }
}

/// Extracts the archive URL from `jar:<archive>!/<entry>`.
fn jar_archive_url(location: &Url) -> Result<Url, ProbeError> {
    let path = location.path();
    let archive = path.split_once("!/").map(|(a, _)| a).unwrap_or(path);
    Url::parse(archive).map_err(|e| ProbeError::unavailable(location, e))
}

/// Parses an HTTP-date (RFC 1123 form, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`).
fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn is_timeout(transport: &ureq::Transport) -> bool {
    std::error::Error::source(transport)
        .and_then(|source| source.downcast_ref::<io::Error>())
        .map(|e| matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock))
        .unwrap_or(false)
}
