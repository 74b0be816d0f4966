use std::time::Duration;

/// When freshness tokens are captured for a newly built context.
///
/// # Variants
///
/// * `Always` - Probe every resource right after construction, whatever the
///   requested volatility. A non-volatile entry promoted later already has a
///   baseline to compare against.
/// * `VolatileOnly` - Probe only when the context is requested as volatile.
///   Non-volatile entries store unknown tokens, so promoting one makes the
///   next refresh rebuild it.
///
/// # Examples
///
/// ```
/// use loadercache_core::TokenCapture;
///
/// assert_eq!(TokenCapture::default(), TokenCapture::Always);
/// assert!(TokenCapture::Always.should_capture(false));
/// assert!(!TokenCapture::VolatileOnly.should_capture(false));
/// assert!(TokenCapture::VolatileOnly.should_capture(true));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TokenCapture {
    #[default]
    Always,
    VolatileOnly,
}

impl TokenCapture {
    /// Returns true if tokens must be captured for a build with the given volatility.
    pub fn should_capture(self, volatile: bool) -> bool {
        match self {
            TokenCapture::Always => true,
            TokenCapture::VolatileOnly => volatile,
        }
    }
}

impl From<&str> for TokenCapture {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "volatile_only" | "volatile-only" | "volatile" => TokenCapture::VolatileOnly,
            _ => TokenCapture::Always,
        }
    }
}

/// Tunables for a [`ContextCache`](crate::ContextCache) and the default
/// [`UrlMetadataProbe`](crate::UrlMetadataProbe).
///
/// # Examples
///
/// ```
/// use loadercache_core::{CacheConfig, TokenCapture};
/// use std::time::Duration;
///
/// let config = CacheConfig::default()
///     .with_probe_timeout(Duration::from_secs(3))
///     .with_token_capture(TokenCapture::VolatileOnly);
///
/// assert_eq!(config.probe_timeout, Duration::from_secs(3));
/// assert_eq!(config.token_capture, TokenCapture::VolatileOnly);
/// ```
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Upper bound for a single HEAD request issued by the default probe.
    pub probe_timeout: Duration,
    /// Whether tokens are captured for non-volatile builds.
    pub token_capture: TokenCapture,
    /// `User-Agent` sent with HTTP metadata probes.
    pub user_agent: String,
}

impl CacheConfig {
    pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_token_capture(mut self, capture: TokenCapture) -> Self {
        self.token_capture = capture;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Self::DEFAULT_PROBE_TIMEOUT,
            token_capture: TokenCapture::default(),
            user_agent: concat!("loadercache/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
