use alloy::providers::{ProviderBuilder, RootProvider};
use alloy::transports::http::{Client, Http};
use eyre::{Result, WrapErr};
use std::sync::atomic::{AtomicUsize, Ordering};

pub type HttpProvider = RootProvider<Http<Client>>;

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Create alloy HTTP providers for each RPC URL.
pub fn create_providers(urls: &[String]) -> Result<Vec<HttpProvider>> {
    if urls.is_empty() {
        return Err(eyre::eyre!("At least one RPC URL is required"));
    }
    urls.iter()
        .map(|url| {
            let parsed = url
                .parse()
                .wrap_err_with(|| format!("Invalid RPC URL: {}", url))?;
            Ok(ProviderBuilder::new().on_http(parsed))
        })
        .collect()
}

/// Ordered set of providers for one chain with a movable "active" index.
///
/// Callers use [`current`](Self::current) until a transport error, then call
/// [`rotate`](Self::rotate) to move on to the next URL.
pub struct FallbackProviders {
    urls: Vec<String>,
    providers: Vec<HttpProvider>,
    active: AtomicUsize,
}

impl FallbackProviders {
    pub fn new(urls: Vec<String>) -> Result<Self> {
        let providers = create_providers(&urls)?;
        Ok(Self {
            urls,
            providers,
            active: AtomicUsize::new(0),
        })
    }

    pub fn current(&self) -> &HttpProvider {
        &self.providers[self.active_index()]
    }

    pub fn current_url(&self) -> &str {
        &self.urls[self.active_index()]
    }

    /// Advance to the next provider, wrapping around; returns the new URL
    pub fn rotate(&self) -> &str {
        let len = self.providers.len();
        let next = (self.active.load(Ordering::Relaxed) + 1) % len;
        self.active.store(next, Ordering::Relaxed);
        &self.urls[next]
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn active_index(&self) -> usize {
        self.active.load(Ordering::Relaxed) % self.providers.len()
    }
}

impl std::fmt::Debug for FallbackProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackProviders")
            .field("urls", &self.urls.len())
            .field("active", &self.active_index())
            .finish()
    }
}
