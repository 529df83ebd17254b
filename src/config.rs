use crate::cache::Cache;
use crate::options::{OptionsLayer, RequestOptions};

/// Configuration shared by every query and mutation of a client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Prefix for every request URL (e.g. `https://example.com/api`).
    ///
    /// Queries and mutations may override it.
    pub base_url: Option<String>,

    /// Options applied beneath every request's own options.
    ///
    /// A [`OptionsLayer::Computed`] layer takes full control of the final
    /// request options.
    pub fetch_options: Option<OptionsLayer>,

    /// Snapshot the cache starts from, e.g. one rendered by a server.
    pub initial_cache: Option<Cache>,
}

impl ClientConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_fetch_options(mut self, fetch_options: impl Into<OptionsLayer>) -> Self {
        self.fetch_options = Some(fetch_options.into());
        self
    }

    #[must_use]
    pub fn with_initial_cache(mut self, cache: Cache) -> Self {
        self.initial_cache = Some(cache);
        self
    }

    /// Returns the client-wide options layer, empty when unset.
    #[must_use]
    pub fn options_layer(&self) -> OptionsLayer {
        self.fetch_options
            .clone()
            .unwrap_or_else(|| OptionsLayer::Static(RequestOptions::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.base_url.is_none());
        assert!(config.fetch_options.is_none());
        assert!(config.initial_cache.is_none());
        assert!(matches!(
            config.options_layer(),
            OptionsLayer::Static(options) if options == RequestOptions::default()
        ));
    }

    #[test]
    fn test_builder() {
        let cache = Cache::new().with_entry("k", CacheEntry::new(json!(1), vec!["d".into()]));
        let config = ClientConfig::new()
            .with_base_url("http://1234")
            .with_fetch_options(
                RequestOptions::new().with_header("content-type", "application/json"),
            )
            .with_initial_cache(cache.clone());

        assert_eq!(config.base_url.as_deref(), Some("http://1234"));
        assert_eq!(config.initial_cache, Some(cache));
        assert!(matches!(
            config.options_layer(),
            OptionsLayer::Static(options) if options.headers.len() == 1
        ));
    }
}
