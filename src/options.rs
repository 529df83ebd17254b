//! Request options and layered merging.
//!
//! A request is configured by up to three layers: the client-wide options,
//! the options a coordinator was created with, and one-shot overrides passed
//! to a single call. [`merge_options`] folds them into the final
//! [`RequestOptions`] handed to the transport.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The method used when none is given.
pub const DEFAULT_METHOD: &str = "GET";

/// Options for a single transport call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// HTTP method. `None` means `GET`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Headers by name. Merged per name, later layers win.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Serialized request body, sent and keyed verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl RequestOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Returns the effective method.
    #[must_use]
    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or(DEFAULT_METHOD)
    }

    /// Returns `true` when the method is absent or exactly `GET`.
    ///
    /// Only such requests are deduplicated while in flight.
    #[must_use]
    pub fn is_get(&self) -> bool {
        self.method.as_deref().is_none_or(|method| method == DEFAULT_METHOD)
    }

    /// Applies `other` on top of `self`.
    ///
    /// Scalar fields present in `other` replace ours; headers are merged by
    /// name.
    pub fn merge_from(&mut self, other: &Self) {
        if let Some(method) = &other.method {
            self.method = Some(method.clone());
        }
        for (name, value) in &other.headers {
            self.headers.insert(name.clone(), value.clone());
        }
        if let Some(body) = &other.body {
            self.body = Some(body.clone());
        }
    }

    /// Returns a copy of `self` with `other` applied on top.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        merged.merge_from(other);
        merged
    }
}

/// Computes final options from the merged overrides.
pub type OptionsFn = Arc<dyn Fn(&RequestOptions) -> RequestOptions + Send + Sync>;

/// One layer of request configuration.
#[derive(Clone)]
pub enum OptionsLayer {
    /// Plain options merged field by field.
    Static(RequestOptions),
    /// A function that receives the merged lower layers and returns the
    /// final options verbatim.
    Computed(OptionsFn),
}

impl OptionsLayer {
    /// Creates a computed layer.
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&RequestOptions) -> RequestOptions + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    fn apply(&self, acc: RequestOptions) -> RequestOptions {
        match self {
            Self::Static(options) => acc.merged(options),
            Self::Computed(f) => f(&acc),
        }
    }
}

impl Default for OptionsLayer {
    fn default() -> Self {
        Self::Static(RequestOptions::default())
    }
}

impl From<RequestOptions> for OptionsLayer {
    fn from(options: RequestOptions) -> Self {
        Self::Static(options)
    }
}

impl fmt::Debug for OptionsLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(options) => f.debug_tuple("Static").field(options).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// One-shot overrides for a single query refetch or mutation call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// Replaces the path.
    pub url: Option<String>,
    /// Replaces the base URL.
    pub base_url: Option<String>,
    /// Replaces the method.
    pub method: Option<String>,
    /// Applied on top of every other options layer.
    pub fetch_options: Option<RequestOptions>,
}

impl Overrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    #[must_use]
    pub fn with_fetch_options(mut self, fetch_options: RequestOptions) -> Self {
        self.fetch_options = Some(fetch_options);
        self
    }

    /// Returns the explicit method, or the one carried by `fetch_options`.
    #[must_use]
    pub fn requested_method(&self) -> Option<&str> {
        self.method
            .as_deref()
            .or_else(|| self.fetch_options.as_ref()?.method.as_deref())
    }

    /// Builds the layers stacked above the client-wide base: `own` options
    /// first, these overrides last.
    #[must_use]
    pub fn layers_over(&self, own: Option<&RequestOptions>) -> Vec<OptionsLayer> {
        own.into_iter()
            .chain(self.fetch_options.as_ref())
            .map(|options| OptionsLayer::Static(options.clone()))
            .collect()
    }
}

/// Merges option layers into the final request configuration.
///
/// The first layer is the base. When it is [`OptionsLayer::Static`], every
/// following layer is applied on top of it in order, so later layers win on
/// scalar fields and on individual header names. When the base is
/// [`OptionsLayer::Computed`], the remaining layers are merged first and the
/// base function receives the result and decides the final shape alone.
///
/// # Errors
///
/// Returns [`ConfigError::NoOptionLayers`] when `layers` is empty.
///
/// # Example
///
/// ```
/// use refetch::options::{merge_options, OptionsLayer, RequestOptions};
///
/// let base = RequestOptions::new().with_header("x", "1").with_method("POST");
/// let over = RequestOptions::new().with_header("y", "2").with_method("PUT");
///
/// let merged = merge_options(&[base.into(), over.into()]).unwrap();
/// assert_eq!(merged.method(), "PUT");
/// assert_eq!(merged.headers.len(), 2);
/// ```
pub fn merge_options(layers: &[OptionsLayer]) -> Result<RequestOptions, ConfigError> {
    let (base, overrides) = layers.split_first().ok_or(ConfigError::NoOptionLayers)?;
    Ok(merge_onto(base, overrides))
}

/// Merges `overrides` onto an explicit `base` layer.
///
/// Same semantics as [`merge_options`], for callers that always hold a base.
#[must_use]
pub fn merge_onto(base: &OptionsLayer, overrides: &[OptionsLayer]) -> RequestOptions {
    match base {
        OptionsLayer::Static(options) => fold(options.clone(), overrides),
        OptionsLayer::Computed(f) => f(&fold(RequestOptions::default(), overrides)),
    }
}

fn fold(acc: RequestOptions, layers: &[OptionsLayer]) -> RequestOptions {
    layers.iter().fold(acc, |acc, layer| layer.apply(acc))
}
