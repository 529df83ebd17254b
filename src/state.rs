//! Observable state of a query or mutation.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::FetchError;

/// What a consumer renders from.
///
/// `fetching` is an overlay: while a request is pending, the last known
/// `data` and `error` stay visible.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchState {
    /// A request is pending.
    pub fetching: bool,
    /// The last successful payload, if any.
    pub data: Option<Value>,
    /// The error of the last failed request, cleared by the next success.
    pub error: Option<FetchError>,
}

impl FetchState {
    /// Decodes the data into `T`.
    ///
    /// Returns `Ok(None)` when there is no data yet.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Decode`] when the data does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, FetchError> {
        self.data
            .as_ref()
            .map(|data| T::deserialize(data).map_err(|e| FetchError::Decode(e.to_string())))
            .transpose()
    }

    /// Returns `true` while a request is pending.
    #[must_use]
    pub const fn is_fetching(&self) -> bool {
        self.fetching
    }

    /// Returns `true` if data is available.
    #[must_use]
    pub const fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Returns `true` if the last request failed.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Post {
        id: u32,
        title: String,
    }

    #[test]
    fn test_default_state() {
        let state = FetchState::default();
        assert!(!state.is_fetching());
        assert!(!state.has_data());
        assert!(!state.is_error());
    }

    #[test]
    fn test_data_as() {
        let state = FetchState {
            data: Some(json!({ "id": 1, "title": "hello" })),
            ..FetchState::default()
        };
        let post: Option<Post> = state.data_as().expect("decodes");
        assert_eq!(
            post,
            Some(Post {
                id: 1,
                title: "hello".to_string()
            })
        );

        let empty: Option<Post> = FetchState::default().data_as().expect("nothing to decode");
        assert_eq!(empty, None);
    }

    #[test]
    fn test_data_as_mismatch() {
        let state = FetchState {
            data: Some(json!("not a post")),
            ..FetchState::default()
        };
        assert!(matches!(state.data_as::<Post>(), Err(FetchError::Decode(_))));
    }

    #[test]
    fn test_predicates() {
        let state = FetchState {
            fetching: true,
            data: Some(json!(1)),
            error: Some(FetchError::Transport("offline".to_string())),
        };
        assert!(state.is_fetching());
        assert!(state.has_data());
        assert!(state.is_error());
    }
}
