//! Request identity.

use crate::options::RequestOptions;

/// Separator placed between the URL and the serialized body.
pub const KEY_SEPARATOR: char = '+';

/// Derives the cache and in-flight key for a request.
///
/// The key is the URL alone when there is no body, otherwise the URL, a `+`
/// and the body verbatim. The body is never parsed: two JSON bodies that
/// differ only in whitespace or field order produce different keys.
///
/// The separator is not escaped, so a URL containing `+` can collide with a
/// URL-and-body key: `a+b` without a body equals `a` with the body `b`.
///
/// # Example
///
/// ```
/// use refetch::key::derive_key;
/// use refetch::options::RequestOptions;
///
/// let get = RequestOptions::default();
/// assert_eq!(derive_key("https://api.test/posts", &get), "https://api.test/posts");
///
/// let post = RequestOptions::default().with_body(r#"{"id":1}"#);
/// assert_eq!(derive_key("https://api.test/posts", &post), r#"https://api.test/posts+{"id":1}"#);
/// ```
#[must_use]
pub fn derive_key(url: &str, options: &RequestOptions) -> String {
    match &options.body {
        Some(body) => {
            let mut key = String::with_capacity(url.len() + body.len() + 1);
            key.push_str(url);
            key.push(KEY_SEPARATOR);
            key.push_str(body);
            key
        }
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let options = RequestOptions::default()
            .with_method("POST")
            .with_header("content-type", "application/json")
            .with_body(r#"{"test":1234}"#);

        let first = derive_key("http://host:port/route", &options);
        let second = derive_key("http://host:port/route", &options);
        assert_eq!(first, second);
        assert_eq!(first, r#"http://host:port/route+{"test":1234}"#);
    }

    #[test]
    fn test_key_without_body_is_url() {
        let options = RequestOptions::default().with_header("x-trace", "1");
        assert_eq!(derive_key("/posts", &options), "/posts");
    }

    #[test]
    fn test_different_bodies_produce_different_keys() {
        let a = RequestOptions::default().with_body(r#"{"a":1,"b":2}"#);
        let b = RequestOptions::default().with_body(r#"{"b":2,"a":1}"#);
        let c = RequestOptions::default().with_body(r#"{"a": 1, "b": 2}"#);

        assert_ne!(derive_key("/posts", &a), derive_key("/posts", &b));
        assert_ne!(derive_key("/posts", &a), derive_key("/posts", &c));
    }

    #[test]
    fn test_empty_body_differs_from_no_body() {
        let empty = RequestOptions::default().with_body("");
        assert_eq!(derive_key("/posts", &empty), "/posts+");
        assert_ne!(
            derive_key("/posts", &empty),
            derive_key("/posts", &RequestOptions::default())
        );
    }

    #[test]
    fn test_headers_and_method_do_not_affect_key() {
        let a = RequestOptions::default().with_method("GET");
        let b = RequestOptions::default().with_header("authorization", "token");
        assert_eq!(derive_key("/posts", &a), derive_key("/posts", &b));
    }

    #[test]
    fn test_plus_in_url_collides_with_body_key() {
        let plain = derive_key("/search+q", &RequestOptions::new());
        let with_body = derive_key("/search", &RequestOptions::new().with_body("q"));
        assert_eq!(plain, with_body);
    }
}
