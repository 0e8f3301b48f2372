//! Backend handles.
//!
//! A [`Backend`] is identified by the URL it was registered with. That string is the
//! only thing ever persisted or serialized; the parsed upstream target used to rewrite
//! outgoing requests is derived from it once, at construction.

use crate::{error::RouterError, Result};
use hyper::{
    header::{HeaderValue, HOST},
    Body, Request, Uri,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, sync::Arc};
use url::Url;

/// A single upstream endpoint a revision is served from.
#[derive(Clone)]
pub struct Backend {
    url: String,
    target: Arc<Target>,
}

/// Parsed upstream target derived from the backend URL.
#[derive(Debug)]
struct Target {
    scheme: String,
    authority: String,
    path: String,
    query: Option<String>,
}

impl Backend {
    /// Build a backend from an absolute `http` or `https` URL.
    pub fn new(url: &str) -> Result<Self> {
        let invalid = |reason: String| RouterError::InvalidBackendUrl {
            url: url.to_string(),
            reason,
        };

        let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        }

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;

        let authority = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let target = Target {
            scheme: parsed.scheme().to_string(),
            authority,
            path: parsed.path().to_string(),
            query: parsed.query().filter(|q| !q.is_empty()).map(str::to_string),
        };

        // Make sure every rewrite we will perform later produces a valid URI.
        format!("{}://{}{}", target.scheme, target.authority, target.path)
            .parse::<Uri>()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            url: url.to_string(),
            target: Arc::new(target),
        })
    }

    /// The URL this backend was registered with.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// `host[:port]` of the upstream.
    pub fn authority(&self) -> &str {
        &self.target.authority
    }

    /// Point `req` at this backend.
    ///
    /// Scheme and authority are replaced, the backend's base path is joined with the
    /// request path, the two query strings are concatenated and the `Host` header is
    /// set to the upstream authority.
    pub fn direct(&self, req: &mut Request<Body>) -> Result<()> {
        let path = join_paths(&self.target.path, req.uri().path());

        let query = match (self.target.query.as_deref(), req.uri().query()) {
            (Some(base), Some(extra)) if !extra.is_empty() => Some(format!("{}&{}", base, extra)),
            (Some(base), _) => Some(base.to_string()),
            (None, Some(extra)) if !extra.is_empty() => Some(extra.to_string()),
            (None, _) => None,
        };

        let path_and_query = match query {
            Some(q) => format!("{}?{}", path, q),
            None => path,
        };

        let uri = Uri::builder()
            .scheme(self.target.scheme.as_str())
            .authority(self.target.authority.as_str())
            .path_and_query(path_and_query.as_str())
            .build()
            .map_err(|e| RouterError::InternalError {
                message: format!("Failed to build upstream URI for {}: {}", self.url, e),
            })?;

        *req.uri_mut() = uri;

        if let Ok(host) = HeaderValue::from_str(&self.target.authority) {
            req.headers_mut().insert(HOST, host);
        }

        Ok(())
    }
}

/// Join two URL paths with exactly one slash between them.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for Backend {}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backend").field(&self.url).finish()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

impl Serialize for Backend {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.url)
    }
}

impl<'de> Deserialize<'de> for Backend {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let url = String::deserialize(deserializer)?;
        Backend::new(&url).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(HOST, "canary.example.com")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_rejects_malformed_urls() {
        for url in ["", "not a url", "/relative/path", "ftp://files.example.com", "http://"] {
            let err = Backend::new(url).unwrap_err();
            assert!(
                matches!(err, RouterError::InvalidBackendUrl { .. }),
                "{} should be rejected",
                url
            );
        }
    }

    #[test]
    fn test_serializes_as_bare_url() {
        let mut table = BTreeMap::new();
        table.insert("900".to_string(), Backend::new("http://host-a:9000").unwrap());

        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(json, r#"{"900":"http://host-a:9000"}"#);

        let back: BTreeMap<String, Backend> = serde_json::from_str(&json).unwrap();
        assert_eq!(back["900"].url(), "http://host-a:9000");
        assert_eq!(back["900"].authority(), "host-a:9000");
    }

    #[test]
    fn test_deserialize_rejects_bad_url() {
        let result: std::result::Result<Backend, _> = serde_json::from_str(r#""nope""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_direct_rewrites_uri_and_host() {
        let backend = Backend::new("http://host-b:9001").unwrap();
        let mut req = request("/app.js?revision=901");

        backend.direct(&mut req).unwrap();

        assert_eq!(req.uri().to_string(), "http://host-b:9001/app.js?revision=901");
        assert_eq!(req.headers()[HOST], "host-b:9001");
    }

    #[test]
    fn test_direct_joins_base_path_and_query() {
        let backend = Backend::new("https://static.example.com/releases/?token=abc").unwrap();

        let mut req = request("/css/site.css?v=2");
        backend.direct(&mut req).unwrap();
        assert_eq!(
            req.uri().to_string(),
            "https://static.example.com/releases/css/site.css?token=abc&v=2"
        );

        let mut root = request("/");
        backend.direct(&mut root).unwrap();
        assert_eq!(root.uri().to_string(), "https://static.example.com/releases/?token=abc");
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/a"), "/a");
        assert_eq!(join_paths("/base", "/a"), "/base/a");
        assert_eq!(join_paths("/base/", "a"), "/base/a");
        assert_eq!(join_paths("/base", "a"), "/base/a");
    }
}
