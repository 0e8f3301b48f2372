//! Backend availability probing.
//!
//! A probe replays the inbound request against a backend as a `HEAD`, through the same
//! rewrite the dispatcher applies, and reports whether the backend answered `200 OK`
//! within the probe timeout. Nothing is written to the client and no shared state is
//! touched; the transport is injected so probing can run without a live upstream.

use crate::{backend::Backend, dispatch::remove_hop_headers, error::RouterError, Result};
use async_trait::async_trait;
use hyper::{client::HttpConnector, Body, Client, HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use metrics::counter;
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Sends one already-rewritten request upstream and returns the streaming response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>>;
}

/// Pooled hyper client speaking HTTP/1.1 over plain TCP or TLS.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HyperTransport {
    pub fn new() -> Self {
        let https_connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(100)
            .build(https_connector);

        Self { client }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>> {
        Ok(self.client.request(req).await?)
    }
}

/// The parts of an inbound request a probe is built from.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestDescriptor {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
        }
    }

    /// Body-less `HEAD` copy of the request, pointed at `backend`.
    fn probe_request(&self, backend: &Backend) -> Result<Request<Body>> {
        let mut req = Request::builder()
            .method(Method::HEAD)
            .uri(self.uri.clone())
            .body(Body::empty())
            .map_err(|e| RouterError::InternalError {
                message: format!("Failed to build probe request: {}", e),
            })?;

        *req.headers_mut() = self.headers.clone();
        remove_hop_headers(req.headers_mut());
        backend.direct(&mut req)?;

        Ok(req)
    }
}

/// Cheap "has a file extension" check: a `.` somewhere in the last six bytes of the path.
pub fn looks_like_static_asset(path: &str) -> bool {
    let bytes = path.as_bytes();
    let start = bytes.len().saturating_sub(6);
    bytes[start..].contains(&b'.')
}

/// Only `GET`s for static assets are eligible for failover.
pub fn is_failover_candidate(method: &Method, path: &str) -> bool {
    method == Method::GET && looks_like_static_asset(path)
}

/// Checks whether a backend can serve a request.
#[derive(Clone)]
pub struct Prober {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl Prober {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Status the backend answers a `HEAD` replay of `request` with.
    pub async fn probe(&self, backend: &Backend, request: &RequestDescriptor) -> Result<StatusCode> {
        let probe = request.probe_request(backend)?;

        let response = timeout(self.timeout, self.transport.round_trip(probe))
            .await
            .map_err(|_| RouterError::ProbeTimeout {
                backend: backend.url().to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;

        Ok(response.status())
    }

    /// `true` iff the probe completed and the backend answered `200 OK`.
    pub async fn is_available(&self, backend: &Backend, request: &RequestDescriptor) -> bool {
        match self.probe(backend, request).await {
            Ok(status) if status == StatusCode::OK => true,
            Ok(status) => {
                debug!("Probe of {}{} returned {}", backend, request.uri.path(), status);
                counter!("router.probe.unavailable", 1);
                false
            }
            Err(e) => {
                warn!("Probe of {}{} failed: {}", backend, request.uri.path(), e);
                counter!("router.probe.unavailable", 1);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::{
        collections::{HashMap, HashSet},
        sync::Mutex,
    };

    /// Seen by a [`FakeTransport`]: method, full URI and headers.
    pub type SeenRequest = (Method, String, HeaderMap);

    /// In-memory upstreams keyed by authority. Unknown authorities refuse connections.
    #[derive(Default)]
    pub struct FakeTransport {
        statuses: HashMap<String, StatusCode>,
        hanging: HashSet<String>,
        seen: Mutex<Vec<SeenRequest>>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_status(mut self, authority: &str, status: StatusCode) -> Self {
            self.statuses.insert(authority.to_string(), status);
            self
        }

        pub fn hanging(mut self, authority: &str) -> Self {
            self.hanging.insert(authority.to_string());
            self
        }

        pub fn seen(&self) -> Vec<SeenRequest> {
            self.seen.lock().unwrap().clone()
        }

        /// `(method, uri)` pairs, in arrival order.
        pub fn calls(&self) -> Vec<(Method, String)> {
            self.seen()
                .into_iter()
                .map(|(method, uri, _)| (method, uri))
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>> {
            let authority = req
                .uri()
                .authority()
                .map(|a| a.to_string())
                .unwrap_or_default();

            self.seen.lock().unwrap().push((
                req.method().clone(),
                req.uri().to_string(),
                req.headers().clone(),
            ));

            if self.hanging.contains(&authority) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }

            match self.statuses.get(&authority) {
                Some(status) => Ok(Response::builder()
                    .status(*status)
                    .body(Body::from(format!("served by {}", authority)))
                    .unwrap()),
                None => Err(RouterError::UpstreamError {
                    message: format!("connection refused: {}", authority),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeTransport;
    use super::*;
    use hyper::header::{CONNECTION, COOKIE, HOST};

    fn descriptor(method: Method, uri: &str) -> RequestDescriptor {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, "canary.example.com")
            .header(COOKIE, "revision=901")
            .header(CONNECTION, "keep-alive")
            .body(Body::empty())
            .unwrap();
        RequestDescriptor::from_request(&req)
    }

    fn prober(transport: Arc<FakeTransport>) -> Prober {
        Prober::new(transport, Duration::from_millis(100))
    }

    #[test]
    fn test_static_asset_heuristic() {
        assert!(looks_like_static_asset("/app.js"));
        assert!(looks_like_static_asset("/assets/site.css"));
        assert!(looks_like_static_asset("/data/config.json"));
        assert!(looks_like_static_asset("/a.b"));
        assert!(!looks_like_static_asset("/"));
        assert!(!looks_like_static_asset("/api/users"));
        assert!(!looks_like_static_asset("/releases/v12345"));
        // Approximate by construction: a dotted directory close to the end still matches.
        assert!(looks_like_static_asset("/v1.2/x"));
    }

    #[test]
    fn test_failover_candidates() {
        assert!(is_failover_candidate(&Method::GET, "/app.js"));
        assert!(!is_failover_candidate(&Method::POST, "/app.js"));
        assert!(!is_failover_candidate(&Method::HEAD, "/app.js"));
        assert!(!is_failover_candidate(&Method::GET, "/"));
    }

    #[tokio::test]
    async fn test_available_only_on_ok() {
        let transport = Arc::new(
            FakeTransport::new()
                .with_status("host-a", StatusCode::OK)
                .with_status("host-b", StatusCode::NOT_FOUND)
                .with_status("host-c", StatusCode::NO_CONTENT),
        );
        let prober = prober(transport.clone());
        let request = descriptor(Method::GET, "/app.js");

        assert!(prober.is_available(&Backend::new("http://host-a").unwrap(), &request).await);
        assert!(!prober.is_available(&Backend::new("http://host-b").unwrap(), &request).await);
        assert!(!prober.is_available(&Backend::new("http://host-c").unwrap(), &request).await);
        assert!(!prober.is_available(&Backend::new("http://host-d").unwrap(), &request).await);
    }

    #[tokio::test]
    async fn test_probe_is_a_rewritten_head() {
        let transport = Arc::new(FakeTransport::new().with_status("host-b:9001", StatusCode::OK));
        let prober = prober(transport.clone());
        let backend = Backend::new("http://host-b:9001").unwrap();

        let request = descriptor(Method::GET, "/static/app.js?revision=901");
        assert!(prober.is_available(&backend, &request).await);

        let seen = transport.seen();
        assert_eq!(seen.len(), 1);
        let (method, uri, headers) = &seen[0];
        assert_eq!(*method, Method::HEAD);
        assert_eq!(uri, "http://host-b:9001/static/app.js?revision=901");
        assert_eq!(headers[HOST], "host-b:9001");
        assert_eq!(headers[COOKIE], "revision=901");
        assert!(headers.get(CONNECTION).is_none());

        // The original descriptor is untouched.
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.headers[HOST], "canary.example.com");
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        let transport = Arc::new(FakeTransport::new().hanging("host-slow").with_status("host-slow", StatusCode::OK));
        let prober = Prober::new(transport, Duration::from_millis(50));
        let backend = Backend::new("http://host-slow").unwrap();
        let request = descriptor(Method::GET, "/app.js");

        let err = prober.probe(&backend, &request).await.unwrap_err();
        assert!(matches!(err, RouterError::ProbeTimeout { timeout_ms: 50, .. }));
        assert!(!prober.is_available(&backend, &request).await);
    }
}
