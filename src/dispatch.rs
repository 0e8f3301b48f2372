//! Request dispatch.
//!
//! Forwards a request to its final backend and hands the upstream response back
//! unbuffered: hyper writes each body frame to the client as soon as it arrives, and a
//! client hanging up drops the upstream body, which releases the connection.

use crate::{backend::Backend, probe::Transport};
use hyper::{
    header::{HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE},
    Body, HeaderMap, Request, Response, StatusCode,
};
use metrics::counter;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tracing::{error, warn};

/// Headers that only make sense for a single hop.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Strip hop-by-hop headers, including any named by `Connection`.
pub(crate) fn remove_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, client_ip),
        None => client_ip.to_string(),
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
    }
}

/// Short plain-text response generated by the router itself.
pub fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Forwards requests to a chosen backend. No retries, no buffering.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Send `req` to `backend`. Whatever the upstream answers is passed through; a
    /// transport failure becomes `502 Bad Gateway`.
    pub async fn dispatch(
        &self,
        mut req: Request<Body>,
        backend: &Backend,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        remove_hop_headers(req.headers_mut());
        if let Some(addr) = client_addr {
            append_forwarded_for(req.headers_mut(), addr.ip());
        }

        if let Err(e) = backend.direct(&mut req) {
            error!("Failed to rewrite request for {}: {}", backend, e);
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n");
        }

        match self.transport.round_trip(req).await {
            Ok(mut response) => {
                remove_hop_headers(response.headers_mut());
                response
            }
            Err(e) => {
                warn!("Upstream {} failed: {}", backend, e);
                counter!("router.upstream.error", 1);
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n")
            }
        }
    }
}
