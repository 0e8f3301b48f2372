//! Data-plane listener.
//!
//! Every request is resolved to a backend, possibly rerouted by static-asset failover,
//! and dispatched. `/api/lb/subdomain` and `/api/lb/version` are admin endpoints served
//! directly on this listener.

use crate::{
    admin,
    dispatch::{text_response, Dispatcher},
    error::RouterError,
    failover::{FailoverSelector, Selection},
    probe::{is_failover_candidate, Prober, RequestDescriptor, Transport},
    resolve::{Resolution, Resolver, RoutingHints},
    tables::RoutingTables,
    Result,
};
use hyper::{
    header::{HeaderValue, SET_COOKIE},
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use metrics::counter;
use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Body of the page served when no backend can be resolved.
pub const UNAVAILABLE_BODY: &str = "Service unavailable!\n";

/// Everything a data-plane request needs, cheap to clone per connection.
#[derive(Clone)]
pub struct ProxyContext {
    resolver: Resolver,
    failover: FailoverSelector,
    dispatcher: Dispatcher,
}

impl ProxyContext {
    pub fn new(
        tables: Arc<RoutingTables>,
        transport: Arc<dyn Transport>,
        probe_timeout: Duration,
    ) -> Self {
        let prober = Prober::new(transport.clone(), probe_timeout);
        Self {
            resolver: Resolver::new(tables.clone()),
            failover: FailoverSelector::new(tables, prober),
            dispatcher: Dispatcher::new(transport),
        }
    }

    pub fn tables(&self) -> &Arc<RoutingTables> {
        self.resolver.tables()
    }

    /// Handle one data-plane request.
    pub async fn handle(&self, req: Request<Body>, client_addr: Option<SocketAddr>) -> Response<Body> {
        if let Some(table) = admin::lb_table(req.uri().path()) {
            return admin::handle_request(table, self.tables(), req).await;
        }

        counter!("router.requests", 1);

        let route = match self.resolver.resolve(&RoutingHints::from_request(&req)) {
            Resolution::Routed(route) => route,
            Resolution::Unavailable { revision } => {
                warn!("{}", RouterError::ServiceUnavailable { revision });
                counter!("router.unavailable", 1);
                return text_response(StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_BODY);
            }
        };

        let selection = if is_failover_candidate(req.method(), req.uri().path()) {
            let descriptor = RequestDescriptor::from_request(&req);
            self.failover.select(&route.backend, &descriptor).await
        } else {
            Selection::Chosen
        };

        let backend = selection.backend(&route.backend);
        let mut response = self.dispatcher.dispatch(req, backend, client_addr).await;

        for cookie in &route.cookies {
            if let Ok(value) = HeaderValue::from_str(&cookie.header_value()) {
                response.headers_mut().append(SET_COOKIE, value);
            }
        }

        response
    }
}

/// Bind the data-plane listener. The returned future serves until `shutdown` resolves.
pub fn serve_proxy<S>(
    addr: SocketAddr,
    ctx: ProxyContext,
    shutdown: S,
) -> Result<(SocketAddr, impl Future<Output = Result<()>>)>
where
    S: Future<Output = ()> + Send + 'static,
{
    let make_service = make_service_fn(move |conn: &AddrStream| {
        let ctx = ctx.clone();
        let remote_addr = conn.remote_addr();

        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let ctx = ctx.clone();
                let span = info_span!(
                    "request",
                    id = %Uuid::new_v4(),
                    method = %req.method(),
                    path = %req.uri().path(),
                );

                async move { Ok::<_, Infallible>(ctx.handle(req, Some(remote_addr)).await) }
                    .instrument(span)
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| RouterError::BindError {
            address: addr.to_string(),
            reason: e.to_string(),
        })?
        .serve(make_service);

    let bound = server.local_addr();
    info!("Proxy listening on {}", bound);

    let server = server.with_graceful_shutdown(shutdown);
    Ok((bound, async move {
        server.await.map_err(|e| RouterError::InternalError {
            message: format!("Proxy server error: {}", e),
        })
    }))
}
