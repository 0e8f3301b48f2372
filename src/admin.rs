// src/admin.rs - Administrative API over the routing tables
use crate::{
    error::{utils::missing_field, RouterError},
    tables::{RoutingTables, Table},
    Result,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{pin_mut, Stream, StreamExt};
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    Body, Method, Request, Response, StatusCode,
};
use metrics::counter;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    net::SocketAddr,
    sync::Arc,
};
use tracing::{debug, error, info};
use warp::{Filter, Rejection, Reply};

/// Data-plane alias of the subdomain table.
pub const LB_SUBDOMAIN_PATH: &str = "/api/lb/subdomain";

/// Data-plane alias of the version table.
pub const LB_VERSION_PATH: &str = "/api/lb/version";

/// Table exposed at `path` on the data-plane listener, if any.
pub fn lb_table(path: &str) -> Option<Table> {
    match path {
        LB_SUBDOMAIN_PATH => Some(Table::SubdomainVersion),
        LB_VERSION_PATH => Some(Table::VersionRevision),
        _ => None,
    }
}

/// Largest form body an admin request may carry.
pub const MAX_FORM_BYTES: usize = 16 * 1024;

pub type Fields = HashMap<String, String>;

/// Read a request body, giving up as soon as it grows past [`MAX_FORM_BYTES`].
pub async fn read_form_body<S, B, E>(body: S) -> Result<Bytes>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: Buf,
    E: fmt::Display,
{
    pin_mut!(body);

    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| RouterError::InvalidRequest {
            message: format!("Failed to read body: {}", e),
        })?;
        if buf.len() + chunk.remaining() > MAX_FORM_BYTES {
            return Err(RouterError::PayloadTooLarge {
                limit: MAX_FORM_BYTES,
            });
        }
        buf.put(chunk);
    }

    Ok(buf.freeze())
}

/// Collect form fields the way an HTML form handler would: the query string always, the
/// urlencoded body for `POST` only, body values winning. The first occurrence of a name
/// wins within each source.
pub fn parse_fields(method: &Method, query: &str, body: &[u8]) -> Fields {
    let mut fields = Fields::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        fields.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }

    if method == Method::POST {
        let mut posted = Fields::new();
        for (key, value) in url::form_urlencoded::parse(body) {
            posted.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }
        fields.extend(posted);
    }

    fields
}

fn required<'a>(fields: &'a Fields, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| missing_field(name))
}

fn json_response<T: serde::Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(json) => {
            let mut response = Response::new(Body::from(json));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to encode table: {}", e);
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn error_response(err: &RouterError) -> Response<Body> {
    let status = StatusCode::from_u16(err.http_status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(format!("{}\n", err)));
    *response.status_mut() = status;
    response
}

/// Apply one admin request to `table`.
pub fn handle_table(
    table: Table,
    tables: &RoutingTables,
    method: &Method,
    fields: &Fields,
) -> Response<Body> {
    let result = match *method {
        Method::GET => Ok(handle_get(table, tables, fields)),
        Method::POST => handle_upsert(table, tables, fields),
        Method::DELETE => handle_delete(table, tables, fields),
        _ => Ok(status_response(StatusCode::METHOD_NOT_ALLOWED)),
    };

    result.unwrap_or_else(|e| error_response(&e))
}

/// GET: the whole table, or a single-entry map when the key field is supplied.
fn handle_get(table: Table, tables: &RoutingTables, fields: &Fields) -> Response<Body> {
    match required(fields, table.key_field()) {
        Ok(key) => {
            let entry: BTreeMap<&str, String> = tables
                .get(table, key)
                .map(|value| (key, value))
                .into_iter()
                .collect();
            json_response(&entry)
        }
        Err(_) => json_response(&tables.snapshot(table)),
    }
}

/// POST: insert or overwrite one entry.
fn handle_upsert(table: Table, tables: &RoutingTables, fields: &Fields) -> Result<Response<Body>> {
    let key = required(fields, table.key_field())?;
    let value = required(fields, table.value_field())?;

    tables.set(table, key, value)?;

    info!("{}: set '{}' -> '{}'", table, key, value);
    counter!("admin.mutations", 1, "table" => table.name());
    Ok(status_response(StatusCode::NO_CONTENT))
}

/// DELETE: remove one entry. Deleting an absent key still succeeds.
fn handle_delete(table: Table, tables: &RoutingTables, fields: &Fields) -> Result<Response<Body>> {
    let key = required(fields, table.key_field())?;

    if tables.delete(table, key) {
        info!("{}: deleted '{}'", table, key);
    }
    counter!("admin.mutations", 1, "table" => table.name());
    Ok(status_response(StatusCode::NO_CONTENT))
}

/// Read the body (`POST` only) and apply the request to `table`.
async fn respond<S, B, E>(
    table: Table,
    tables: &RoutingTables,
    method: &Method,
    query: &str,
    body: S,
) -> Response<Body>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: Buf,
    E: fmt::Display,
{
    let body = if method == Method::POST {
        match read_form_body(body).await {
            Ok(body) => body,
            Err(e) => {
                debug!("Rejected {} request body: {}", table, e);
                return error_response(&e);
            }
        }
    } else {
        Bytes::new()
    };

    let fields = parse_fields(method, query, &body);
    handle_table(table, tables, method, &fields)
}

/// Serve an admin request that arrived as a raw hyper request.
pub async fn handle_request(
    table: Table,
    tables: &RoutingTables,
    req: Request<Body>,
) -> Response<Body> {
    let (parts, body) = req.into_parts();
    respond(table, tables, &parts.method, parts.uri.query().unwrap_or(""), body).await
}

fn table_endpoint(
    table: Table,
    tables: Arc<RoutingTables>,
) -> impl Filter<Extract = (Response<Body>,), Error = Rejection> + Clone {
    warp::method()
        .and(
            warp::filters::query::raw()
                .or(warp::any().map(String::new))
                .unify(),
        )
        .and(warp::body::stream())
        .and_then(move |method: Method, query: String, body| {
            let tables = tables.clone();
            async move {
                Ok::<_, Rejection>(respond(table, &tables, &method, &query, body).await)
            }
        })
}

/// Admin listener routes: `/sv`, `/vr` and `/rp`.
pub fn admin_routes(
    tables: Arc<RoutingTables>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let subdomains = warp::path(Table::SubdomainVersion.name())
        .and(warp::path::end())
        .and(table_endpoint(Table::SubdomainVersion, tables.clone()));

    let versions = warp::path(Table::VersionRevision.name())
        .and(warp::path::end())
        .and(table_endpoint(Table::VersionRevision, tables.clone()));

    let revisions = warp::path(Table::RevisionBackend.name())
        .and(warp::path::end())
        .and(table_endpoint(Table::RevisionBackend, tables));

    subdomains
        .or(versions)
        .unify()
        .or(revisions)
        .unify()
        .with(warp::log("revision_router::admin"))
}

/// Bind the admin listener. The returned future runs the server until `shutdown` resolves.
pub fn serve_admin<S>(
    addr: SocketAddr,
    tables: Arc<RoutingTables>,
    shutdown: S,
) -> Result<(SocketAddr, impl Future<Output = ()>)>
where
    S: Future<Output = ()> + Send + 'static,
{
    let (bound, server) = warp::serve(admin_routes(tables))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| RouterError::BindError {
            address: addr.to_string(),
            reason: e.to_string(),
        })?;

    info!("Admin API listening on {}", bound);
    Ok((bound, server))
}
