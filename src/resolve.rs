//! Request resolution.
//!
//! Turns the routing hints carried by a request (path, host, `version`/`revision`
//! query parameters and cookies) into a revision and then a backend. Entry-point
//! requests select a *version*; every other request selects a *revision* directly so a
//! client session stays on the revision it entered with.

use crate::{
    backend::Backend,
    tables::{RoutingTables, STABLE_VERSION},
};
use hyper::{
    header::{COOKIE, HOST},
    HeaderMap, Request,
};
use std::sync::Arc;
use tracing::debug;

/// The only path on which a version, rather than a revision, is selected.
pub const ENTRY_POINT: &str = "/";

/// Query parameter and cookie naming a version.
pub const VERSION_KEY: &str = "version";

/// Query parameter and cookie naming a revision.
pub const REVISION_KEY: &str = "revision";

pub fn is_entry_point(path: &str) -> bool {
    path == ENTRY_POINT
}

/// Leftmost label of `host`, or an empty string when the host has no `.`.
pub fn subdomain(host: &str) -> &str {
    match host.find('.') {
        Some(index) => &host[..index],
        None => "",
    }
}

/// Routing-relevant metadata extracted from an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingHints {
    pub path: String,
    pub host: String,
    pub version_param: Option<String>,
    pub revision_param: Option<String>,
    pub version_cookie: Option<String>,
    pub revision_cookie: Option<String>,
}

impl RoutingHints {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let query = req.uri().query().unwrap_or("");

        Self {
            path: req.uri().path().to_string(),
            host,
            version_param: query_param(query, VERSION_KEY),
            revision_param: query_param(query, REVISION_KEY),
            version_cookie: cookie(req.headers(), VERSION_KEY),
            revision_cookie: cookie(req.headers(), REVISION_KEY),
        }
    }
}

/// First value of `name` in a raw query string; empty values count as absent.
fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// First cookie called `name`; empty values count as absent.
fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .find_map(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some(key), Some(value)) if key == name => {
                    Some(value.trim_matches('"').to_string())
                }
                _ => None,
            }
        })
        .filter(|value| !value.is_empty())
}

/// Where the routing decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    QueryParam,
    Cookie,
    Subdomain,
    Stable,
}

/// A cookie the response must set to keep the client pinned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityCookie {
    pub name: &'static str,
    pub value: String,
}

impl AffinityCookie {
    /// `Set-Cookie` value. Characters outside the RFC 6265 cookie-octet set are dropped
    /// from the value, so it can never carry attributes of its own.
    pub fn header_value(&self) -> String {
        let value: String = self.value.chars().filter(|c| is_cookie_octet(*c)).collect();
        format!("{}={}; Path=/", self.name, value)
    }
}

fn is_cookie_octet(c: char) -> bool {
    matches!(c, '\x21' | '\x23'..='\x2b' | '\x2d'..='\x3a' | '\x3c'..='\x5b' | '\x5d'..='\x7e')
}

/// A request that can be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Revision the request asked for. Its backend may be stable's if it has none.
    pub revision: String,
    pub backend: Backend,
    pub source: Source,
    pub cookies: Vec<AffinityCookie>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Routed(Route),
    /// Neither the requested revision nor stable's has a backend.
    Unavailable { revision: String },
}

/// Resolves requests against the shared routing tables.
#[derive(Debug, Clone)]
pub struct Resolver {
    tables: Arc<RoutingTables>,
}

impl Resolver {
    pub fn new(tables: Arc<RoutingTables>) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &Arc<RoutingTables> {
        &self.tables
    }

    /// Revision mapped to `version`, or stable's revision when `version` is unmapped.
    pub fn revision_for_version(&self, version: &str) -> Option<String> {
        self.tables
            .revision_for_version(version)
            .filter(|r| !r.is_empty())
            .or_else(|| {
                self.tables
                    .revision_for_version(STABLE_VERSION)
                    .filter(|r| !r.is_empty())
            })
    }

    /// Backend of `revision`, or stable's backend when `revision` has none.
    pub fn backend_for_revision(&self, revision: &str) -> Option<Backend> {
        self.tables.backend_for_revision(revision).or_else(|| {
            self.tables
                .revision_for_version(STABLE_VERSION)
                .and_then(|stable| self.tables.backend_for_revision(&stable))
        })
    }

    fn subdomain_version(&self, host: &str) -> Option<String> {
        self.tables
            .version_for_subdomain(subdomain(host))
            .filter(|v| !v.is_empty())
    }

    pub fn resolve(&self, hints: &RoutingHints) -> Resolution {
        let (revision, source, cookies) = if is_entry_point(&hints.path) {
            self.resolve_entry_point(hints)
        } else {
            let (revision, source) = self.resolve_revision(hints);
            (revision, source, Vec::new())
        };

        let revision = revision.unwrap_or_default();

        match self.backend_for_revision(&revision) {
            Some(backend) => {
                debug!(
                    "Resolved {} (host '{}') to revision '{}' via {:?} -> {}",
                    hints.path, hints.host, revision, source, backend
                );
                Resolution::Routed(Route {
                    revision,
                    backend,
                    source,
                    cookies,
                })
            }
            None => {
                debug!(
                    "No backend for {} (host '{}', revision '{}')",
                    hints.path, hints.host, revision
                );
                Resolution::Unavailable { revision }
            }
        }
    }

    /// Version selection for the entry point: param, then cookie, then subdomain.
    fn resolve_entry_point(
        &self,
        hints: &RoutingHints,
    ) -> (Option<String>, Source, Vec<AffinityCookie>) {
        let mut cookies = Vec::new();

        let (version, source) = if let Some(version) = &hints.version_param {
            cookies.push(AffinityCookie {
                name: VERSION_KEY,
                value: version.clone(),
            });
            (version.clone(), Source::QueryParam)
        } else if let Some(version) = &hints.version_cookie {
            (version.clone(), Source::Cookie)
        } else if let Some(version) = self.subdomain_version(&hints.host) {
            (version, Source::Subdomain)
        } else {
            (String::new(), Source::Stable)
        };

        let revision = self.revision_for_version(&version);

        cookies.push(AffinityCookie {
            name: REVISION_KEY,
            value: revision.clone().unwrap_or_default(),
        });

        (revision, source, cookies)
    }

    /// Revision selection for every other path: param, cookie, subdomain, stable.
    fn resolve_revision(&self, hints: &RoutingHints) -> (Option<String>, Source) {
        if let Some(revision) = &hints.revision_param {
            return (Some(revision.clone()), Source::QueryParam);
        }
        if let Some(revision) = &hints.revision_cookie {
            return (Some(revision.clone()), Source::Cookie);
        }
        if let Some(version) = self.subdomain_version(&hints.host) {
            if let Some(revision) = self.revision_for_version(&version) {
                return (Some(revision), Source::Subdomain);
            }
        }
        (self.revision_for_version(STABLE_VERSION), Source::Stable)
    }
}
