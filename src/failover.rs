//! Static-asset failover.
//!
//! When a `GET` for something that looks like a static asset resolves to a backend that
//! cannot serve it, every other registered backend is probed in revision-key order and
//! the first one answering `200 OK` takes the request instead.

use crate::{
    backend::Backend,
    probe::{is_failover_candidate, Prober, RequestDescriptor},
    tables::RoutingTables,
};
use metrics::counter;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a failover check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Not a candidate for failover, or the resolved backend passed its probe.
    Chosen,
    /// The resolved backend failed; `backend`, registered for `revision`, can serve.
    Rerouted { revision: String, backend: Backend },
    /// The resolved backend failed and nothing else can serve; use it anyway.
    Exhausted,
}

impl Selection {
    /// Backend the request should finally go to.
    pub fn backend<'a>(&'a self, chosen: &'a Backend) -> &'a Backend {
        match self {
            Selection::Rerouted { backend, .. } => backend,
            Selection::Chosen | Selection::Exhausted => chosen,
        }
    }
}

#[derive(Clone)]
pub struct FailoverSelector {
    tables: Arc<RoutingTables>,
    prober: Prober,
}

impl FailoverSelector {
    pub fn new(tables: Arc<RoutingTables>, prober: Prober) -> Self {
        Self { tables, prober }
    }

    pub async fn select(&self, chosen: &Backend, request: &RequestDescriptor) -> Selection {
        if !is_failover_candidate(&request.method, request.uri.path()) {
            return Selection::Chosen;
        }

        if self.prober.is_available(chosen, request).await {
            return Selection::Chosen;
        }

        counter!("router.failover.triggered", 1);

        match self.find_available(chosen, request).await {
            Some((revision, backend)) => {
                info!(
                    "Rerouting {} from {} to revision '{}' ({})",
                    request.uri.path(),
                    chosen,
                    revision,
                    backend
                );
                counter!("router.failover.rerouted", 1);
                Selection::Rerouted { revision, backend }
            }
            None => {
                warn!(
                    "No backend can serve {}; falling through to {}",
                    request.uri.path(),
                    chosen
                );
                Selection::Exhausted
            }
        }
    }

    /// First registered backend, by revision key, that can serve `request`. Backends
    /// with the same URL as `failed` are skipped since they were just probed.
    pub async fn find_available(
        &self,
        failed: &Backend,
        request: &RequestDescriptor,
    ) -> Option<(String, Backend)> {
        for (revision, backend) in self.tables.backends_by_revision() {
            if &backend == failed {
                continue;
            }
            if self.prober.is_available(&backend, request).await {
                return Some((revision, backend));
            }
        }
        None
    }
}
