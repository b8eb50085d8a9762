//! Connection id → local URL, fixed for the lifetime of a session.

use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

/// One (source, connection) pair this process serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub connection_id: String,
    pub connection_name: String,
    pub source_id: String,
    pub source_name: String,
    /// Public ingest URL of the source, when the control plane reports one.
    pub source_url: Option<String>,
    /// Base every inbound path is appended to.
    pub local: Url,
}

impl Route {
    /// The URL an inbound `path` and `query` are replayed against: the local
    /// base path followed by the inbound path.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.local.clone();
        let base = self.local.path().trim_end_matches('/');
        let joined = if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        };
        url.set_path(&joined);
        url.set_query(query.filter(|q| !q.is_empty()));
        url
    }
}

/// What the bootstrapper learned about one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionBinding {
    pub connection_id: String,
    pub connection_name: String,
    pub source_id: String,
    pub source_name: String,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Arc<Route>>,
}

impl RouteTable {
    /// Every binding is served from the same local base.
    pub fn build(bindings: &[ConnectionBinding], local: &Url) -> Self {
        let routes = bindings
            .iter()
            .map(|binding| {
                let route = Route {
                    connection_id: binding.connection_id.clone(),
                    connection_name: binding.connection_name.clone(),
                    source_id: binding.source_id.clone(),
                    source_name: binding.source_name.clone(),
                    source_url: binding.source_url.clone(),
                    local: local.clone(),
                };
                (binding.connection_id.clone(), Arc::new(route))
            })
            .collect();
        Self { routes }
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Route>> {
        self.routes.get(connection_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.routes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Routes ordered by source then connection name, for display.
    pub fn sorted(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<_> = self.routes.values().cloned().collect();
        routes.sort_by(|a, b| {
            (a.source_name.as_str(), a.connection_name.as_str())
                .cmp(&(b.source_name.as_str(), b.connection_name.as_str()))
        });
        routes
    }
}
