//! Dispatch of fetches to per-scheme transports.

use std::collections::HashMap;

use url::Url;

use rescache_core::{Error, FetchId, FetchMsg, FetchRequest, Fetcher};

/// A fetch as known to the transport that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Route {
    transport: usize,
    inner: FetchId,
}

/// Fans fetches out to the first registered transport able to handle them.
///
/// Each transport numbers its fetches independently, so the router hands out
/// its own ids and translates in both directions.
#[derive(Default)]
pub struct SchemeRouter {
    transports: Vec<Box<dyn Fetcher>>,
    next_id: u64,
    routes: HashMap<FetchId, Route>,
    reverse: HashMap<Route, FetchId>,
    /// Fetches that ended during the last poll; kept until the next so their
    /// HTTP code stays readable while the messages are handled.
    retired: Vec<FetchId>,
}

impl SchemeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport. Earlier registrations win.
    pub fn with(mut self, transport: impl Fetcher + 'static) -> Self {
        self.transports.push(Box::new(transport));
        self
    }

    fn forget(&mut self, id: FetchId) -> Option<Route> {
        let route = self.routes.remove(&id)?;
        self.reverse.remove(&route);
        Some(route)
    }
}

fn is_terminal(msg: &FetchMsg) -> bool {
    matches!(msg, FetchMsg::Finished | FetchMsg::TimedOut | FetchMsg::Error(_) | FetchMsg::CertErr | FetchMsg::SslErr)
}

impl Fetcher for SchemeRouter {
    fn can_fetch(&self, url: &Url) -> bool {
        self.transports.iter().any(|t| t.can_fetch(url))
    }

    fn start(&mut self, request: FetchRequest) -> Result<FetchId, Error> {
        let Some(transport) = self.transports.iter().position(|t| t.can_fetch(&request.url)) else {
            return Err(Error::NoFetchHandler(request.url.to_string()));
        };
        let inner = self.transports[transport].start(request)?;

        self.next_id += 1;
        let id = FetchId(self.next_id);
        let route = Route { transport, inner };
        self.routes.insert(id, route);
        self.reverse.insert(route, id);
        Ok(id)
    }

    fn abort(&mut self, id: FetchId) {
        if let Some(route) = self.forget(id) {
            self.transports[route.transport].abort(route.inner);
        }
    }

    fn http_code(&self, id: FetchId) -> u16 {
        self.routes.get(&id).map_or(0, |r| self.transports[r.transport].http_code(r.inner))
    }

    fn poll(&mut self) -> Vec<(FetchId, FetchMsg)> {
        for id in std::mem::take(&mut self.retired) {
            self.forget(id);
        }

        let mut out = Vec::new();
        for transport in 0..self.transports.len() {
            for (inner, msg) in self.transports[transport].poll() {
                let Some(&id) = self.reverse.get(&Route { transport, inner }) else {
                    tracing::debug!(transport, ?inner, "dropping message for unknown fetch");
                    continue;
                };
                if is_terminal(&msg) {
                    self.retired.push(id);
                }
                out.push((id, msg));
            }
        }
        out
    }
}
