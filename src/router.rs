//! Message routing and the ante handler seam.

use crate::app::types::RequestQuery;
use crate::context::Context;
use crate::error::Result;
use crate::tx::{Msg, MsgResult, Tx};
use std::collections::HashMap;
use std::sync::Arc;

/// Module logic for one message type.
pub type MsgHandler = Arc<dyn Fn(&mut Context, &dyn Msg) -> Result<MsgResult> + Send + Sync>;

/// Per-transaction pre-processing: gas limit, signatures, sequence, fees.
///
/// Runs against its own branch; the branch is merged only when this returns
/// `Ok`. Priority and mempool callbacks are communicated through the context.
pub trait AnteHandler: Send + Sync {
    fn ante(&self, ctx: &mut Context, tx: &dyn Tx, simulate: bool) -> Result<()>;
}

impl<F> AnteHandler for F
where
    F: Fn(&mut Context, &dyn Tx, bool) -> Result<()> + Send + Sync,
{
    fn ante(&self, ctx: &mut Context, tx: &dyn Tx, simulate: bool) -> Result<()> {
        self(ctx, tx, simulate)
    }
}

/// Handlers keyed by exact message type.
#[derive(Clone, Default)]
pub struct MsgServiceRouter {
    routes: HashMap<String, MsgHandler>,
}

impl MsgServiceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// If a handler for `type_url` is already registered.
    pub fn register(&mut self, type_url: &str, handler: MsgHandler) {
        if self.routes.insert(type_url.to_string(), handler).is_some() {
            panic!("message handler for {type_url} already registered");
        }
    }

    pub fn handler(&self, msg: &dyn Msg) -> Option<&MsgHandler> {
        self.routes.get(msg.type_url())
    }
}

/// Handlers keyed by legacy route string, consulted after the exact-type miss.
#[derive(Clone, Default)]
pub struct LegacyRouter {
    routes: HashMap<String, MsgHandler>,
}

impl LegacyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// If the route is empty or already registered.
    pub fn add_route(&mut self, route: &str, handler: MsgHandler) {
        if route.is_empty() || !route.chars().all(|c| c.is_ascii_alphanumeric()) {
            panic!("route expressions can only contain alphanumeric characters, got {route:?}");
        }
        if self.routes.insert(route.to_string(), handler).is_some() {
            panic!("route {route} has already been initialized");
        }
    }

    pub fn route(&self, path: &str) -> Option<&MsgHandler> {
        self.routes.get(path)
    }
}

/// Custom query handler; receives the path segments after its route.
pub type Querier = Arc<dyn Fn(&Context, &[&str], &RequestQuery) -> Result<Vec<u8>> + Send + Sync>;

/// Queriers keyed by the second segment of a `/custom/...` path.
#[derive(Clone, Default)]
pub struct QueryRouter {
    routes: HashMap<String, Querier>,
}

impl QueryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// If the route is not alphanumeric or already registered.
    pub fn add_route(&mut self, route: &str, querier: Querier) {
        if route.is_empty() || !route.chars().all(|c| c.is_ascii_alphanumeric()) {
            panic!("route expressions can only contain alphanumeric characters, got {route:?}");
        }
        if self.routes.insert(route.to_string(), querier).is_some() {
            panic!("route {route} has already been initialized");
        }
    }

    pub fn route(&self, path: &str) -> Option<&Querier> {
        self.routes.get(path)
    }
}
