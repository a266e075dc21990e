//! ABCI Query: `/app`, `/store` and `/custom` paths.

use super::types::{RequestQuery, ResponseQuery};
use super::BaseApp;
use crate::context::{Context, ExecMode, Header};
use crate::error::{Error, Result};
use crate::recovery::panic_to_error;
use crate::store::StoreKey;
use serde_json::json;
use std::panic::{self, AssertUnwindSafe};
use tracing::debug;

fn split_path(path: &str) -> Vec<&str> {
    path.trim_start_matches('/').split('/').collect()
}

impl BaseApp {
    /// Answers a query. Height `0` means the latest committed height; panics
    /// in queriers become error responses.
    pub fn query(&self, req: &RequestQuery) -> ResponseQuery {
        let mut req = req.clone();
        if req.height == 0 {
            req.height = self.last_block_height();
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.route_query(&req)))
            .unwrap_or_else(|payload| Err(panic_to_error(payload)));
        match result {
            Ok(res) => res,
            Err(err) => {
                debug!(path = %req.path, height = req.height, %err, "query failed");
                ResponseQuery {
                    height: req.height,
                    ..ResponseQuery::from_error(&err)
                }
            }
        }
    }

    fn route_query(&self, req: &RequestQuery) -> Result<ResponseQuery> {
        let path = split_path(&req.path);
        match path[0] {
            "app" => self.query_app(req, &path),
            "store" => self.query_store(req, &path),
            "custom" => self.query_custom(req, &path),
            _ => Err(Error::UnknownRequest(format!("unknown query path {}", req.path))),
        }
    }

    fn query_app(&self, req: &RequestQuery, path: &[&str]) -> Result<ResponseQuery> {
        let Some(&what) = path.get(1) else {
            return Err(Error::UnknownRequest(
                "expected second parameter to be either 'simulate', 'version' or 'snapshots', neither was present"
                    .into(),
            ));
        };

        let value = match what {
            "simulate" => {
                let (gas_info, result) = self.simulate(&req.data)?;
                let body = json!({
                    "gas_info": {
                        "gas_wanted": gas_info.gas_wanted,
                        "gas_used": gas_info.gas_used,
                    },
                    "result": {
                        "data": hex::encode(&result.data),
                        "log": result.log,
                        "events": result.events,
                    },
                });
                serde_json::to_vec(&body).map_err(|err| Error::InvalidRequest(err.to_string()))?
            }
            "version" => self.config.version.as_bytes().to_vec(),
            "snapshots" => serde_json::to_vec(&self.list_snapshots().snapshots)
                .map_err(|err| Error::InvalidRequest(err.to_string()))?,
            _ => return Err(Error::UnknownRequest(format!("unknown query: {}", req.path))),
        };

        Ok(ResponseQuery {
            value,
            height: req.height,
            ..ResponseQuery::default()
        })
    }

    /// `/store/<name>/key` with the key in `data`.
    fn query_store(&self, req: &RequestQuery, path: &[&str]) -> Result<ResponseQuery> {
        let (Some(&name), Some(&"key")) = (path.get(1), path.get(2)) else {
            return Err(Error::UnknownRequest(format!("unexpected query path: {}", req.path)));
        };
        let store = StoreKey::new(name);
        if !self.cms.store_keys().contains(&store) {
            return Err(Error::UnknownRequest(format!("no such store: {name}")));
        }

        let ctx = self.create_query_context(req.height, req.prove)?;
        let value = ctx.store().get(&store, &req.data)?.unwrap_or_default();
        Ok(ResponseQuery {
            key: req.data.clone(),
            value,
            height: req.height,
            ..ResponseQuery::default()
        })
    }

    fn query_custom(&self, req: &RequestQuery, path: &[&str]) -> Result<ResponseQuery> {
        let route = match path.get(1) {
            Some(route) if !route.is_empty() => *route,
            _ => return Err(Error::UnknownRequest("no route for custom query specified".into())),
        };
        let Some(querier) = self.query_router.route(route) else {
            return Err(Error::UnknownRequest(format!(
                "no custom querier found for route {route}"
            )));
        };

        let ctx = self.create_query_context(req.height, req.prove)?;
        let value = querier(&ctx, &path[2..], req)?;
        Ok(ResponseQuery {
            value,
            height: req.height,
            ..ResponseQuery::default()
        })
    }

    /// Read-only context over committed `height`.
    pub fn create_query_context(&self, height: i64, prove: bool) -> Result<Context> {
        if height < 0 {
            return Err(Error::InvalidRequest(
                "cannot query with height < 0; please provide a valid height".into(),
            ));
        }
        let last = self.last_block_height();
        if height > last {
            return Err(Error::InvalidHeight(
                "cannot query with height in the future; please provide a valid height".into(),
            ));
        }
        if height <= 1 && prove {
            return Err(Error::InvalidRequest(
                "cannot query with proof when height <= 1; please provide a valid height".into(),
            ));
        }

        let ms = self.cms.cache_multi_store_with_version(height).map_err(|err| {
            Error::InvalidRequest(format!(
                "failed to load state at height {height}; {err} (latest height: {last})"
            ))
        })?;
        let mut header = self
            .with_check_ctx(|ctx| ctx.header().clone())
            .unwrap_or_else(|| Header {
                chain_id: self.chain_id.clone(),
                ..Header::default()
            });
        header.height = height;

        let mut ctx = Context::new(ms, header, ExecMode::Check);
        if let Some(params) = self.with_check_ctx(|ctx| ctx.consensus_params().cloned()).flatten() {
            ctx.set_consensus_params(Some(std::sync::Arc::new(params)));
        }
        Ok(ctx)
    }
}
