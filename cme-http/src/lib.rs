//! Smart-HTTP backend for the change management engine
//!
//! Serves each object type's repository to git clients beneath the type's
//! path (`/device/cme/...`, `/policy/cme/...`), so nodes can clone, fetch
//! and push over plain HTTP(S).

pub mod handlers;
pub mod pktline;
pub mod routes;

pub use handlers::{HttpBody, HttpResponse, full};
pub use routes::{RouteTable, Service, Target, parse_prefix};

use bytes::Bytes;
use hyper::Request;
use hyper::body::Body;
use std::sync::Arc;

use cme_core::{CmeError, Engine};

/// Largest RPC request body accepted, before and after inflating.
pub const DEFAULT_MAX_BODY_SIZE: usize = 100 * 1024 * 1024; // 100 MB

/// Smart-HTTP request handler
pub struct SmartHttpHandler {
    engine: Arc<Engine>,
    routes: RouteTable,
    max_body_size: usize,
}

impl SmartHttpHandler {
    pub fn new(engine: Arc<Engine>) -> Result<Self, HttpError> {
        let routes = RouteTable::new().map_err(|e| HttpError::Internal(e.to_string()))?;
        Ok(Self {
            engine,
            routes,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        })
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Handle an incoming HTTP request
    pub async fn handle<B>(&self, req: Request<B>) -> Result<HttpResponse, HttpError>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let path = req.uri().path().to_string();
        tracing::debug!("{} {} {:?}", req.method(), path, req.version());

        let Some(route) = self.routes.resolve(&path) else {
            return handlers::not_found();
        };
        if req.method() != route.service.method() {
            return handlers::method_not_allowed(req.version());
        }
        let Some(target) = parse_prefix(route.prefix) else {
            return handlers::not_found();
        };

        // Pushes may target a type whose repository does not exist yet.
        let dir = match self.engine.ensure_repo(target.object_type).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::info!("No repository for {}: {}", target.object_type, e);
                return handlers::not_found();
            }
        };

        match route.service {
            Service::UploadPack | Service::ReceivePack => {
                handlers::service_rpc(
                    &self.engine,
                    &target,
                    &dir,
                    route.service,
                    req,
                    self.max_body_size,
                )
                .await
            }
            Service::InfoRefs => {
                handlers::info_refs(&self.engine, &target, &dir, req.uri().query(), route.file).await
            }
            service => handlers::static_file(service, &dir, route.file).await,
        }
    }
}

/// Smart-HTTP errors
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Packet payload of {0} bytes exceeds the packet-line limit")]
    PacketTooLong(usize),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Engine error: {0}")]
    Engine(#[from] CmeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}
