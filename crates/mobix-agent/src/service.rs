//! Service name to handler dispatch

use anyhow::Result;
use mobix_proto::{ChannelSet, ErrorCode, ErrorDetails, Request, Response};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Message returned when a handler fails unexpectedly
pub const UNEXPECTED_ERROR: &str = "Something unexpected happened.";

/// Handler trait for processing requests
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Handle a request and its data channels
    async fn handle(&self, request: Request, channels: ChannelSet) -> Result<Response>;
}

/// Table of handlers by service name
#[derive(Default)]
pub struct ServiceTable {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl ServiceTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `service`
    pub async fn register_handler(&self, service: impl Into<String>, handler: Arc<dyn Handler>) {
        let service = service.into();
        debug!("Registered handler for service: {}", service);
        self.handlers.write().await.insert(service, handler);
    }

    /// Sorted names of registered services
    pub async fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        services.sort();
        services
    }

    /// Route `request` to the handler registered for `service`
    pub async fn dispatch(&self, service: &str, request: Request, channels: ChannelSet) -> Response {
        let request_id = request.id();
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(service).cloned()
        };

        match handler {
            Some(handler) => match handler.handle(request, channels).await {
                Ok(response) => response,
                Err(e) => {
                    error!("Handler error for {} request {}: {:#}", service, request_id, e);
                    Response::error(request_id, ErrorDetails::new(ErrorCode::InternalError, UNEXPECTED_ERROR))
                }
            },
            None => {
                warn!("No handler registered for service: {}", service);
                Response::error(
                    request_id,
                    ErrorDetails::new(ErrorCode::Unsupported, format!("Unsupported service: {}", service)),
                )
            }
        }
    }

    /// Route `request` by its own service name
    pub async fn handle(&self, request: Request, channels: ChannelSet) -> Response {
        let service = request.service();
        self.dispatch(service, request, channels).await
    }
}
