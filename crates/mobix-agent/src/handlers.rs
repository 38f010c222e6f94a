//! Handlers for the execution driver services

use crate::driver::ExecutionDriver;
use crate::script::ScriptError;
use crate::service::Handler;
use anyhow::Result;
use async_trait::async_trait;
use mobix_proto::{ChannelSet, ErrorCode, ErrorDetails, Request, Response};
use std::sync::Arc;
use tracing::debug;

fn wrong_request(handler: &str, request: &Request) -> Response {
    Response::error(
        request.id(),
        ErrorDetails::new(
            ErrorCode::Unsupported,
            format!("{} cannot handle {} requests", handler, request.service()),
        ),
    )
}

/// Handler for `remoteExecution`
pub struct RemoteExecutionHandler {
    driver: Arc<ExecutionDriver>,
}

impl RemoteExecutionHandler {
    /// Create a handler running scripts on `driver`
    pub fn new(driver: Arc<ExecutionDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl Handler for RemoteExecutionHandler {
    async fn handle(&self, request: Request, _channels: ChannelSet) -> Result<Response> {
        match request {
            Request::RemoteExecution { id, code, parameters } => {
                debug!("Remote execution request {} ({} bytes of code)", id, code.len());
                match self.driver.remote_execution(code, parameters).await {
                    Ok(value) => Ok(Response::ExecutionResult { request_id: id, value }),
                    Err(e @ ScriptError::Execution(_)) => Ok(Response::error(
                        id,
                        ErrorDetails::new(ErrorCode::ScriptFailed, e.to_string()),
                    )),
                    Err(e) => Err(e.into()),
                }
            }
            other => Ok(wrong_request("RemoteExecutionHandler", &other)),
        }
    }
}

/// Handler for `executeAgent`
pub struct ExecuteAgentHandler {
    driver: Arc<ExecutionDriver>,
}

impl ExecuteAgentHandler {
    /// Create a handler accepting agents on `driver`
    pub fn new(driver: Arc<ExecutionDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl Handler for ExecuteAgentHandler {
    async fn handle(&self, request: Request, mut channels: ChannelSet) -> Result<Response> {
        match request {
            Request::ExecuteAgent { id, class, jar } => {
                match self.driver.execute_agent(class, jar, &mut channels) {
                    Ok(_) => Ok(Response::AgentAccepted { request_id: id }),
                    Err(e) => Ok(Response::error(id, ErrorDetails::from(&e))),
                }
            }
            other => Ok(wrong_request("ExecuteAgentHandler", &other)),
        }
    }
}

/// Handler for `listKnownClasses`
pub struct ListKnownClassesHandler {
    driver: Arc<ExecutionDriver>,
}

impl ListKnownClassesHandler {
    /// Create a handler listing the classes of `driver`
    pub fn new(driver: Arc<ExecutionDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl Handler for ListKnownClassesHandler {
    async fn handle(&self, request: Request, _channels: ChannelSet) -> Result<Response> {
        match request {
            Request::ListKnownClasses { id } => Ok(Response::KnownClasses {
                request_id: id,
                classes: self.driver.list_known_classes(),
            }),
            other => Ok(wrong_request("ListKnownClassesHandler", &other)),
        }
    }
}
