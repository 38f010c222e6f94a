//! # Mobix Agent
//!
//! The code-mobility execution driver. A remote caller can run a Lua script
//! with session-scoped parameters, or transfer a serialized agent (and the
//! classes it needs) to be rebuilt and run here.

#![warn(missing_docs)]

/// Script sessions and the embedded Lua interpreter
pub mod script;

/// Host service API seen by agents
pub mod gateway;

/// Map-call adapter over the host gateway
pub mod facade;

/// Transferred agent execution
pub mod executor;

/// Service name to handler dispatch
pub mod service;

/// Handlers for the execution driver services
pub mod handlers;

/// The execution driver
pub mod driver;

/// Tracing setup
pub mod telemetry;

pub use driver::{DriverConfig, ExecutionDriver};
pub use executor::{Agent, AgentExecutor, AgentReport, Dispatch, ExecutorConfig, ExecutorError, NativeClassTable};
pub use facade::{FacadeConfig, FacadeError, HostFacade, ScratchScope};
pub use gateway::{EventListener, Gateway, GatewayError};
pub use script::{ScriptConfig, ScriptEngine, ScriptError, SessionRetention, SessionStore};
pub use service::{Handler, ServiceTable};
