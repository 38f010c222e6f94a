//! Message types and enums

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Request message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Evaluate a script with session-scoped parameters
    RemoteExecution {
        /// Request ID for correlation
        id: Uuid,
        /// Script source
        code: String,
        /// Free-form parameters, readable from the script with `get(key)`
        parameters: Map<String, Value>,
    },

    /// Execute an agent carried on channel 0
    ExecuteAgent {
        /// Request ID for correlation
        id: Uuid,
        /// Class name of the definition carried on channel 1
        class: Option<String>,
        /// Channel 1 carries a class archive instead of a single class
        jar: bool,
    },

    /// List the names of dynamically loaded classes
    ListKnownClasses {
        /// Request ID for correlation
        id: Uuid,
    },
}

impl Request {
    /// Get the request ID
    pub fn id(&self) -> Uuid {
        match self {
            Self::RemoteExecution { id, .. } => *id,
            Self::ExecuteAgent { id, .. } => *id,
            Self::ListKnownClasses { id } => *id,
        }
    }

    /// Name of the service this request is addressed to
    pub fn service(&self) -> &'static str {
        match self {
            Self::RemoteExecution { .. } => "remoteExecution",
            Self::ExecuteAgent { .. } => "executeAgent",
            Self::ListKnownClasses { .. } => "listKnownClasses",
        }
    }

    /// Create a script execution request
    pub fn remote_execution(code: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self::RemoteExecution {
            id: Uuid::new_v4(),
            code: code.into(),
            parameters,
        }
    }

    /// Create an agent execution request
    pub fn execute_agent(class: Option<String>, jar: bool) -> Self {
        Self::ExecuteAgent {
            id: Uuid::new_v4(),
            class,
            jar,
        }
    }

    /// Create a class listing request
    pub fn list_known_classes() -> Self {
        Self::ListKnownClasses { id: Uuid::new_v4() }
    }
}

/// Response message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Script execution result
    ExecutionResult {
        /// Request ID this responds to
        request_id: Uuid,
        /// Last value the script stored under "value"
        value: Option<Value>,
    },

    /// Agent transfer accepted; execution continues in the background
    AgentAccepted {
        /// Request ID this responds to
        request_id: Uuid,
    },

    /// Known class listing
    KnownClasses {
        /// Request ID this responds to
        request_id: Uuid,
        /// Sorted class names
        classes: Vec<String>,
    },

    /// Error response
    Error {
        /// Request ID this responds to
        request_id: Uuid,
        /// Error details
        error: ErrorDetails,
    },
}

impl Response {
    /// Get the request ID this response corresponds to
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::ExecutionResult { request_id, .. } => *request_id,
            Self::AgentAccepted { request_id } => *request_id,
            Self::KnownClasses { request_id, .. } => *request_id,
            Self::Error { request_id, .. } => *request_id,
        }
    }

    /// Create an error response
    pub fn error(request_id: Uuid, error: ErrorDetails) -> Self {
        Self::Error { request_id, error }
    }

    /// Error details, if this is an error response
    pub fn error_details(&self) -> Option<&ErrorDetails> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Error details for error responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
}

/// Error codes for different types of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Invalid request format or missing mandatory input
    InvalidRequest,
    /// Script evaluation failed
    ScriptFailed,
    /// Class loading failed
    LoadFailed,
    /// Timeout occurred
    Timeout,
    /// Internal server error
    InternalError,
    /// Unsupported operation
    Unsupported,
    /// Resource exhausted
    ResourceExhausted,
}

impl ErrorDetails {
    /// Create a new error details
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
