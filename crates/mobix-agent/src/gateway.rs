//! Host service API seen by agents
//!
//! The embedding middleware implements [`Gateway`]; typed agents receive it
//! directly and untyped agents reach it through the host facade.

use mobix_proto::{Call, DriverData, HostResponse, Notify, UpDevice};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by the host middleware
#[derive(Debug, Clone, Error)]
#[error("Gateway error: {0}")]
pub struct GatewayError(pub String);

impl GatewayError {
    /// Create a gateway error
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Receiver of event notifications
pub trait EventListener: Send + Sync {
    /// Called for every event the listener is registered for
    fn handle_event(&self, event: &Notify);
}

/// Service-invocation API of the host middleware
pub trait Gateway: Send + Sync {
    /// Call a service, addressing it with a prepared [`Call`]
    fn call_service(&self, device: &UpDevice, call: &Call) -> Result<HostResponse, GatewayError>;

    /// Call a service, addressing a specific driver instance and security type
    fn call_service_full(
        &self,
        device: &UpDevice,
        service: &str,
        driver: &str,
        instance_id: &str,
        security_type: &str,
        parameters: &Map<String, Value>,
    ) -> Result<HostResponse, GatewayError>;

    /// Register `listener` for `event_key` of `driver` on `device`
    fn register(
        &self,
        listener: Arc<dyn EventListener>,
        device: &UpDevice,
        driver: &str,
        event_key: &str,
    ) -> Result<(), GatewayError>;

    /// Register `listener` for `event_key` of one driver instance
    fn register_full(
        &self,
        listener: Arc<dyn EventListener>,
        device: &UpDevice,
        driver: &str,
        instance_id: &str,
        event_key: &str,
    ) -> Result<(), GatewayError>;

    /// Drop every registration of `listener`
    fn unregister(&self, listener: &Arc<dyn EventListener>) -> Result<(), GatewayError>;

    /// Drop the registrations of `listener` matching the given filters
    fn unregister_full(
        &self,
        listener: &Arc<dyn EventListener>,
        device: Option<&UpDevice>,
        driver: Option<&str>,
        instance_id: Option<&str>,
        event_key: Option<&str>,
    ) -> Result<(), GatewayError>;

    /// Send an event notification to `device`
    fn notify(&self, notify: &Notify, device: &UpDevice) -> Result<(), GatewayError>;

    /// The device this node runs on
    fn current_device(&self) -> UpDevice;

    /// Known driver instances, optionally filtered by driver name
    fn list_drivers(&self, driver_name: Option<&str>) -> Vec<DriverData>;
}
