//! Host domain types exchanged with the middleware
//!
//! These are the values the host's service API speaks in. Untyped agents
//! never see them directly: they cross the facade boundary as plain
//! string-keyed maps through [`MapForm`], so the key names below are part of
//! the contract.

use crate::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Conversion between a host type and its plain-map form
pub trait MapForm: Serialize + DeserializeOwned {
    /// Convert into a generic value
    fn to_value(&self) -> Result<Value, ProtocolError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild from a generic value
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(value)?)
    }
}

impl<T: Serialize + DeserializeOwned> MapForm for T {}

/// Network interface a device is reachable through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpNetworkInterface {
    /// Address on that network
    pub network_address: String,
    /// Network technology
    pub net_type: String,
}

/// A device on the smart space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpDevice {
    /// Device name
    pub name: String,
    /// Reachable interfaces
    #[serde(default)]
    pub networks: Vec<UpNetworkInterface>,
}

impl UpDevice {
    /// Create a device without interfaces
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            networks: Vec::new(),
        }
    }

    /// Add a network interface
    pub fn with_network(mut self, address: impl Into<String>, net_type: impl Into<String>) -> Self {
        self.networks.push(UpNetworkInterface {
            network_address: address.into(),
            net_type: net_type.into(),
        });
        self
    }
}

/// A service call addressed to a driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    /// Target driver
    pub driver: String,
    /// Target service
    pub service: String,
    /// Target driver instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Security type negotiated for the call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_type: Option<String>,
    /// Call parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Call {
    /// Create a call to `service` on `driver`
    pub fn new(driver: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            service: service.into(),
            instance_id: None,
            security_type: None,
            parameters: Map::new(),
        }
    }

    /// Address a specific driver instance
    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Add a parameter
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Response to a service call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResponse {
    /// Returned parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Error reported by the remote driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostResponse {
    /// Add a parameter
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Event notification sent to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notify {
    /// Key identifying the event
    pub event_key: String,
    /// Emitting driver
    pub driver: String,
    /// Emitting driver instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Event payload
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Description of a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpDriver {
    /// Driver name
    pub name: String,
    /// Services offered
    #[serde(default)]
    pub services: Vec<String>,
    /// Events emitted
    #[serde(default)]
    pub events: Vec<String>,
}

impl UpDriver {
    /// Create a driver description without services
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            services: Vec::new(),
            events: Vec::new(),
        }
    }
}

/// A driver instance running on some device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverData {
    /// Driver description
    pub driver: UpDriver,
    /// Hosting device
    pub device: UpDevice,
    /// Instance identifier
    #[serde(rename = "instanceID")]
    pub instance_id: String,
}
