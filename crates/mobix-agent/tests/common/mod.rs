//! Shared fixtures for driver integration tests

#![allow(dead_code)]

use mobix_agent::{EventListener, Gateway, GatewayError};
use mobix_proto::{Call, DriverData, HostResponse, Notify, UpDevice, UpDriver};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

/// Gateway call as observed by [`RecordingGateway`]
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Short { driver: String, service: String },
    Full { service: String, driver: String, instance: String, security: String },
    Register { event_key: String },
    RegisterFull { instance: String, event_key: String },
}

/// Gateway that records calls and answers from fixed data
#[derive(Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<GatewayCall>>,
}

impl RecordingGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Gateway for RecordingGateway {
    fn call_service(&self, _device: &UpDevice, call: &Call) -> Result<HostResponse, GatewayError> {
        self.record(GatewayCall::Short {
            driver: call.driver.clone(),
            service: call.service.clone(),
        });
        Ok(HostResponse::default().with_parameter("status", "short"))
    }

    fn call_service_full(
        &self,
        _device: &UpDevice,
        service: &str,
        driver: &str,
        instance_id: &str,
        security_type: &str,
        parameters: &Map<String, Value>,
    ) -> Result<HostResponse, GatewayError> {
        self.record(GatewayCall::Full {
            service: service.to_string(),
            driver: driver.to_string(),
            instance: instance_id.to_string(),
            security: security_type.to_string(),
        });
        Ok(HostResponse::default()
            .with_parameter("status", "full")
            .with_parameter("echo", Value::Object(parameters.clone())))
    }

    fn register(&self, _listener: Arc<dyn EventListener>, _device: &UpDevice, _driver: &str, event_key: &str) -> Result<(), GatewayError> {
        self.record(GatewayCall::Register {
            event_key: event_key.to_string(),
        });
        Ok(())
    }

    fn register_full(
        &self,
        _listener: Arc<dyn EventListener>,
        _device: &UpDevice,
        _driver: &str,
        instance_id: &str,
        event_key: &str,
    ) -> Result<(), GatewayError> {
        self.record(GatewayCall::RegisterFull {
            instance: instance_id.to_string(),
            event_key: event_key.to_string(),
        });
        Ok(())
    }

    fn unregister(&self, _listener: &Arc<dyn EventListener>) -> Result<(), GatewayError> {
        Ok(())
    }

    fn unregister_full(
        &self,
        _listener: &Arc<dyn EventListener>,
        _device: Option<&UpDevice>,
        _driver: Option<&str>,
        _instance_id: Option<&str>,
        _event_key: Option<&str>,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    fn notify(&self, _notify: &Notify, _device: &UpDevice) -> Result<(), GatewayError> {
        Ok(())
    }

    fn current_device(&self) -> UpDevice {
        UpDevice::new("test-node").with_network("127.0.0.1", "Ethernet:TCP")
    }

    fn list_drivers(&self, driver_name: Option<&str>) -> Vec<DriverData> {
        let data = DriverData {
            driver: UpDriver::new("uos.ExecutionDriver"),
            device: self.current_device(),
            instance_id: "exec-1".to_string(),
        };
        match driver_name {
            Some(name) if name != data.driver.name => Vec::new(),
            _ => vec![data],
        }
    }
}
