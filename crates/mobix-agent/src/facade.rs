//! Map-call adapter over the host gateway
//!
//! Untyped agents cannot link against the host API, so the facade exposes it
//! as `put(operation, args)` / `get(operation)` on plain maps. Operation
//! names the facade does not recognize address a scratch map instead, which
//! agents use to leave values behind for the host or for each other.

use crate::gateway::{EventListener, Gateway, GatewayError};
use mobix_classes::HostBridge;
use mobix_proto::{Call, MapForm, Notify, ProtocolError, UpDevice};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use thiserror::Error;
use tracing::{debug, trace};

/// Facade errors
#[derive(Debug, Error)]
pub enum FacadeError {
    /// Arguments missing or of the wrong shape
    #[error("Invalid arguments for {operation}: {reason}")]
    InvalidArguments {
        /// Operation being invoked
        operation: String,
        /// What was wrong
        reason: String,
    },

    /// No listener bound under that name
    #[error("Unknown listener: {0}")]
    UnknownListener(String),

    /// The gateway refused the call
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// A host value could not be converted
    #[error(transparent)]
    Conversion(#[from] ProtocolError),
}

/// Which scratch map a facade writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScratchScope {
    /// One map shared by every facade in the process
    #[default]
    Global,
    /// A map private to the facade and its clones
    Isolated,
}

/// Facade configuration
#[derive(Debug, Clone)]
pub struct FacadeConfig {
    /// Scratch map scope
    pub scope: ScratchScope,
    /// Maximum scratch entries before the oldest key is evicted
    pub scratch_capacity: usize,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            scope: ScratchScope::Global,
            scratch_capacity: 4096,
        }
    }
}

impl FacadeConfig {
    /// Set the scratch scope
    pub fn with_scope(mut self, scope: ScratchScope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the scratch capacity
    pub fn with_scratch_capacity(mut self, capacity: usize) -> Self {
        self.scratch_capacity = capacity;
        self
    }
}

#[derive(Debug, Default)]
struct Scratch {
    values: HashMap<String, Value>,
    order: VecDeque<String>,
}

impl Scratch {
    fn insert(&mut self, key: &str, value: Value, capacity: usize) -> Option<Value> {
        let previous = self.values.insert(key.to_string(), value);
        if previous.is_none() {
            self.order.push_back(key.to_string());
            while self.values.len() > capacity.max(1) {
                match self.order.pop_front() {
                    Some(oldest) => {
                        trace!("Evicted scratch key {}", oldest);
                        self.values.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
        previous
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }
}

type SharedScratch = Arc<Mutex<Scratch>>;

fn global_scratch() -> SharedScratch {
    static GLOBAL: OnceLock<SharedScratch> = OnceLock::new();
    Arc::clone(GLOBAL.get_or_init(SharedScratch::default))
}

/// Operations the facade translates into gateway calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    CallService,
    RegisterForEvent,
    UnregisterForEvent,
    SendEventNotify,
    GetCurrentDevice,
    ListDrivers,
}

impl Operation {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "callService" => Some(Self::CallService),
            "registerForEvent" => Some(Self::RegisterForEvent),
            "unregisterForEvent" => Some(Self::UnregisterForEvent),
            "sendEventNotify" => Some(Self::SendEventNotify),
            "getCurrentDevice" => Some(Self::GetCurrentDevice),
            "listDrivers" => Some(Self::ListDrivers),
            _ => None,
        }
    }
}

/// Arguments of one facade call
struct Args<'a> {
    operation: &'a str,
    map: Map<String, Value>,
}

impl<'a> Args<'a> {
    fn new(operation: &'a str, args: Value) -> Result<Self, FacadeError> {
        let map = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(FacadeError::InvalidArguments {
                    operation: operation.to_string(),
                    reason: format!("expected a map, got {}", other),
                })
            }
        };
        Ok(Self { operation, map })
    }

    fn has(&self, key: &str) -> bool {
        matches!(self.map.get(key), Some(value) if !value.is_null())
    }

    fn optional<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, FacadeError> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| self.invalid(format!("{}: {}", key, e))),
        }
    }

    fn required<T: DeserializeOwned>(&self, key: &str) -> Result<T, FacadeError> {
        self.optional(key)?
            .ok_or_else(|| self.invalid(format!("missing {}", key)))
    }

    /// Driver name of an event call, `driverName` accepted as an alias of `driver`
    fn event_driver(&self) -> Result<Option<String>, FacadeError> {
        match self.optional("driver")? {
            Some(driver) => Ok(Some(driver)),
            None => self.optional("driverName"),
        }
    }

    fn parameters(&self) -> Result<Map<String, Value>, FacadeError> {
        Ok(self.optional("parameters")?.unwrap_or_default())
    }

    fn invalid(&self, reason: String) -> FacadeError {
        FacadeError::InvalidArguments {
            operation: self.operation.to_string(),
            reason,
        }
    }
}

/// Map-call adapter over a [`Gateway`]
#[derive(Clone)]
pub struct HostFacade {
    gateway: Arc<dyn Gateway>,
    scratch: SharedScratch,
    scratch_capacity: usize,
    listeners: Arc<Mutex<HashMap<String, Arc<dyn EventListener>>>>,
}

impl std::fmt::Debug for HostFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFacade")
            .field("scratch_capacity", &self.scratch_capacity)
            .finish_non_exhaustive()
    }
}

impl HostFacade {
    /// Create a facade with the default configuration
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self::with_config(gateway, &FacadeConfig::default())
    }

    /// Create a facade with a custom configuration
    pub fn with_config(gateway: Arc<dyn Gateway>, config: &FacadeConfig) -> Self {
        let scratch = match config.scope {
            ScratchScope::Global => global_scratch(),
            ScratchScope::Isolated => SharedScratch::default(),
        };
        Self {
            gateway,
            scratch,
            scratch_capacity: config.scratch_capacity,
            listeners: Arc::default(),
        }
    }

    /// The wrapped gateway
    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    /// Make `listener` addressable by `name` in event registrations
    pub fn bind_listener(&self, name: impl Into<String>, listener: Arc<dyn EventListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), listener);
    }

    /// Invoke `operation` with `args`.
    ///
    /// Unrecognized operations store `args` in the scratch map and return
    /// the value they replaced, or null.
    pub fn put(&self, operation: &str, args: Value) -> Result<Value, FacadeError> {
        let Some(op) = Operation::from_name(operation) else {
            return Ok(self.store(operation, args));
        };
        debug!("Facade put {}", operation);
        let args = Args::new(operation, args)?;

        match op {
            Operation::CallService => self.call_service(&args),
            Operation::RegisterForEvent => self.register_for_event(&args),
            Operation::UnregisterForEvent => self.unregister_for_event(&args),
            Operation::SendEventNotify => {
                let notify: Notify = args.required("notify")?;
                let device: UpDevice = args.required("device")?;
                self.gateway.notify(&notify, &device)?;
                Ok(Value::Null)
            }
            Operation::GetCurrentDevice => Ok(self.gateway.current_device().to_value()?),
            Operation::ListDrivers => {
                let driver: Option<String> = args.optional("driverName")?;
                self.list_drivers(driver.as_deref())
            }
        }
    }

    /// Read `operation`: the current device, every driver, or a scratch value
    pub fn get(&self, operation: &str) -> Result<Value, FacadeError> {
        match Operation::from_name(operation) {
            Some(Operation::GetCurrentDevice) => Ok(self.gateway.current_device().to_value()?),
            Some(Operation::ListDrivers) => self.list_drivers(None),
            _ => Ok(self
                .scratch
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(operation)
                .unwrap_or(Value::Null)),
        }
    }

    fn store(&self, key: &str, value: Value) -> Value {
        trace!("Facade scratch put {}", key);
        self.scratch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value, self.scratch_capacity)
            .unwrap_or(Value::Null)
    }

    fn call_service(&self, args: &Args<'_>) -> Result<Value, FacadeError> {
        let device: UpDevice = args.required("device")?;

        let full_form = ["serviceName", "driverName", "instanceId", "securityType"]
            .iter()
            .all(|key| args.has(key));
        let response = if full_form {
            let service: String = args.required("serviceName")?;
            let driver: String = args.required("driverName")?;
            let instance: String = args.required("instanceId")?;
            let security: String = args.required("securityType")?;
            self.gateway.call_service_full(
                &device,
                &service,
                &driver,
                &instance,
                &security,
                &args.parameters()?,
            )?
        } else {
            let call = match args.optional::<Call>("serviceCall")? {
                Some(call) => call,
                None => Call {
                    driver: args.required("driverName")?,
                    service: args.required("serviceName")?,
                    instance_id: args.optional("instanceId")?,
                    security_type: args.optional("securityType")?,
                    parameters: args.parameters()?,
                },
            };
            self.gateway.call_service(&device, &call)?
        };

        Ok(response.to_value()?)
    }

    fn register_for_event(&self, args: &Args<'_>) -> Result<Value, FacadeError> {
        let listener = self.listener(args)?;
        let device: UpDevice = args.required("device")?;
        let driver = args
            .event_driver()?
            .ok_or_else(|| args.invalid("missing driver".to_string()))?;
        let event_key: String = args.required("eventKey")?;

        match args.optional::<String>("instanceId")? {
            Some(instance) => self
                .gateway
                .register_full(listener, &device, &driver, &instance, &event_key)?,
            None => self.gateway.register(listener, &device, &driver, &event_key)?,
        }
        Ok(Value::Null)
    }

    fn unregister_for_event(&self, args: &Args<'_>) -> Result<Value, FacadeError> {
        let listener = self.listener(args)?;

        let filtered = ["device", "driver", "driverName", "instanceId", "eventKey"]
            .iter()
            .any(|key| args.has(key));
        if filtered {
            let device: Option<UpDevice> = args.optional("device")?;
            let driver = args.event_driver()?;
            let instance: Option<String> = args.optional("instanceId")?;
            let event_key: Option<String> = args.optional("eventKey")?;
            self.gateway.unregister_full(
                &listener,
                device.as_ref(),
                driver.as_deref(),
                instance.as_deref(),
                event_key.as_deref(),
            )?;
        } else {
            self.gateway.unregister(&listener)?;
        }
        Ok(Value::Null)
    }

    fn list_drivers(&self, driver: Option<&str>) -> Result<Value, FacadeError> {
        let drivers = self
            .gateway
            .list_drivers(driver)
            .iter()
            .map(MapForm::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Array(drivers))
    }

    fn listener(&self, args: &Args<'_>) -> Result<Arc<dyn EventListener>, FacadeError> {
        let name: String = args.required("listener")?;
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned()
            .ok_or(FacadeError::UnknownListener(name))
    }
}

impl HostBridge for HostFacade {
    fn put(&mut self, op: &str, args: Value) -> Result<Value, String> {
        HostFacade::put(self, op, args).map_err(|e| e.to_string())
    }

    fn get(&mut self, op: &str) -> Result<Value, String> {
        HostFacade::get(self, op).map_err(|e| e.to_string())
    }
}
