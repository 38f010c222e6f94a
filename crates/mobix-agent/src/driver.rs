//! The execution driver
//!
//! [`ExecutionDriver`] ties the class registry, script engine and agent
//! executor together and exposes them as the three driver services.

use crate::executor::{AgentExecutor, AgentReport, ExecutorConfig, ExecutorError, NativeClassTable};
use crate::facade::{FacadeConfig, HostFacade};
use crate::gateway::Gateway;
use crate::handlers::{ExecuteAgentHandler, ListKnownClassesHandler, RemoteExecutionHandler};
use crate::script::{ScriptConfig, ScriptEngine, ScriptError};
use crate::service::ServiceTable;
use mobix_classes::{ClassError, ClassRegistry, ClassRuntime, ClassRuntimeConfig, RegistryConfig};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Driver name as announced to the middleware
pub const DRIVER_NAME: &str = "uos.ExecutionDriver";

/// Services the driver offers
pub const SERVICES: [&str; 3] = ["remoteExecution", "executeAgent", "listKnownClasses"];

/// Configuration for every driver component
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    /// Class registry configuration
    pub registry: RegistryConfig,
    /// Class runtime configuration
    pub runtime: ClassRuntimeConfig,
    /// Script engine configuration
    pub script: ScriptConfig,
    /// Agent executor configuration
    pub executor: ExecutorConfig,
    /// Host facade configuration
    pub facade: FacadeConfig,
}

impl DriverConfig {
    /// Set the registry configuration
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Set the class runtime configuration
    pub fn with_runtime(mut self, runtime: ClassRuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Set the script configuration
    pub fn with_script(mut self, script: ScriptConfig) -> Self {
        self.script = script;
        self
    }

    /// Set the executor configuration
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Set the facade configuration
    pub fn with_facade(mut self, facade: FacadeConfig) -> Self {
        self.facade = facade;
        self
    }
}

/// Code-mobility driver: script execution, agent transfer and class listing
#[derive(Debug)]
pub struct ExecutionDriver {
    registry: Arc<ClassRegistry>,
    scripts: Arc<ScriptEngine>,
    executor: AgentExecutor,
}

impl ExecutionDriver {
    /// Create a driver with default configuration and no native classes
    pub fn new(gateway: Arc<dyn Gateway>) -> Result<Self, ClassError> {
        Self::with_config(gateway, DriverConfig::default(), NativeClassTable::new())
    }

    /// Create a driver
    pub fn with_config(
        gateway: Arc<dyn Gateway>,
        config: DriverConfig,
        natives: NativeClassTable,
    ) -> Result<Self, ClassError> {
        let runtime = Arc::new(ClassRuntime::with_config(config.runtime)?);
        let registry = Arc::new(ClassRegistry::with_config(runtime.engine().clone(), config.registry));
        let facade = HostFacade::with_config(Arc::clone(&gateway), &config.facade);
        let executor = AgentExecutor::new(Arc::clone(&registry), runtime, gateway, config.executor)
            .with_natives(natives)
            .with_facade(facade);

        info!("Execution driver ready ({} services)", SERVICES.len());
        Ok(Self {
            registry,
            scripts: Arc::new(ScriptEngine::new(config.script)),
            executor,
        })
    }

    /// Report every finished agent transfer to `reports`
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<AgentReport>) -> Self {
        self.executor = self.executor.with_reports(reports);
        self
    }

    /// Dynamically loaded classes
    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }

    /// Script engine
    pub fn scripts(&self) -> &Arc<ScriptEngine> {
        &self.scripts
    }

    /// Agent executor
    pub fn executor(&self) -> &AgentExecutor {
        &self.executor
    }

    /// Run a script to completion on a blocking worker
    pub async fn remote_execution(
        &self,
        code: String,
        parameters: Map<String, Value>,
    ) -> Result<Option<Value>, ScriptError> {
        let scripts = Arc::clone(&self.scripts);
        match tokio::task::spawn_blocking(move || scripts.execute(&code, &parameters)).await {
            Ok(result) => result,
            Err(e) => Err(ScriptError::Execution(format!("script worker failed: {}", e))),
        }
    }

    /// Accept an agent transfer
    pub fn execute_agent(
        &self,
        class: Option<String>,
        jar: bool,
        channels: &mut mobix_proto::ChannelSet,
    ) -> Result<JoinHandle<()>, ExecutorError> {
        self.executor.execute_agent(class, jar, channels)
    }

    /// Sorted names of resolvable dynamically loaded classes
    pub fn list_known_classes(&self) -> Vec<String> {
        self.registry.list_known()
    }

    /// Service table routing the driver services to `driver`
    pub async fn service_table(driver: &Arc<Self>) -> ServiceTable {
        let table = ServiceTable::new();
        table
            .register_handler(SERVICES[0], Arc::new(RemoteExecutionHandler::new(Arc::clone(driver))))
            .await;
        table
            .register_handler(SERVICES[1], Arc::new(ExecuteAgentHandler::new(Arc::clone(driver))))
            .await;
        table
            .register_handler(SERVICES[2], Arc::new(ListKnownClassesHandler::new(Arc::clone(driver))))
            .await;
        table
    }
}
