//! Transferred agent execution
//!
//! An agent arrives as an [`ObjectStream`] on channel 0, optionally preceded
//! by its class definition (or an archive of them) on channel 1. The caller
//! only learns whether channel 0 was present: everything else happens on a
//! background task that reads both channels to completion, registers the
//! transferred classes, rebuilds the agent and runs it.
//!
//! Class names resolve against the [`ClassRegistry`] first and the
//! [`NativeClassTable`] second. A registry class becomes an untyped agent
//! driven through the host facade; a native class registered as an agent
//! runs directly against the [`Gateway`].

use crate::facade::HostFacade;
use crate::gateway::Gateway;
use mobix_classes::{ClassError, ClassHandle, ClassRegistry, ClassRuntime};
use mobix_proto::{ChannelSet, DataChannel, ErrorCode, ErrorDetails, ObjectStream, ProtocolError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Channel index carrying the serialized agent
pub const OBJECT_CHANNEL: usize = 0;

/// Channel index carrying class definitions
pub const CLASS_CHANNEL: usize = 1;

/// Agent execution errors
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Channel 0 was not attached
    #[error("No data stream, containing agent, was found.")]
    MissingAgentChannel,

    /// A class was named but channel 1 was not attached
    #[error("No data stream, containing class, was found.")]
    MissingClassChannel,

    /// Reading or decoding a transferred unit failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Registering or running a class failed
    #[error(transparent)]
    Class(#[from] ClassError),

    /// A referenced class resolved nowhere
    #[error("Class not found: {0}")]
    ClassNotFound(String),

    /// The rebuilt value is not an agent
    #[error("The informed Agent is not a valid one.")]
    NotAnAgent,

    /// The class is only loadable as an untyped agent, which is disabled
    #[error("Untyped agents are disabled: {0}")]
    UntypedDisabled(String),

    /// The agent state did not fit its native class
    #[error("Failed to rebuild agent {class}: {source}")]
    State {
        /// Native class name
        class: String,
        /// Deserialization failure
        source: serde_json::Error,
    },

    /// A typed agent returned an error
    #[error("Agent failed: {0:#}")]
    Agent(anyhow::Error),

    /// The executor stopped accepting work
    #[error("Executor is shut down")]
    Closed,

    /// A worker task panicked or was cancelled
    #[error("Agent task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<&ExecutorError> for ErrorDetails {
    fn from(error: &ExecutorError) -> Self {
        let code = match error {
            ExecutorError::Protocol(e) => return ErrorDetails::from(e),
            ExecutorError::MissingAgentChannel | ExecutorError::MissingClassChannel => ErrorCode::InvalidRequest,
            ExecutorError::Class(e) if e.is_load_error() => ErrorCode::LoadFailed,
            ExecutorError::ClassNotFound(_) | ExecutorError::NotAnAgent | ExecutorError::State { .. } => {
                ErrorCode::LoadFailed
            }
            ExecutorError::UntypedDisabled(_) => ErrorCode::Unsupported,
            _ => ErrorCode::InternalError,
        };
        ErrorDetails::new(code, error.to_string())
    }
}

/// A natively implemented agent
pub trait Agent: Send {
    /// Run the agent against the host gateway
    fn run(&mut self, gateway: &dyn Gateway) -> anyhow::Result<()>;
}

/// What a native class rebuilds into
pub enum NativeObject {
    /// A runnable agent
    Agent(Box<dyn Agent>),
    /// Plain data that is not an agent
    Data,
}

impl std::fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent(_) => f.write_str("Agent"),
            Self::Data => f.write_str("Data"),
        }
    }
}

type Factory = Box<dyn Fn(Value) -> Result<NativeObject, serde_json::Error> + Send + Sync>;

/// Classes the host provides natively, by name
#[derive(Default)]
pub struct NativeClassTable {
    factories: HashMap<String, Factory>,
}

impl std::fmt::Debug for NativeClassTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("NativeClassTable").field("classes", &names).finish()
    }
}

impl NativeClassTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent type under `name`
    pub fn register_agent<T>(&mut self, name: impl Into<String>) -> &mut Self
    where
        T: Agent + DeserializeOwned + 'static,
    {
        self.factories.insert(
            name.into(),
            Box::new(|state| {
                let agent: T = serde_json::from_value(state)?;
                Ok(NativeObject::Agent(Box::new(agent)))
            }),
        );
        self
    }

    /// Register a plain data type under `name`
    pub fn register_data<T>(&mut self, name: impl Into<String>) -> &mut Self
    where
        T: DeserializeOwned + 'static,
    {
        self.factories.insert(
            name.into(),
            Box::new(|state| {
                serde_json::from_value::<T>(state)?;
                Ok(NativeObject::Data)
            }),
        );
        self
    }

    /// Whether `name` is a native class
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Rebuild a value of class `name` from `state`
    pub fn instantiate(&self, name: &str, state: Value) -> Option<Result<NativeObject, serde_json::Error>> {
        self.factories.get(name).map(|factory| factory(state))
    }
}

/// A class agent waiting to run
#[derive(Debug)]
pub struct UntypedAgent {
    /// Class defining the agent
    pub class: ClassHandle,
    /// Agent state handed to the entry point
    pub state: Value,
}

/// How a rebuilt agent is run
pub enum Dispatch {
    /// Native agent run against the gateway
    Typed(Box<dyn Agent>),
    /// Class agent run through the host facade
    Untyped(UntypedAgent),
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Typed(_) => f.write_str("Typed"),
            Self::Untyped(agent) => f.debug_tuple("Untyped").field(&agent.class.name()).finish(),
        }
    }
}

/// Everything one agent transfer carries
#[derive(Debug)]
pub struct TransferUnit {
    /// Class name accompanying the transfer
    pub class: Option<String>,
    /// Channel 1 carries an archive
    pub jar: bool,
    /// Class definition channel
    pub class_channel: Option<DataChannel>,
    /// Serialized agent channel
    pub object_channel: DataChannel,
}

impl TransferUnit {
    /// Take the channels of one transfer out of `channels`
    pub fn from_channels(class: Option<String>, jar: bool, channels: &mut ChannelSet) -> Result<Self, ExecutorError> {
        let object_channel = channels.take(OBJECT_CHANNEL).ok_or(ExecutorError::MissingAgentChannel)?;
        let class_channel = match &class {
            Some(_) => Some(channels.take(CLASS_CHANNEL).ok_or(ExecutorError::MissingClassChannel)?),
            None => {
                if jar {
                    warn!("Archive flag set without a class name; ignoring channel {}", CLASS_CHANNEL);
                }
                None
            }
        };
        Ok(Self {
            class,
            jar,
            class_channel,
            object_channel,
        })
    }
}

/// Outcome of one background agent run
#[derive(Debug)]
pub struct AgentReport {
    /// Root class of the agent, once decoded
    pub class: Option<String>,
    /// Run result
    pub result: Result<(), ExecutorError>,
}

impl AgentReport {
    /// Whether the agent ran to completion
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-channel read timeout; `None` waits forever
    pub channel_timeout: Option<Duration>,
    /// Largest unit read from a channel
    pub max_unit_size: usize,
    /// Agents running at once
    pub max_concurrent_agents: usize,
    /// Run registry classes as untyped agents
    pub allow_untyped: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            channel_timeout: Some(Duration::from_secs(30)),
            max_unit_size: mobix_proto::MAX_UNIT_SIZE,
            max_concurrent_agents: 16,
            allow_untyped: true,
        }
    }
}

impl ExecutorConfig {
    /// Set or clear the channel timeout
    pub fn with_channel_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.channel_timeout = timeout;
        self
    }

    /// Set the largest unit size
    pub fn with_max_unit_size(mut self, size: usize) -> Self {
        self.max_unit_size = size;
        self
    }

    /// Set the concurrency bound
    pub fn with_max_concurrent_agents(mut self, count: usize) -> Self {
        self.max_concurrent_agents = count;
        self
    }

    /// Enable or disable untyped agents
    pub fn with_untyped(mut self, allowed: bool) -> Self {
        self.allow_untyped = allowed;
        self
    }
}

/// Receives, rebuilds and runs transferred agents
#[derive(Clone)]
pub struct AgentExecutor {
    registry: Arc<ClassRegistry>,
    runtime: Arc<ClassRuntime>,
    natives: Arc<NativeClassTable>,
    gateway: Arc<dyn Gateway>,
    facade: HostFacade,
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    reports: Option<mpsc::UnboundedSender<AgentReport>>,
}

impl std::fmt::Debug for AgentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentExecutor")
            .field("natives", &self.natives)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AgentExecutor {
    /// Create an executor; `registry` must compile with `runtime`'s engine
    pub fn new(
        registry: Arc<ClassRegistry>,
        runtime: Arc<ClassRuntime>,
        gateway: Arc<dyn Gateway>,
        config: ExecutorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_agents.max(1)));
        Self {
            registry,
            runtime,
            natives: Arc::new(NativeClassTable::new()),
            facade: HostFacade::new(Arc::clone(&gateway)),
            gateway,
            config,
            permits,
            reports: None,
        }
    }

    /// Use `natives` as the fallback class table
    pub fn with_natives(mut self, natives: NativeClassTable) -> Self {
        self.natives = Arc::new(natives);
        self
    }

    /// Drive untyped agents through clones of `facade`
    pub fn with_facade(mut self, facade: HostFacade) -> Self {
        self.facade = facade;
        self
    }

    /// Send a report for every finished transfer to `reports`
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<AgentReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Facade handed to untyped agents
    pub fn facade(&self) -> &HostFacade {
        &self.facade
    }

    /// Class registry consulted first
    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }

    /// Executor configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Accept an agent transfer.
    ///
    /// Fails only when the channels the request needs are missing. Any later
    /// failure is logged and sent to the report channel.
    pub fn execute_agent(
        &self,
        class: Option<String>,
        jar: bool,
        channels: &mut ChannelSet,
    ) -> Result<JoinHandle<()>, ExecutorError> {
        let unit = TransferUnit::from_channels(class, jar, channels)?;
        Ok(self.spawn(unit))
    }

    /// Run `unit` on a background task
    pub fn spawn(&self, unit: TransferUnit) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move {
            let mut class = None;
            let result = executor.process(unit, &mut class).await;
            match &result {
                Ok(()) => info!("Agent {} finished", class.as_deref().unwrap_or("<unknown>")),
                Err(e) => error!("Agent {} failed: {}", class.as_deref().unwrap_or("<unknown>"), e),
            }
            if let Some(reports) = &executor.reports {
                if reports.send(AgentReport { class, result }).is_err() {
                    debug!("Agent report receiver dropped");
                }
            }
        })
    }

    async fn process(&self, unit: TransferUnit, class: &mut Option<String>) -> Result<(), ExecutorError> {
        let class_unit = match (unit.class, unit.class_channel) {
            (Some(name), Some(channel)) => Some((name, self.read(channel).await?)),
            _ => None,
        };
        let bytes = self.read(unit.object_channel).await?;

        // Only fully received transfers compete for a slot.
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::Closed)?;

        if let Some((name, class_bytes)) = class_unit {
            self.register(name, unit.jar, class_bytes).await?;
        }

        let stream = ObjectStream::from_bytes(&bytes)?;
        *class = Some(stream.class.clone());

        let dispatch = self.resolve(stream)?;
        debug!("Dispatching agent: {:?}", dispatch);
        self.dispatch(dispatch).await
    }

    async fn read(&self, channel: DataChannel) -> Result<bytes::Bytes, ExecutorError> {
        Ok(channel
            .with_max_unit_size(self.config.max_unit_size)
            .read_unit(self.config.channel_timeout)
            .await?)
    }

    async fn register(&self, name: String, jar: bool, bytes: bytes::Bytes) -> Result<(), ExecutorError> {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || {
            if jar {
                registry.register_from_archive(&bytes).map(|handles| {
                    info!("Loaded archive for {} ({} classes)", name, handles.len());
                })
            } else {
                registry.register_from_bytes(&name, &bytes).map(|_| ())
            }
        })
        .await??;
        Ok(())
    }

    /// Resolve every class `stream` refers to and rebuild its agent
    pub fn resolve(&self, stream: ObjectStream) -> Result<Dispatch, ExecutorError> {
        for name in stream.referenced_classes() {
            if !self.registry.contains(name) && !self.natives.contains(name) {
                return Err(ExecutorError::ClassNotFound(name.to_string()));
            }
        }

        if let Some(handle) = self.registry.resolve(&stream.class) {
            if !self.config.allow_untyped {
                return Err(ExecutorError::UntypedDisabled(stream.class));
            }
            return Ok(Dispatch::Untyped(UntypedAgent {
                class: handle,
                state: stream.state,
            }));
        }

        match self.natives.instantiate(&stream.class, stream.state) {
            Some(Ok(NativeObject::Agent(agent))) => Ok(Dispatch::Typed(agent)),
            Some(Ok(NativeObject::Data)) => Err(ExecutorError::NotAnAgent),
            Some(Err(source)) => Err(ExecutorError::State {
                class: stream.class,
                source,
            }),
            None => Err(ExecutorError::ClassNotFound(stream.class)),
        }
    }

    async fn dispatch(&self, dispatch: Dispatch) -> Result<(), ExecutorError> {
        match dispatch {
            Dispatch::Typed(mut agent) => {
                let gateway = Arc::clone(&self.gateway);
                tokio::task::spawn_blocking(move || agent.run(gateway.as_ref()))
                    .await?
                    .map_err(ExecutorError::Agent)
            }
            Dispatch::Untyped(agent) => {
                let runtime = Arc::clone(&self.runtime);
                let bridge = Box::new(self.facade.clone());
                let handle = tokio::runtime::Handle::current();
                // Facade calls reach the gateway synchronously.
                tokio::task::spawn_blocking(move || {
                    handle.block_on(runtime.run_agent(agent.class.module(), &agent.state, bridge))
                })
                .await??;
                Ok(())
            }
        }
    }
}
