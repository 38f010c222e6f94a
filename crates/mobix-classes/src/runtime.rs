//! Execution runtime for class-defined agents
//!
//! A class agent exports `alloc(len) -> ptr` and `run(ptr, len)`. The runtime
//! writes the agent state as JSON into guest memory and calls `run`. While it
//! runs, the agent reaches its host through three imports in the `facade`
//! module:
//!
//! * `put(op_ptr, op_len, args_ptr, args_len) -> i32`
//! * `get(op_ptr, op_len) -> i32`
//! * `read_result(dst_ptr)`
//!
//! `put` and `get` leave their JSON result pending on the host and return its
//! length. A negative return `r` signals an error whose message is
//! `-(r + 1)` bytes long. Either way `read_result` copies the pending bytes to
//! `dst_ptr`.

use crate::error::ClassError;
use crate::module::ClassModule;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};
use wasmtime::{Caller, Engine, Extern, Linker, Memory, Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::{WasiCtx, WasiCtxBuilder};

/// Fuel an agent may burn between yields to the async executor
const FUEL_YIELD_INTERVAL: u64 = 10_000;

/// Fuel granted when no fuel limit is configured
const UNMETERED_FUEL: u64 = i64::MAX as u64;

/// Import module name for host facade functions
pub const FACADE_MODULE: &str = "facade";

/// Export called to run an agent
pub const ENTRY_POINT: &str = "run";

/// Export used to reserve guest memory for the agent state
pub const ALLOC_EXPORT: &str = "alloc";

/// Host side of the facade imports
pub trait HostBridge: Send {
    /// Handle `put(op, args)`
    fn put(&mut self, op: &str, args: Value) -> Result<Value, String>;

    /// Handle `get(op)`
    fn get(&mut self, op: &str) -> Result<Value, String>;
}

/// Per-run store data
struct AgentContext {
    wasi: WasiCtx,
    bridge: Box<dyn HostBridge>,
    pending: Option<Vec<u8>>,
    limits: StoreLimits,
}

impl AgentContext {
    fn settle(&mut self, outcome: Result<Value, String>) -> wasmtime::Result<i32> {
        match outcome {
            Ok(value) => {
                let bytes = serde_json::to_vec(&value)?;
                let len = i32::try_from(bytes.len())?;
                self.pending = Some(bytes);
                Ok(len)
            }
            Err(message) => {
                let bytes = message.into_bytes();
                let len = i32::try_from(bytes.len())?;
                self.pending = Some(bytes);
                Ok(-len - 1)
            }
        }
    }
}

/// Configuration for class execution
#[derive(Debug, Clone)]
pub struct ClassRuntimeConfig {
    /// Maximum linear memory per agent in bytes (default: 64MB)
    pub max_memory: u64,
    /// Maximum execution time (default: 30 seconds)
    ///
    /// Agents yield every few thousand instructions, so the limit also stops
    /// an agent that never calls back into the host.
    pub max_execution_time: Duration,
    /// Maximum fuel (instruction count limit); `None` leaves only the time limit
    pub max_fuel: Option<u64>,
    /// Link WASI for modules that import it
    pub enable_wasi: bool,
    /// Environment exposed to WASI modules
    pub env: Vec<(String, String)>,
}

impl Default for ClassRuntimeConfig {
    fn default() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024,
            max_execution_time: Duration::from_secs(30),
            max_fuel: Some(1_000_000),
            enable_wasi: true,
            env: Vec::new(),
        }
    }
}

impl ClassRuntimeConfig {
    /// Set the memory limit
    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Set the execution time limit
    pub fn with_max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = limit;
        self
    }

    /// Set or clear the fuel limit
    pub fn with_max_fuel(mut self, fuel: Option<u64>) -> Self {
        self.max_fuel = fuel;
        self
    }

    /// Enable or disable WASI linking
    pub fn with_wasi(mut self, enabled: bool) -> Self {
        self.enable_wasi = enabled;
        self
    }

    /// Add a WASI environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Runs class agents under wasmtime
pub struct ClassRuntime {
    engine: Engine,
    config: ClassRuntimeConfig,
}

impl std::fmt::Debug for ClassRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRuntime")
            .field("config", &self.config)
            .finish()
    }
}

impl ClassRuntime {
    /// Create a runtime with default configuration
    pub fn new() -> Result<Self, ClassError> {
        Self::with_config(ClassRuntimeConfig::default())
    }

    /// Create a runtime with custom configuration
    pub fn with_config(config: ClassRuntimeConfig) -> Result<Self, ClassError> {
        let mut wasmtime_config = wasmtime::Config::new();
        wasmtime_config.max_wasm_stack(1024 * 1024);
        wasmtime_config.consume_fuel(true);
        wasmtime_config.async_support(true);

        let engine = Engine::new(&wasmtime_config)?;
        Ok(Self { engine, config })
    }

    /// Engine classes must be compiled with to run here
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Runtime configuration
    pub fn config(&self) -> &ClassRuntimeConfig {
        &self.config
    }

    /// Whether `module` exports what an agent needs
    pub fn has_entry_point(&self, module: &ClassModule) -> bool {
        module.exports(ENTRY_POINT) && module.exports(ALLOC_EXPORT)
    }

    /// Run the agent defined by `module` with `state`, bridging facade calls to `bridge`
    pub async fn run_agent(
        &self,
        module: &ClassModule,
        state: &Value,
        bridge: Box<dyn HostBridge>,
    ) -> Result<(), ClassError> {
        if !self.has_entry_point(module) {
            return Err(ClassError::EntryPoint(format!(
                "class must export `{}` and `{}`",
                ENTRY_POINT, ALLOC_EXPORT
            )));
        }

        let payload = serde_json::to_vec(state)
            .map_err(|e| ClassError::Execution(format!("Failed to serialize agent state: {}", e)))?;
        let payload_len = i32::try_from(payload.len())
            .map_err(|_| ClassError::Execution("agent state too large".to_string()))?;

        let context = AgentContext {
            wasi: self.build_wasi(),
            bridge,
            pending: None,
            limits: StoreLimitsBuilder::new()
                .memory_size(usize::try_from(self.config.max_memory).unwrap_or(usize::MAX))
                .build(),
        };
        let mut store = Store::new(&self.engine, context);
        store.limiter(|ctx| &mut ctx.limits);
        store.add_fuel(self.config.max_fuel.unwrap_or(UNMETERED_FUEL))?;
        store.fuel_async_yield_interval(Some(FUEL_YIELD_INTERVAL))?;

        let mut linker = Linker::new(&self.engine);
        if self.config.enable_wasi && module.is_wasi() {
            wasmtime_wasi::add_to_linker(&mut linker, |ctx: &mut AgentContext| &mut ctx.wasi)?;
        }
        link_facade(&mut linker)?;

        debug!("Running class agent (module {}, {} state bytes)", module.hash(), payload.len());

        let execution = async {
            let instance = linker.instantiate_async(&mut store, module.compiled()).await?;
            let alloc = instance.get_typed_func::<i32, i32>(&mut store, ALLOC_EXPORT)?;
            let run = instance.get_typed_func::<(i32, i32), ()>(&mut store, ENTRY_POINT)?;
            let memory = instance
                .get_memory(&mut store, "memory")
                .ok_or_else(|| wasmtime::Error::msg("class does not export memory"))?;

            let ptr = alloc.call_async(&mut store, payload_len).await?;
            memory.write(&mut store, guest_offset(ptr)?, &payload)?;
            run.call_async(&mut store, (ptr, payload_len)).await?;
            Ok::<(), wasmtime::Error>(())
        };

        match tokio::time::timeout(self.config.max_execution_time, execution).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ClassError::Execution(format!("Agent execution failed: {:#}", e))),
            Err(_) => Err(ClassError::Execution("Agent execution timed out".to_string())),
        }
    }

    fn build_wasi(&self) -> WasiCtx {
        let mut wasi_builder = WasiCtxBuilder::new();
        for (key, value) in &self.config.env {
            let _ = wasi_builder.env(key, value);
        }
        wasi_builder.build()
    }
}

fn link_facade(linker: &mut Linker<AgentContext>) -> Result<(), ClassError> {
    linker.func_wrap(
        FACADE_MODULE,
        "put",
        |mut caller: Caller<'_, AgentContext>, op_ptr: i32, op_len: i32, args_ptr: i32, args_len: i32| -> wasmtime::Result<i32> {
            let memory = guest_memory(&mut caller)?;
            let op = read_str(&caller, memory, op_ptr, op_len)?;
            let args = read_bytes(&caller, memory, args_ptr, args_len)?;
            trace!("facade put {}", op);
            let outcome = match serde_json::from_slice::<Value>(&args) {
                Ok(args) => caller.data_mut().bridge.put(&op, args),
                Err(e) => Err(format!("invalid arguments for {}: {}", op, e)),
            };
            caller.data_mut().settle(outcome)
        },
    )?;

    linker.func_wrap(
        FACADE_MODULE,
        "get",
        |mut caller: Caller<'_, AgentContext>, op_ptr: i32, op_len: i32| -> wasmtime::Result<i32> {
            let memory = guest_memory(&mut caller)?;
            let op = read_str(&caller, memory, op_ptr, op_len)?;
            trace!("facade get {}", op);
            let outcome = caller.data_mut().bridge.get(&op);
            caller.data_mut().settle(outcome)
        },
    )?;

    linker.func_wrap(
        FACADE_MODULE,
        "read_result",
        |mut caller: Caller<'_, AgentContext>, dst_ptr: i32| -> wasmtime::Result<()> {
            let memory = guest_memory(&mut caller)?;
            let pending = caller
                .data_mut()
                .pending
                .take()
                .ok_or_else(|| wasmtime::Error::msg("no facade result pending"))?;
            memory.write(&mut caller, guest_offset(dst_ptr)?, &pending)?;
            Ok(())
        },
    )?;

    Ok(())
}

fn guest_memory(caller: &mut Caller<'_, AgentContext>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("class does not export memory"))
}

fn guest_offset(ptr: i32) -> wasmtime::Result<usize> {
    usize::try_from(ptr).map_err(|_| wasmtime::Error::msg(format!("negative guest pointer {}", ptr)))
}

fn read_bytes(
    caller: &Caller<'_, AgentContext>,
    memory: Memory,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<Vec<u8>> {
    let len = usize::try_from(len).map_err(|_| wasmtime::Error::msg(format!("negative length {}", len)))?;
    let mut buf = vec![0u8; len];
    memory.read(caller, guest_offset(ptr)?, &mut buf)?;
    Ok(buf)
}

fn read_str(
    caller: &Caller<'_, AgentContext>,
    memory: Memory,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<String> {
    let bytes = read_bytes(caller, memory, ptr, len)?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_modules::{
        facade_agent_wasm, relay_agent_wasm, simple_function_wasm, trapping_agent_wasm,
    };
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct RecordingBridge {
        puts: Arc<Mutex<Vec<(String, Value)>>>,
        fail_puts: bool,
    }

    impl HostBridge for RecordingBridge {
        fn put(&mut self, op: &str, args: Value) -> Result<Value, String> {
            if self.fail_puts {
                return Err(format!("{} refused", op));
            }
            self.puts.lock().unwrap().push((op.to_string(), args));
            Ok(Value::Null)
        }

        fn get(&mut self, op: &str) -> Result<Value, String> {
            match op {
                "getCurrentDevice" => Ok(json!({"name": "phone", "networks": []})),
                other => Err(format!("unknown operation {}", other)),
            }
        }
    }

    fn load(runtime: &ClassRuntime, bytes: &[u8]) -> ClassModule {
        ClassModule::from_bytes(runtime.engine(), bytes).unwrap()
    }

    #[tokio::test]
    async fn test_runtime_defaults() {
        let runtime = ClassRuntime::new().unwrap();
        assert_eq!(runtime.config().max_memory, 64 * 1024 * 1024);
        assert_eq!(runtime.config().max_execution_time, Duration::from_secs(30));
        assert_eq!(runtime.config().max_fuel, Some(1_000_000));
        assert!(runtime.config().enable_wasi);
    }

    #[tokio::test]
    async fn test_agent_puts_state() {
        let runtime = ClassRuntime::new().unwrap();
        let module = load(&runtime, facade_agent_wasm());
        let bridge = RecordingBridge::default();
        let puts = Arc::clone(&bridge.puts);

        runtime
            .run_agent(&module, &json!({"marker": 7}), Box::new(bridge))
            .await
            .unwrap();

        let puts = puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "fooRan");
        assert_eq!(puts[0].1, json!({"marker": 7}));
    }

    #[tokio::test]
    async fn test_agent_reads_through_facade() {
        let runtime = ClassRuntime::new().unwrap();
        let module = load(&runtime, relay_agent_wasm());
        let bridge = RecordingBridge::default();
        let puts = Arc::clone(&bridge.puts);

        runtime.run_agent(&module, &Value::Null, Box::new(bridge)).await.unwrap();

        let puts = puts.lock().unwrap();
        assert_eq!(puts[0].0, "relayedDevice");
        assert_eq!(puts[0].1["name"], "phone");
    }

    #[tokio::test]
    async fn test_bridge_error_reaches_guest() {
        let bytes = wat::parse_str(r#"
            (module
              (import "facade" "put" (func $put (param i32 i32 i32 i32) (result i32)))
              (memory (export "memory") 1)
              (data (i32.const 0) "x")
              (func (export "alloc") (param i32) (result i32) i32.const 1024)
              (func (export "run") (param $ptr i32) (param $len i32)
                (if (i32.lt_s (call $put (i32.const 0) (i32.const 1) (local.get $ptr) (local.get $len)) (i32.const 0))
                  (then (unreachable)))))
        "#).unwrap();
        let runtime = ClassRuntime::new().unwrap();
        let module = load(&runtime, &bytes);

        let ok = runtime.run_agent(&module, &json!(1), Box::new(RecordingBridge::default())).await;
        assert!(ok.is_ok());

        let failing = RecordingBridge { fail_puts: true, ..Default::default() };
        let err = runtime.run_agent(&module, &json!(1), Box::new(failing)).await;
        assert!(matches!(err, Err(ClassError::Execution(_))));
    }

    #[tokio::test]
    async fn test_missing_entry_point() {
        let runtime = ClassRuntime::new().unwrap();
        let module = load(&runtime, simple_function_wasm());
        assert!(!runtime.has_entry_point(&module));

        let result = runtime.run_agent(&module, &Value::Null, Box::new(RecordingBridge::default())).await;
        assert!(matches!(result, Err(ClassError::EntryPoint(_))));
    }

    #[tokio::test]
    async fn test_trap_is_execution_error() {
        let runtime = ClassRuntime::new().unwrap();
        let module = load(&runtime, trapping_agent_wasm());

        let result = runtime.run_agent(&module, &Value::Null, Box::new(RecordingBridge::default())).await;
        assert!(matches!(result, Err(ClassError::Execution(_))));
    }

    #[tokio::test]
    async fn test_fuel_limit_stops_spinning_agent() {
        let bytes = wat::parse_str(r#"
            (module
              (memory (export "memory") 1)
              (func (export "alloc") (param i32) (result i32) i32.const 1024)
              (func (export "run") (param i32 i32)
                (loop $spin (br $spin))))
        "#).unwrap();
        let runtime = ClassRuntime::with_config(
            ClassRuntimeConfig::default()
                .with_max_fuel(Some(10_000))
                .with_max_execution_time(Duration::from_secs(5)),
        )
        .unwrap();
        let module = load(&runtime, &bytes);

        let result = runtime.run_agent(&module, &Value::Null, Box::new(RecordingBridge::default())).await;
        assert!(matches!(result, Err(ClassError::Execution(_))));
    }

    #[tokio::test]
    async fn test_time_limit_stops_unmetered_agent() {
        let bytes = wat::parse_str(r#"
            (module
              (memory (export "memory") 1)
              (func (export "alloc") (param i32) (result i32) i32.const 1024)
              (func (export "run") (param i32 i32)
                (loop $spin (br $spin))))
        "#).unwrap();
        let runtime = ClassRuntime::with_config(
            ClassRuntimeConfig::default()
                .with_max_fuel(None)
                .with_max_execution_time(Duration::from_millis(200)),
        )
        .unwrap();
        let module = load(&runtime, &bytes);

        let started = std::time::Instant::now();
        let result = runtime.run_agent(&module, &Value::Null, Box::new(RecordingBridge::default())).await;
        assert!(matches!(result, Err(ClassError::Execution(ref msg)) if msg.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_memory_limit_enforced() {
        let bytes = wat::parse_str(r#"
            (module
              (memory (export "memory") 4)
              (func (export "alloc") (param i32) (result i32) i32.const 1024)
              (func (export "run") (param i32 i32)))
        "#).unwrap();
        let runtime = ClassRuntime::with_config(
            ClassRuntimeConfig::default().with_max_memory(64 * 1024),
        )
        .unwrap();
        let module = load(&runtime, &bytes);

        let result = runtime.run_agent(&module, &Value::Null, Box::new(RecordingBridge::default())).await;
        assert!(matches!(result, Err(ClassError::Execution(_))));
    }

    #[tokio::test]
    async fn test_wasi_agent_links() {
        let bytes = wat::parse_str(r#"
            (module
              (import "wasi_snapshot_preview1" "environ_sizes_get"
                (func $environ_sizes_get (param i32 i32) (result i32)))
              (memory (export "memory") 1)
              (func (export "alloc") (param i32) (result i32) i32.const 1024)
              (func (export "run") (param i32 i32)
                (drop (call $environ_sizes_get (i32.const 0) (i32.const 4)))))
        "#).unwrap();
        let runtime = ClassRuntime::with_config(
            ClassRuntimeConfig::default().with_env("MOBIX", "1"),
        )
        .unwrap();
        let module = load(&runtime, &bytes);
        assert!(module.is_wasi());

        let result = runtime.run_agent(&module, &Value::Null, Box::new(RecordingBridge::default())).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wasi_disabled_fails_to_link() {
        let bytes = wat::parse_str(r#"
            (module
              (import "wasi_snapshot_preview1" "environ_sizes_get"
                (func $environ_sizes_get (param i32 i32) (result i32)))
              (memory (export "memory") 1)
              (func (export "alloc") (param i32) (result i32) i32.const 1024)
              (func (export "run") (param i32 i32)))
        "#).unwrap();
        let runtime = ClassRuntime::with_config(ClassRuntimeConfig::default().with_wasi(false)).unwrap();
        let module = load(&runtime, &bytes);

        let result = runtime.run_agent(&module, &Value::Null, Box::new(RecordingBridge::default())).await;
        assert!(matches!(result, Err(ClassError::Execution(_))));
    }
}
