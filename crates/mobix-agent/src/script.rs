//! Script sessions and the embedded Lua interpreter
//!
//! Every script call gets a fresh session id and a fresh interpreter. The
//! call parameters are copied into the session before the script runs, and
//! the script reaches them through `get(key)` and `set(key, value)`, which a
//! generated preamble binds to that one session id. Whatever the script last
//! stored under `"value"` is the call result.

use mlua::{Function, Lua, LuaOptions, LuaSerdeExt, StdLib, Table};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Session key holding the script result
pub const RESULT_KEY: &str = "value";

/// Parameter carrying the script source, never copied into the session
pub const CODE_PARAMETER: &str = "code";

const BRIDGE_GLOBAL: &str = "__uos_bridge";

/// Script execution errors
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The interpreter rejected or failed to run the script
    #[error("Error handling Execution call. Cause:{0}")]
    Execution(String),

    /// The interpreter could not be prepared
    #[error("Script interpreter setup failed: {0}")]
    Setup(#[from] mlua::Error),
}

/// How long finished sessions are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRetention {
    /// Keep every session for the life of the store
    Unbounded,
    /// Keep at most this many finished sessions, evicting the oldest ids
    Bounded(usize),
    /// Drop a session as soon as its call returns
    Discard,
}

impl Default for SessionRetention {
    fn default() -> Self {
        Self::Bounded(1024)
    }
}

#[derive(Debug, Default)]
struct Session {
    values: HashMap<String, Value>,
    finished: bool,
}

/// Per-call key/value scratchpads keyed by a monotonic session id
///
/// A session stays live from [`new_session`](Self::new_session) until
/// [`finish_session`](Self::finish_session); retention only ever evicts
/// finished sessions.
#[derive(Debug)]
pub struct SessionStore {
    next_id: AtomicU64,
    sessions: RwLock<BTreeMap<u64, Session>>,
    retention: SessionRetention,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionRetention::default())
    }
}

impl SessionStore {
    /// Create an empty store; the first session id is 1
    pub fn new(retention: SessionRetention) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: RwLock::new(BTreeMap::new()),
            retention,
        }
    }

    /// Retention policy
    pub fn retention(&self) -> SessionRetention {
        self.retention
    }

    /// Allocate a new live session
    pub fn new_session(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Session::default());
        id
    }

    /// Mark session `id` finished and apply the retention policy
    pub fn finish_session(&self, id: u64) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match self.retention {
            SessionRetention::Discard => {
                sessions.remove(&id);
            }
            SessionRetention::Bounded(limit) => {
                if let Some(session) = sessions.get_mut(&id) {
                    session.finished = true;
                }
                let finished: Vec<u64> = sessions
                    .iter()
                    .filter(|(_, session)| session.finished)
                    .map(|(id, _)| *id)
                    .collect();
                let excess = finished.len().saturating_sub(limit.max(1));
                for evicted in &finished[..excess] {
                    trace!("Evicted script session {}", evicted);
                    sessions.remove(evicted);
                }
            }
            SessionRetention::Unbounded => {
                if let Some(session) = sessions.get_mut(&id) {
                    session.finished = true;
                }
            }
        }
    }

    /// Store `value` under `key` in session `id`
    ///
    /// Writes to a session the store no longer holds are dropped.
    pub fn set_value(&self, id: u64, key: impl Into<String>, value: Value) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(&id) {
            Some(session) => {
                session.values.insert(key.into(), value);
            }
            None => warn!("Dropping write to unknown script session {}", id),
        }
    }

    /// Read `key` from session `id`
    pub fn get_value(&self, id: u64, key: &str) -> Option<Value> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(&id).and_then(|session| session.values.get(key)).cloned()
    }

    /// Remove session `id`, returning its contents
    pub fn discard(&self, id: u64) -> Option<HashMap<String, Value>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .map(|session| session.values)
    }

    /// Whether session `id` is still held
    pub fn contains(&self, id: u64) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Number of held sessions
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no session is held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Interpreter configuration
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    /// Load only the pure libraries (table, string, math, utf8, coroutine)
    pub sandboxed: bool,
    /// Interpreter memory limit in bytes
    pub memory_limit: Option<usize>,
    /// Session retention policy
    pub retention: SessionRetention,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            sandboxed: true,
            memory_limit: Some(64 * 1024 * 1024),
            retention: SessionRetention::default(),
        }
    }
}

impl ScriptConfig {
    /// Enable or disable the library sandbox
    pub fn with_sandbox(mut self, sandboxed: bool) -> Self {
        self.sandboxed = sandboxed;
        self
    }

    /// Set or clear the memory limit
    pub fn with_memory_limit(mut self, limit: Option<usize>) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Set the session retention policy
    pub fn with_retention(mut self, retention: SessionRetention) -> Self {
        self.retention = retention;
        self
    }
}

/// Runs scripts against a shared session store
#[derive(Debug)]
pub struct ScriptEngine {
    sessions: Arc<SessionStore>,
    config: ScriptConfig,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(ScriptConfig::default())
    }
}

impl ScriptEngine {
    /// Create an engine with its own session store
    pub fn new(config: ScriptConfig) -> Self {
        Self {
            sessions: Arc::new(SessionStore::new(config.retention)),
            config,
        }
    }

    /// Session store backing `get`/`set`
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Interpreter configuration
    pub fn config(&self) -> &ScriptConfig {
        &self.config
    }

    /// Run `code` once with `parameters` and return what it stored under `"value"`
    pub fn execute(&self, code: &str, parameters: &Map<String, Value>) -> Result<Option<Value>, ScriptError> {
        let id = self.sessions.new_session();
        for (key, value) in parameters {
            if key != CODE_PARAMETER {
                self.sessions.set_value(id, key.as_str(), value.clone());
            }
        }

        debug!("Executing script session {} ({} parameters)", id, parameters.len());
        let outcome = self.evaluate(id, code);
        let value = self.sessions.get_value(id, RESULT_KEY);
        self.sessions.finish_session(id);

        match outcome {
            Ok(()) => Ok(value),
            Err(e) => {
                error!("Script session {} failed: {}", id, e);
                Err(e)
            }
        }
    }

    fn evaluate(&self, id: u64, code: &str) -> Result<(), ScriptError> {
        let lua = self.interpreter()?;
        self.install_bridge(&lua)?;
        install_log(&lua)?;

        let source = format!("{}{}", preamble(id), code);
        lua.load(source.as_str())
            .set_name(format!("script_{}", id))
            .exec()
            .map_err(|e| ScriptError::Execution(e.to_string()))
    }

    fn interpreter(&self) -> Result<Lua, ScriptError> {
        let lua = if self.config.sandboxed {
            Lua::new_with(
                StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE,
                LuaOptions::default(),
            )?
        } else {
            Lua::new()
        };
        if let Some(limit) = self.config.memory_limit {
            lua.set_memory_limit(limit)?;
        }
        Ok(lua)
    }

    fn install_bridge(&self, lua: &Lua) -> Result<(), ScriptError> {
        let bridge: Table = lua.create_table()?;

        let sessions = Arc::clone(&self.sessions);
        let set: Function = lua.create_function(move |lua, (id, key, value): (u64, String, mlua::Value)| {
            let value: Value = lua.from_value(value)?;
            sessions.set_value(id, key, value);
            Ok(())
        })?;
        bridge.set("set", set)?;

        let sessions = Arc::clone(&self.sessions);
        let get: Function = lua.create_function(move |lua, (id, key): (u64, String)| {
            match sessions.get_value(id, &key) {
                None | Some(Value::Null) => Ok(mlua::Value::Nil),
                Some(value) => lua.to_value(&value),
            }
        })?;
        bridge.set("get", get)?;

        lua.globals().set(BRIDGE_GLOBAL, bridge)?;
        Ok(())
    }
}

fn install_log(lua: &Lua) -> Result<(), ScriptError> {
    let log = lua.create_function(|_, (level, msg): (String, String)| {
        match level.to_lowercase().as_str() {
            "trace" => trace!("[lua] {}", msg),
            "debug" => debug!("[lua] {}", msg),
            "warn" => warn!("[lua] {}", msg),
            "error" => error!("[lua] {}", msg),
            _ => info!("[lua] {}", msg),
        }
        Ok(())
    })?;
    lua.globals().set("log", log)?;
    Ok(())
}

// The bridge global is consumed into locals so only this session's id is reachable.
fn preamble(id: u64) -> String {
    format!(
        "local UOS_ID <const> = {id}\n\
         local get, set\n\
         do\n\
         \x20 local bridge = {bridge}\n\
         \x20 {bridge} = nil\n\
         \x20 function set(key, value) bridge.set(UOS_ID, key, value) end\n\
         \x20 function get(key) return bridge.get(UOS_ID, key) end\n\
         end\n",
        id = id,
        bridge = BRIDGE_GLOBAL,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_parameter_round_trip() {
        let engine = ScriptEngine::default();
        let result = engine
            .execute(r#"set("value", get("x") .. "!")"#, &params(&[("x", json!("hi"))]))
            .unwrap();
        assert_eq!(result, Some(json!("hi!")));
    }

    #[test]
    fn test_last_write_wins() {
        let engine = ScriptEngine::default();
        let result = engine
            .execute(r#"set("value", 1) set("value", get("n") + 1)"#, &params(&[("n", json!(41))]))
            .unwrap();
        assert_eq!(result, Some(json!(42)));
    }

    #[test]
    fn test_absent_result() {
        let engine = ScriptEngine::default();
        let result = engine.execute("local x = 1", &Map::new()).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_code_parameter_not_copied() {
        let engine = ScriptEngine::default();
        let code = r#"set("value", get("code") == nil)"#;
        let result = engine.execute(code, &params(&[("code", json!(code))])).unwrap();
        assert_eq!(result, Some(json!(true)));
    }

    #[test]
    fn test_null_parameter_reads_as_nil() {
        let engine = ScriptEngine::default();
        let result = engine
            .execute(r#"set("value", get("k") == nil)"#, &params(&[("k", Value::Null)]))
            .unwrap();
        assert_eq!(result, Some(json!(true)));
    }

    #[test]
    fn test_table_values_convert() {
        let engine = ScriptEngine::default();
        let result = engine
            .execute(
                r#"local d = get("device") set("value", {name = d.name, count = #d.tags})"#,
                &params(&[("device", json!({"name": "phone", "tags": ["a", "b"]}))]),
            )
            .unwrap();
        assert_eq!(result, Some(json!({"name": "phone", "count": 2})));
    }

    #[test]
    fn test_bridge_not_reachable() {
        let engine = ScriptEngine::default();
        let result = engine
            .execute(r#"set("value", __uos_bridge == nil)"#, &Map::new())
            .unwrap();
        assert_eq!(result, Some(json!(true)));
    }

    #[test]
    fn test_syntax_error_reported() {
        let engine = ScriptEngine::default();
        let err = engine.execute("set(", &Map::new()).unwrap_err();
        assert!(matches!(err, ScriptError::Execution(_)));
        assert!(err.to_string().starts_with("Error handling Execution call. Cause:"));
    }

    #[test]
    fn test_runtime_error_keeps_earlier_writes() {
        let engine = ScriptEngine::new(ScriptConfig::default().with_retention(SessionRetention::Unbounded));
        let err = engine.execute(r#"set("value", 1) error("boom")"#, &Map::new()).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(engine.sessions().get_value(1, RESULT_KEY), Some(json!(1)));
    }

    #[test]
    fn test_sandbox_hides_os_libraries() {
        let sandboxed = ScriptEngine::default();
        let result = sandboxed
            .execute(r#"set("value", io == nil and os == nil)"#, &Map::new())
            .unwrap();
        assert_eq!(result, Some(json!(true)));

        let open = ScriptEngine::new(ScriptConfig::default().with_sandbox(false));
        let result = open.execute(r#"set("value", os ~= nil)"#, &Map::new()).unwrap();
        assert_eq!(result, Some(json!(true)));
    }

    #[test]
    fn test_memory_limit() {
        let engine = ScriptEngine::new(ScriptConfig::default().with_memory_limit(Some(1024 * 1024)));
        let result = engine.execute(r#"local s = string.rep("x", 16 * 1024 * 1024)"#, &Map::new());
        assert!(matches!(result, Err(ScriptError::Execution(_))));
    }

    #[test]
    fn test_log_available() {
        let engine = ScriptEngine::default();
        let result = engine.execute(r#"log("info", "hello") set("value", "ok")"#, &Map::new()).unwrap();
        assert_eq!(result, Some(json!("ok")));
    }

    #[test]
    fn test_concurrent_sessions_isolated() {
        let engine = Arc::new(ScriptEngine::default());
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    let code = r#"for i = 1, 200 do set("tmp", i) end set("value", get("x"))"#;
                    engine.execute(code, &params(&[("x", json!(i))])).unwrap()
                })
            })
            .collect();

        for (i, worker) in workers.into_iter().enumerate() {
            assert_eq!(worker.join().unwrap(), Some(json!(i)));
        }
    }

    #[test]
    fn test_discard_retention() {
        let engine = ScriptEngine::new(ScriptConfig::default().with_retention(SessionRetention::Discard));
        engine.execute(r#"set("value", 1)"#, &Map::new()).unwrap();
        assert!(engine.sessions().is_empty());
    }

    #[test]
    fn test_bounded_retention_evicts_oldest() {
        let store = SessionStore::new(SessionRetention::Bounded(2));
        let first = store.new_session();
        let second = store.new_session();
        let third = store.new_session();
        for id in [first, second, third] {
            store.finish_session(id);
        }

        assert!(!store.contains(first));
        assert!(store.contains(second));
        assert!(store.contains(third));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_bounded_retention_keeps_live_sessions() {
        let store = SessionStore::new(SessionRetention::Bounded(1));
        let live = store.new_session();
        store.set_value(live, "x", json!("mine"));
        for _ in 0..4 {
            let id = store.new_session();
            store.finish_session(id);
        }

        assert_eq!(store.get_value(live, "x"), Some(json!("mine")));
        assert_eq!(store.len(), 2);

        store.finish_session(live);
        assert!(!store.contains(live));
    }

    #[test]
    fn test_write_to_evicted_session_is_dropped() {
        let store = SessionStore::new(SessionRetention::Discard);
        let id = store.new_session();
        store.finish_session(id);
        store.set_value(id, "k", json!(1));
        assert!(!store.contains(id));
    }

    #[test]
    fn test_running_script_survives_bounded_eviction() {
        let engine = Arc::new(ScriptEngine::new(
            ScriptConfig::default().with_retention(SessionRetention::Bounded(4)),
        ));
        let long = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let code = r#"while get("release") == nil do end set("value", get("x"))"#;
                engine.execute(code, &params(&[("x", json!("mine"))])).unwrap()
            })
        };
        while !engine.sessions().contains(1) {
            std::thread::yield_now();
        }

        for i in 0..8 {
            let result = engine.execute(r#"set("value", get("n"))"#, &params(&[("n", json!(i))])).unwrap();
            assert_eq!(result, Some(json!(i)));
        }
        assert!(engine.sessions().contains(1));

        engine.sessions().set_value(1, "release", json!(true));
        assert_eq!(long.join().unwrap(), Some(json!("mine")));
    }

    #[test]
    fn test_session_values() {
        let store = SessionStore::default();
        let id = store.new_session();
        assert_eq!(id, 1);

        store.set_value(id, "k", json!("v"));
        assert_eq!(store.get_value(id, "k"), Some(json!("v")));
        assert_eq!(store.get_value(id + 1, "k"), None);

        let removed = store.discard(id).unwrap();
        assert_eq!(removed.get("k"), Some(&json!("v")));
        assert_eq!(store.get_value(id, "k"), None);
    }

    proptest! {
        #[test]
        fn test_session_ids_strictly_increase(count in 1usize..64) {
            let store = SessionStore::new(SessionRetention::Unbounded);
            let ids: Vec<u64> = (0..count).map(|_| store.new_session()).collect();
            prop_assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
            prop_assert_eq!(ids[0], 1);
        }
    }
}
