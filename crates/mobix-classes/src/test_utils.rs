//! Test utilities for class module testing

pub mod test_modules {
    use std::sync::OnceLock;

    fn generate_minimal_wasm() -> Vec<u8> {
        wat::parse_str("(module)").unwrap()
    }

    fn generate_simple_function_wasm() -> Vec<u8> {
        wat::parse_str(r#"
            (module
              (func $add (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add)
              (export "add" (func $add)))
        "#).unwrap()
    }

    fn generate_wasi_hello_wasm() -> Vec<u8> {
        wat::parse_str(r#"
            (module
              (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
              (import "wasi_snapshot_preview1" "environ_get"
                (func $environ_get (param i32 i32) (result i32)))
              (func $_start
                nop)
              (export "_start" (func $_start))
              (memory 1)
              (export "memory" (memory 0)))
        "#).unwrap()
    }

    // run(state) stores its own state in the facade under "fooRan"
    fn generate_facade_agent_wasm() -> Vec<u8> {
        wat::parse_str(r#"
            (module
              (import "facade" "put" (func $put (param i32 i32 i32 i32) (result i32)))
              (memory (export "memory") 1)
              (data (i32.const 0) "fooRan")
              (global $heap (mut i32) (i32.const 1024))
              (func $alloc (export "alloc") (param $len i32) (result i32)
                (local $ptr i32)
                (local.set $ptr (global.get $heap))
                (global.set $heap (i32.add (global.get $heap) (local.get $len)))
                (local.get $ptr))
              (func (export "run") (param $ptr i32) (param $len i32)
                (drop (call $put (i32.const 0) (i32.const 6) (local.get $ptr) (local.get $len)))))
        "#).unwrap()
    }

    // run() reads getCurrentDevice through the facade and stores it under "relayedDevice"
    fn generate_relay_agent_wasm() -> Vec<u8> {
        wat::parse_str(r#"
            (module
              (import "facade" "get" (func $get (param i32 i32) (result i32)))
              (import "facade" "put" (func $put (param i32 i32 i32 i32) (result i32)))
              (import "facade" "read_result" (func $read_result (param i32)))
              (memory (export "memory") 1)
              (data (i32.const 0) "getCurrentDevice")
              (data (i32.const 32) "relayedDevice")
              (global $heap (mut i32) (i32.const 1024))
              (func $alloc (export "alloc") (param $len i32) (result i32)
                (local $ptr i32)
                (local.set $ptr (global.get $heap))
                (global.set $heap (i32.add (global.get $heap) (local.get $len)))
                (local.get $ptr))
              (func (export "run") (param $ptr i32) (param $len i32)
                (local $n i32)
                (local $buf i32)
                (local.set $n (call $get (i32.const 0) (i32.const 16)))
                (if (i32.lt_s (local.get $n) (i32.const 0)) (then (unreachable)))
                (local.set $buf (call $alloc (local.get $n)))
                (call $read_result (local.get $buf))
                (drop (call $put (i32.const 32) (i32.const 13) (local.get $buf) (local.get $n)))))
        "#).unwrap()
    }

    fn generate_trapping_agent_wasm() -> Vec<u8> {
        wat::parse_str(r#"
            (module
              (memory (export "memory") 1)
              (func (export "alloc") (param i32) (result i32)
                i32.const 1024)
              (func (export "run") (param i32 i32)
                unreachable))
        "#).unwrap()
    }

    static MINIMAL_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static SIMPLE_FUNCTION_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static WASI_HELLO_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static FACADE_AGENT_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static RELAY_AGENT_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static TRAPPING_AGENT_WASM: OnceLock<Vec<u8>> = OnceLock::new();

    /// A minimal valid module that does nothing
    pub fn minimal_wasm() -> &'static [u8] {
        MINIMAL_WASM.get_or_init(generate_minimal_wasm)
    }

    /// A module exporting `add` but no agent entry point
    pub fn simple_function_wasm() -> &'static [u8] {
        SIMPLE_FUNCTION_WASM.get_or_init(generate_simple_function_wasm)
    }

    /// A WASI-compatible module with `_start` export
    pub fn wasi_hello_wasm() -> &'static [u8] {
        WASI_HELLO_WASM.get_or_init(generate_wasi_hello_wasm)
    }

    /// An agent that copies its state into the facade under "fooRan"
    pub fn facade_agent_wasm() -> &'static [u8] {
        FACADE_AGENT_WASM.get_or_init(generate_facade_agent_wasm)
    }

    /// An agent that copies `getCurrentDevice` into the facade under "relayedDevice"
    pub fn relay_agent_wasm() -> &'static [u8] {
        RELAY_AGENT_WASM.get_or_init(generate_relay_agent_wasm)
    }

    /// An agent whose entry point traps
    pub fn trapping_agent_wasm() -> &'static [u8] {
        TRAPPING_AGENT_WASM.get_or_init(generate_trapping_agent_wasm)
    }

    /// Invalid module with wrong magic number
    pub const INVALID_MAGIC_WASM: &[u8] = &[
        0xFF, 0xFF, 0xFF, 0xFF, // wrong magic
        0x01, 0x00, 0x00, 0x00, // version
    ];
}
