#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use wasmboot::prelude::*;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Log sink shared with a thread-local subscriber.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Captures events emitted on this thread until the guard drops.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buf = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buf.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (buf, tracing::subscriber::set_default(subscriber))
}

/// Exercises memory, strings, handles, throws and the default handler.
pub const APP_MODULE: &str = r#"
(module
  (import "env" "memory" (memory 1))
  (import "wbg" "__wbindgen_string_new" (func $string_new (param i32 i32) (result i32)))
  (import "wbg" "__wbindgen_object_drop_ref" (func $drop (param i32)))
  (import "wbg" "__wbindgen_throw" (func $throw (param i32 i32)))
  (import "wbg" "__wbg_log_9f0ca3c1e4b2" (func $log (param i32)))
  (data (i32.const 64) "hello")
  (data (i32.const 96) "bad input")
  (global $started (mut i32) (i32.const 0))
  (func (export "start") (global.set $started (i32.const 1)))
  (func (export "started") (result i32) (global.get $started))
  (func (export "greet") (result i32) (call $string_new (i32.const 64) (i32.const 5)))
  (func (export "release") (param i32) (call $drop (local.get 0)))
  (func (export "fail") (call $throw (i32.const 96) (i32.const 9)))
  (func (export "log3")
    (call $log (i32.const 1))
    (call $log (i32.const 2))
    (call $log (i32.const 3))))
"#;

pub const TRAPPING_START: &str = r#"(module (func (export "start") unreachable))"#;

pub fn app_module() -> Vec<u8> {
    wat::parse_str(APP_MODULE).unwrap()
}

pub fn instance_from(src: &str) -> ModuleInstance {
    Instantiator::new(&BootConfig::default())
        .instantiate(&wat::parse_str(src).unwrap())
        .unwrap()
}

pub const INDEX_HTML: &[u8] = b"<!DOCTYPE html><html><body>app</body></html>";

enum Route {
    Ok(Payload),
    Status(u16, &'static str),
}

/// In-memory fetcher. Unknown URLs behave like a refused connection.
#[derive(Clone, Default)]
pub struct MemoryFetcher {
    routes: Arc<Mutex<HashMap<String, Route>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(self, url: &str, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        let payload = Payload::new(url, body).with_content_type(content_type);
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), Route::Ok(payload));
        self
    }

    pub fn status(self, url: &str, status: u16, reason: &'static str) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), Route::Status(status, reason));
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Fetcher for MemoryFetcher {
    async fn fetch(&self, url: &str) -> BootResult<Payload> {
        self.requests.lock().unwrap().push(url.to_string());
        match self.routes.lock().unwrap().get(url) {
            Some(Route::Ok(p)) => Ok(p.clone()),
            Some(Route::Status(status, reason)) => Err(BootError::Transport {
                url: url.to_string(),
                status: *status,
                reason: reason.to_string(),
            }),
            None => Err(BootError::Network {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}

/// Executor backed by a closure, counting invocations.
pub struct FnExecutor<F> {
    run: F,
    calls: AtomicUsize,
}

impl<F> FnExecutor<F>
where
    F: Fn(&str) -> Result<(), String> + Send + Sync,
{
    pub fn new(run: F) -> Self {
        Self {
            run,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<F> ScriptExecutor for FnExecutor<F>
where
    F: Fn(&str) -> Result<(), String> + Send + Sync,
{
    fn execute(&self, source: &str) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.run)(source)
    }
}

pub fn inert_executor() -> FnExecutor<impl Fn(&str) -> Result<(), String> + Send + Sync> {
    FnExecutor::new(|_: &str| Ok(()))
}

pub fn config() -> BootConfig {
    BootConfig::default()
        .with_module_url("/dist/app_bg.wasm")
        .with_fallbacks(["/dist/app_bg.wasm", "/app_bg.wasm", "/src/app_bg.wasm"])
}
