mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use tokio::time::Instant;
use wasmboot::prelude::*;

const SCRIPT: &str = "export default async function init() { /* wasm-bindgen glue */ }";

fn html_then_script() -> MemoryFetcher {
    MemoryFetcher::new()
        .serve("/dist/app_bg.wasm", "text/html; charset=utf-8", INDEX_HTML)
        .serve("/dist/app.js", "application/javascript", SCRIPT)
}

#[tokio::test]
async fn script_that_publishes_recovers_immediately() {
    init_tracing();
    let registry = ModuleRegistry::new();
    let slot = registry.clone();
    let executor = FnExecutor::new(move |src: &str| {
        assert_eq!(src, SCRIPT);
        slot.publish(instance_from(APP_MODULE))
            .map(|_| ())
            .map_err(|e| e.to_string())
    });
    let fetcher = html_then_script();
    let boot = Bootstrap::new(config(), fetcher.clone(), executor)
        .unwrap()
        .with_registry(registry.clone());

    let report = boot.run().await.unwrap();

    assert_eq!(report.route, BootRoute::Recovered(RecoveredBy::Script));
    assert_eq!(report.url.as_deref(), Some("/dist/app_bg.wasm"));
    assert_eq!(report.entry_point, EntryPointOutcome::Absent);
    assert!(registry.is_ready());
    assert_eq!(
        fetcher.requests(),
        vec!["/dist/app_bg.wasm".to_string(), "/dist/app.js".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn script_that_never_publishes_times_out() {
    init_tracing();
    let boot = Bootstrap::new(config(), html_then_script(), inert_executor()).unwrap();
    let start = Instant::now();

    let err = boot.run().await.unwrap_err();

    assert!(matches!(
        err,
        BootError::RecoveryTimeout { ref url, attempts: 10, interval_ms: 500 } if url == "/dist/app.js"
    ));
    assert_eq!(start.elapsed(), Duration::from_secs(5));
    assert!(!boot.registry().is_ready());
}

#[tokio::test]
async fn exposed_initializer_is_invoked_once() {
    let registry = ModuleRegistry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let slot = registry.clone();
    let counter = Arc::clone(&calls);
    let executor = FnExecutor::new(move |_: &str| {
        let counter = Arc::clone(&counter);
        slot.expose_initializer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Some(instance_from(APP_MODULE)))
        });
        Ok(())
    });
    let boot = Bootstrap::new(config(), html_then_script(), executor)
        .unwrap()
        .with_registry(registry.clone());

    let report = boot.run().await.unwrap();

    assert_eq!(report.route, BootRoute::Recovered(RecoveredBy::Initializer));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!registry.has_initializer());
    assert!(report.instance.is_callable("greet"));
}

#[tokio::test(start_paused = true)]
async fn failed_initializer_falls_through_to_polling() {
    let registry = ModuleRegistry::new();
    let slot = registry.clone();
    let executor = FnExecutor::new(move |_: &str| {
        slot.expose_initializer(|| Err("init threw".to_string()));
        Ok(())
    });
    let boot = Bootstrap::new(config(), html_then_script(), executor)
        .unwrap()
        .with_registry(registry);

    let err = boot.run().await.unwrap_err();
    assert!(matches!(err, BootError::RecoveryTimeout { .. }));
}

#[tokio::test(start_paused = true)]
async fn late_publication_is_found_by_polling() {
    let registry = ModuleRegistry::new();
    let slot = registry.clone();
    let executor = FnExecutor::new(move |_: &str| {
        let slot = slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            slot.publish(instance_from(APP_MODULE)).unwrap();
        });
        Ok(())
    });
    let boot = Bootstrap::new(config(), html_then_script(), executor)
        .unwrap()
        .with_registry(registry);
    let start = Instant::now();

    let report = boot.run().await.unwrap();

    assert_eq!(report.route, BootRoute::Recovered(RecoveredBy::Polling { attempt: 3 }));
    assert_eq!(start.elapsed(), Duration::from_millis(1500));
}

#[tokio::test]
async fn html_served_as_the_script_is_rejected() {
    let fetcher = MemoryFetcher::new()
        .serve("/dist/app_bg.wasm", "text/html", INDEX_HTML)
        .serve("/dist/app.js", "application/javascript", INDEX_HTML);
    let executor = inert_executor();
    let boot = Bootstrap::new(config(), fetcher, executor).unwrap();

    let err = boot.run().await.unwrap_err();

    assert!(matches!(err, BootError::Script { ref reason, .. } if reason.contains("HTML")));
}

#[tokio::test]
async fn script_with_wrong_content_type_is_not_executed() {
    let fetcher = MemoryFetcher::new()
        .serve("/dist/app_bg.wasm", "text/html", INDEX_HTML)
        .serve("/dist/app.js", "text/plain", SCRIPT);
    let boot = Bootstrap::new(config(), fetcher, inert_executor()).unwrap();

    let err = boot.run().await.unwrap_err();

    assert!(matches!(err, BootError::Script { ref url, .. } if url == "/dist/app.js"));
}

#[tokio::test]
async fn missing_script_ends_recovery_without_trying_fallbacks() {
    let fetcher = MemoryFetcher::new()
        .serve("/dist/app_bg.wasm", "text/html", INDEX_HTML)
        .serve("/app_bg.wasm", "application/wasm", app_module())
        .status("/dist/app.js", 404, "Not Found");
    let boot = Bootstrap::new(config(), fetcher.clone(), inert_executor()).unwrap();

    let err = boot.run().await.unwrap_err();

    assert!(matches!(err, BootError::Script { ref reason, .. } if reason.contains("404")));
    assert!(!fetcher.requests().contains(&"/app_bg.wasm".to_string()));
}

#[tokio::test]
async fn executor_failure_is_a_script_error() {
    let executor = FnExecutor::new(|_: &str| Err("SyntaxError: unexpected token".to_string()));
    let boot = Bootstrap::new(config(), html_then_script(), executor).unwrap();

    let err = boot.run().await.unwrap_err();

    assert!(matches!(err, BootError::Script { ref reason, .. } if reason.starts_with("SyntaxError")));
}

#[tokio::test]
async fn module_url_without_suffix_cannot_recover() {
    let cfg = BootConfig::default()
        .with_module_url("/dist/app.wasm")
        .with_fallbacks(Vec::<String>::new());
    let fetcher = MemoryFetcher::new().serve("/dist/app.wasm", "text/html", INDEX_HTML);
    let boot = Bootstrap::new(cfg, fetcher, inert_executor()).unwrap();

    assert!(matches!(boot.run().await, Err(BootError::Script { .. })));
}
