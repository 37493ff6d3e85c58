use std::time::Duration;

use futures::future::{self, Shared};
use lazylink_runtime::{
    ChunkStatus, HostCapabilities, LinkStatus, LinkStrategy, LoadErrorKind, PayloadCatalog,
    ScriptCatalog, Value,
};


use fixture::{Harness, APP_PAYLOAD_SRC, APP_WASM, CHUNK0_SRC, ENTRY_UNIT};

#[tokio::test]
async fn entry_runs_against_the_linked_module() {
    let h = Harness::app();
    assert_eq!(h.runtime.strategy(), LinkStrategy::StreamingInstantiate);

    h.runtime.ensure("0").await.expect("chunk 0 loads");
    assert_eq!(h.runtime.link_status(APP_WASM), LinkStatus::Linked);
    let table = h
        .runtime
        .registry()
        .binary_exports(APP_WASM)
        .expect("export table published");
    assert_eq!(
        table.names(),
        vec!["add".to_string(), "roll".to_string(), "run".to_string()]
    );

    let entry = h.runtime.require(ENTRY_UNIT).expect("entry runs");
    assert!(!entry.is_empty());
    assert_eq!(entry.get("ran"), Some(Value::I32(1)));
    assert_eq!(entry.get("sum"), Some(Value::I32(5)));
    assert_eq!(h.console(), vec!["tick".to_string()]);
    assert_eq!(table.call("roll", &[]).expect("roll"), vec![Value::F64(0.25)]);
}

#[tokio::test(start_paused = true)]
async fn chunk_waits_for_both_script_and_link() {
    let console = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let h = Harness::new(
        fixture::full_manifest(),
        ScriptCatalog::new()
            .with_latency(Duration::from_millis(250))
            .with(CHUNK0_SRC, fixture::chunk0(console)),
        PayloadCatalog::new().with(APP_PAYLOAD_SRC, fixture::app_wasm()),
    );

    let pending = h.runtime.ensure("0");
    h.runtime.link(APP_WASM).await.expect("link completes first");
    assert_eq!(h.runtime.link_status(APP_WASM), LinkStatus::Linked);
    assert!(pending.peek().is_none());
    assert_eq!(h.runtime.chunk_status("0"), ChunkStatus::Loading);

    pending.await.expect("chunk 0 loads once the script ran");
    assert_eq!(h.runtime.chunk_status("0"), ChunkStatus::Loaded);
}

#[tokio::test]
async fn concurrent_ensure_links_each_module_once() {
    let h = Harness::app();
    let a = h.runtime.ensure("0");
    let b = h.runtime.ensure("0");
    assert!(Shared::ptr_eq(&a, &b));
    let (a, b) = future::join(a, b).await;
    a.expect("first waiter");
    b.expect("second waiter");

    assert_eq!(h.scripts.injection_count(CHUNK0_SRC), 1);
    assert_eq!(h.payloads.fetch_count(APP_PAYLOAD_SRC), 1);
    let first = h.runtime.link(APP_WASM);
    let second = h.runtime.link(APP_WASM);
    assert!(Shared::ptr_eq(&first, &second));
    assert_eq!(h.payloads.fetch_count(APP_PAYLOAD_SRC), 1);
}

#[tokio::test]
async fn missing_import_fails_atomically() {
    let console = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let h = Harness::new(
        fixture::manifest(&["log"]),
        ScriptCatalog::new().with(CHUNK0_SRC, fixture::chunk0(console)),
        PayloadCatalog::new().with(APP_PAYLOAD_SRC, fixture::app_wasm()),
    );

    let err = h.runtime.ensure("0").await.expect_err("random is not wired");
    assert_eq!(err.kind(), LoadErrorKind::LinkError);
    assert_eq!(err.resource(), APP_WASM);
    assert!(err.message().contains("random"), "err={err}");
    assert!(h.runtime.registry().binary_exports(APP_WASM).is_none());
    assert_eq!(h.runtime.link_status(APP_WASM), LinkStatus::Failed);
    assert_eq!(h.runtime.chunk_status("0"), ChunkStatus::Unloaded);

    // The failure is cached: a retry re-injects the script but never refetches.
    let again = h.runtime.ensure("0").await.expect_err("still failing");
    assert_eq!(again.kind(), LoadErrorKind::LinkError);
    assert_eq!(h.scripts.injection_count(CHUNK0_SRC), 2);
    assert_eq!(h.payloads.fetch_count(APP_PAYLOAD_SRC), 1);
}

#[tokio::test]
async fn buffered_host_links_in_two_steps() {
    let console = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let h = Harness::new(
        fixture::full_manifest(),
        ScriptCatalog::new().with(CHUNK0_SRC, fixture::chunk0(console.clone())),
        PayloadCatalog::new()
            .with_capabilities(HostCapabilities::BUFFERED_ONLY)
            .with(APP_PAYLOAD_SRC, fixture::app_wasm()),
    );
    assert_eq!(h.runtime.strategy(), LinkStrategy::Buffered);

    let entry = h.runtime.import("0", ENTRY_UNIT).await.expect("entry loads");
    assert_eq!(entry.get("sum"), Some(Value::I32(5)));
    assert_eq!(*console.borrow(), vec!["tick".to_string()]);
}

#[tokio::test]
async fn streaming_compile_only_host_still_links() {
    let h = Harness::new(
        fixture::full_manifest(),
        ScriptCatalog::new(),
        PayloadCatalog::new()
            .with_capabilities(HostCapabilities {
                streaming_compile: true,
                streaming_instantiate: false,
            })
            .with(APP_PAYLOAD_SRC, fixture::app_wasm()),
    );
    assert_eq!(h.runtime.strategy(), LinkStrategy::StreamingCompile);
    let table = h.runtime.link(APP_WASM).await.expect("links");
    assert_eq!(table.module_id(), APP_WASM);
}

#[tokio::test]
async fn non_wasm_payload_is_a_link_error() {
    let h = Harness::new(
        fixture::full_manifest(),
        ScriptCatalog::new(),
        PayloadCatalog::new().with(APP_PAYLOAD_SRC, b"<!doctype html><p>not found</p>".to_vec()),
    );
    let err = h.runtime.link(APP_WASM).await.expect_err("html is not wasm");
    assert_eq!(err.kind(), LoadErrorKind::LinkError);
    assert!(err.message().contains("bad magic"), "err={err}");
}

#[tokio::test]
async fn missing_payload_is_a_fetch_error() {
    let h = Harness::new(fixture::full_manifest(), ScriptCatalog::new(), PayloadCatalog::new());
    let err = h.runtime.link(APP_WASM).await.expect_err("no payload");
    assert_eq!(err.kind(), LoadErrorKind::FetchError);
    assert_eq!(err.resource(), APP_PAYLOAD_SRC);
    assert_eq!(h.runtime.link_status(APP_WASM), LinkStatus::Failed);
}

#[tokio::test]
async fn start_boots_the_manifest_entry() {
    let h = Harness::app();
    let entry = h.runtime.start().await.expect("entry loads");
    assert_eq!(entry.get("ran"), Some(Value::I32(1)));
    assert!(h.runtime.registry().is_initialized(ENTRY_UNIT));
}
