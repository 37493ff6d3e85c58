//! In-process hosts: chunk scripts and binary payloads looked up by URL.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;

use crate::host::{BinaryFetcher, HostCapabilities, Payload, ScriptEvent, ScriptHost, ScriptRequest};
use crate::intake::{ChunkDelivery, IntakeSender};

/// What running a catalogued script does.
#[derive(Debug, Clone)]
pub enum ScriptBehavior {
    /// Posts the delivery, then fires `load`.
    Deliver(ChunkDelivery),
    /// Fires `error` with the given detail.
    Fail(String),
    /// Fires `load` without delivering anything.
    Empty,
    /// Never completes.
    Hang,
}

#[derive(Debug, Default)]
pub struct ScriptCatalog {
    scripts: RefCell<HashMap<String, ScriptBehavior>>,
    injections: RefCell<Vec<ScriptRequest>>,
    latency: Option<Duration>,
}

impl ScriptCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every script's effect by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with(self, src: &str, behavior: ScriptBehavior) -> Self {
        self.set_behavior(src, behavior);
        self
    }

    pub fn set_behavior(&self, src: &str, behavior: ScriptBehavior) {
        self.scripts.borrow_mut().insert(src.to_owned(), behavior);
    }

    pub fn injections(&self) -> Vec<ScriptRequest> {
        self.injections.borrow().clone()
    }

    pub fn injection_count(&self, src: &str) -> usize {
        self.injections
            .borrow()
            .iter()
            .filter(|request| request.src == src)
            .count()
    }
}

impl ScriptHost for ScriptCatalog {
    fn inject_script(
        &self,
        request: ScriptRequest,
        intake: IntakeSender,
    ) -> LocalBoxFuture<'static, ScriptEvent> {
        let behavior = self
            .scripts
            .borrow()
            .get(&request.src)
            .cloned()
            .unwrap_or_else(|| ScriptBehavior::Fail(format!("404 Not Found: {}", request.src)));
        tracing::trace!(src = %request.src, ?behavior, "catalog script injected");
        self.injections.borrow_mut().push(request);

        let run = move || match behavior {
            ScriptBehavior::Deliver(delivery) => {
                intake.deliver(delivery);
                Some(ScriptEvent::Load)
            }
            ScriptBehavior::Fail(detail) => Some(ScriptEvent::Error(detail)),
            ScriptBehavior::Empty => Some(ScriptEvent::Load),
            ScriptBehavior::Hang => None,
        };

        match self.latency {
            None => match run() {
                Some(event) => future::ready(event).boxed_local(),
                None => future::pending().boxed_local(),
            },
            Some(latency) => async move {
                tokio::time::sleep(latency).await;
                match run() {
                    Some(event) => event,
                    None => future::pending().await,
                }
            }
            .boxed_local(),
        }
    }
}

#[derive(Debug)]
pub struct PayloadCatalog {
    payloads: RefCell<HashMap<String, Vec<u8>>>,
    capabilities: HostCapabilities,
    piece_size: usize,
    fetches: RefCell<Vec<String>>,
}

impl Default for PayloadCatalog {
    fn default() -> Self {
        Self {
            payloads: RefCell::new(HashMap::new()),
            capabilities: HostCapabilities::default(),
            piece_size: 4096,
            fetches: RefCell::new(Vec::new()),
        }
    }
}

impl PayloadCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Size of the pieces streamed payloads are cut into.
    pub fn with_piece_size(mut self, piece_size: usize) -> Self {
        self.piece_size = piece_size.max(1);
        self
    }

    pub fn with(self, src: &str, bytes: Vec<u8>) -> Self {
        self.insert(src, bytes);
        self
    }

    pub fn insert(&self, src: &str, bytes: Vec<u8>) {
        self.payloads.borrow_mut().insert(src.to_owned(), bytes);
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.borrow().clone()
    }

    pub fn fetch_count(&self, src: &str) -> usize {
        self.fetches.borrow().iter().filter(|s| *s == src).count()
    }
}

impl BinaryFetcher for PayloadCatalog {
    fn capabilities(&self) -> HostCapabilities {
        self.capabilities
    }

    fn fetch(&self, src: &str) -> LocalBoxFuture<'static, anyhow::Result<Payload>> {
        self.fetches.borrow_mut().push(src.to_owned());
        let Some(bytes) = self.payloads.borrow().get(src).cloned() else {
            let src = src.to_owned();
            return future::ready(Err(anyhow::anyhow!("404 Not Found: {src}"))).boxed_local();
        };
        let payload = if self.capabilities.streaming_compile || self.capabilities.streaming_instantiate {
            Payload::from_pieces(bytes.chunks(self.piece_size).map(<[u8]>::to_vec).collect())
        } else {
            Payload::Buffered(bytes)
        };
        future::ready(Ok(payload)).boxed_local()
    }
}
