use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use futures::channel::mpsc;

use crate::chunk::ChunkState;
use crate::config::RuntimeConfig;
use crate::error::LoadError;
use crate::host::{BinaryFetcher, ScriptHost};
use crate::intake::{ChunkDelivery, IntakeSender};
use crate::linker::BinaryLinker;
use crate::manifest::BundleManifest;
use crate::registry::ModuleRegistry;
use crate::value::Exports;

pub(crate) struct Inner {
    pub(crate) config: RuntimeConfig,
    pub(crate) manifest: BundleManifest,
    pub(crate) registry: ModuleRegistry,
    pub(crate) chunks: RefCell<HashMap<String, ChunkState>>,
    pub(crate) scripts: Rc<dyn ScriptHost>,
    pub(crate) linker: BinaryLinker,
    pub(crate) intake_tx: IntakeSender,
    pub(crate) intake_rx: RefCell<mpsc::UnboundedReceiver<ChunkDelivery>>,
    attempts: Cell<u64>,
}

impl Inner {
    pub(crate) fn next_attempt(&self) -> u64 {
        let next = self.attempts.get() + 1;
        self.attempts.set(next);
        next
    }
}

/// Owner of the module registry, the chunk table and the binary module table.
///
/// Single-threaded: clones share state through `Rc`, and futures handed out by the runtime must be
/// polled on the thread that created it, inside a tokio runtime with the time driver enabled.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<Inner>,
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        manifest: BundleManifest,
        scripts: Rc<dyn ScriptHost>,
        fetcher: Rc<dyn BinaryFetcher>,
    ) -> Self {
        let (intake_tx, intake_rx) = IntakeSender::channel();
        let preloaded = manifest.preloaded_chunks.clone();
        let runtime = Runtime {
            inner: Rc::new(Inner {
                config,
                manifest,
                registry: ModuleRegistry::new(),
                chunks: RefCell::new(HashMap::new()),
                scripts,
                linker: BinaryLinker::new(fetcher),
                intake_tx,
                intake_rx: RefCell::new(intake_rx),
                attempts: Cell::new(0),
            }),
        };
        for chunk_id in &preloaded {
            runtime.mark_preloaded(chunk_id);
        }
        tracing::debug!(
            preloaded = preloaded.len(),
            strategy = runtime.strategy().as_str(),
            "runtime created"
        );
        runtime
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn manifest(&self) -> &BundleManifest {
        &self.inner.manifest
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.inner.registry
    }

    /// Synchronous require. Deliveries still sitting in the intake are registered first.
    pub fn require(&self, unit_id: &str) -> Result<Exports, LoadError> {
        self.drain_intake();
        self.inner.registry.require(unit_id)
    }

    /// Loads `chunk_id`, then requires `unit_id` from it.
    pub async fn import(&self, chunk_id: &str, unit_id: &str) -> Result<Exports, LoadError> {
        self.ensure(chunk_id).await?;
        self.require(unit_id)
    }

    /// Boots the manifest's entry unit. Failures are logged and swallowed.
    pub async fn start(&self) -> Option<Exports> {
        self.drain_intake();
        let Some(entry) = self.inner.manifest.entry.clone() else {
            tracing::error!("bundle manifest declares no entry point");
            return None;
        };
        match self.import(&entry.chunk, &entry.unit).await {
            Ok(exports) => {
                tracing::info!(chunk = %entry.chunk, unit = %entry.unit, "entry loaded");
                Some(exports)
            }
            Err(err) => {
                tracing::error!(
                    chunk = %entry.chunk,
                    unit = %entry.unit,
                    kind = %err.kind(),
                    resource = err.resource(),
                    "{err}"
                );
                None
            }
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .field("chunks", &self.inner.chunks.borrow().len())
            .field("strategy", &self.strategy())
            .finish()
    }
}
