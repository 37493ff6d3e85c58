use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::Context;
use futures::future::{self, LocalBoxFuture, Shared};
use futures::FutureExt;

use crate::error::{LoadError, LoadErrorKind};
use crate::host::{BinaryFetcher, HostCapabilities, Payload};
use crate::manifest::BundleManifest;
use crate::registry::ModuleRegistry;
use crate::runtime::Runtime;
use crate::wasm::{ExportTable, ImportTable, WasmEngine};

/// Shared outcome of one link attempt. Every requester of the same module gets a clone.
pub type PendingLink = Shared<LocalBoxFuture<'static, Result<Rc<ExportTable>, LoadError>>>;

/// How a fetched payload becomes an instance. Chosen once per runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStrategy {
    /// The response is piped into a combined compile-and-instantiate step.
    StreamingInstantiate,
    /// The response is piped into the compiler; instantiation is a separate step.
    StreamingCompile,
    /// The whole payload is buffered, then compiled, then instantiated.
    Buffered,
}

impl LinkStrategy {
    pub fn select(capabilities: HostCapabilities) -> Self {
        if capabilities.streaming_instantiate {
            LinkStrategy::StreamingInstantiate
        } else if capabilities.streaming_compile {
            LinkStrategy::StreamingCompile
        } else {
            LinkStrategy::Buffered
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkStrategy::StreamingInstantiate => "streaming_instantiate",
            LinkStrategy::StreamingCompile => "streaming_compile",
            LinkStrategy::Buffered => "buffered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "streaming_instantiate" => Some(LinkStrategy::StreamingInstantiate),
            "streaming_compile" => Some(LinkStrategy::StreamingCompile),
            "buffered" => Some(LinkStrategy::Buffered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Unlinked,
    Linking,
    Linked,
    Failed,
}

pub(crate) struct BinaryLinker {
    engine: WasmEngine,
    strategy: LinkStrategy,
    fetcher: Rc<dyn BinaryFetcher>,
    links: RefCell<HashMap<String, PendingLink>>,
}

impl BinaryLinker {
    pub(crate) fn new(fetcher: Rc<dyn BinaryFetcher>) -> Self {
        let strategy = LinkStrategy::select(fetcher.capabilities());
        Self {
            engine: WasmEngine::new(),
            strategy,
            fetcher,
            links: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn strategy(&self) -> LinkStrategy {
        self.strategy
    }

    pub(crate) fn status(&self, module_id: &str) -> LinkStatus {
        match self.links.borrow().get(module_id) {
            None => LinkStatus::Unlinked,
            Some(pending) => match pending.peek() {
                None => LinkStatus::Linking,
                Some(Ok(_)) => LinkStatus::Linked,
                Some(Err(_)) => LinkStatus::Failed,
            },
        }
    }

    pub(crate) fn link(
        &self,
        manifest: &BundleManifest,
        public_path: &str,
        registry: &ModuleRegistry,
        module_id: &str,
    ) -> PendingLink {
        if let Some(pending) = self.links.borrow().get(module_id) {
            return pending.clone();
        }

        let attempt: LocalBoxFuture<'static, Result<Rc<ExportTable>, LoadError>> =
            match prepare(manifest, public_path, module_id) {
                Err(err) => future::ready(Err(err)).boxed_local(),
                Ok((imports, src)) => {
                    tracing::debug!(
                        module = module_id,
                        %src,
                        strategy = self.strategy.as_str(),
                        "fetching binary module"
                    );
                    let fetch = self.fetcher.fetch(&src);
                    let engine = self.engine.clone();
                    let strategy = self.strategy;
                    let registry = registry.clone();
                    let id = module_id.to_owned();
                    async move {
                        let payload = fetch.await.map_err(|err| LoadError::fetch(&id, &src, &err))?;
                        let table = instantiate_with(&engine, strategy, payload, &imports, &registry, &id)
                            .await
                            .map_err(|err| LoadError::link(&id, &err))?;
                        let table = Rc::new(table);
                        registry.set_binary_exports(&id, table.clone());
                        tracing::debug!(module = %id, exports = table.len(), "binary module linked");
                        Ok(table)
                    }
                    .boxed_local()
                }
            };

        let id = module_id.to_owned();
        let pending = attempt
            .inspect(move |result| {
                if let Err(err) = result {
                    tracing::warn!(module = %id, kind = %err.kind(), "{err}");
                }
            })
            .boxed_local()
            .shared();
        self.links
            .borrow_mut()
            .insert(module_id.to_owned(), pending.clone());
        pending
    }
}

fn prepare(
    manifest: &BundleManifest,
    public_path: &str,
    module_id: &str,
) -> Result<(ImportTable, String), LoadError> {
    let undeclared = || {
        LoadError::new(
            LoadErrorKind::LinkError,
            module_id,
            format!("binary module {module_id:?} is not declared in the bundle manifest"),
        )
    };
    let module = manifest.binary_modules.get(module_id).ok_or_else(undeclared)?;
    let src = manifest
        .binary_module_src(public_path, module_id)
        .ok_or_else(undeclared)?;
    Ok((ImportTable::from_manifest(module), src))
}

async fn instantiate_with(
    engine: &WasmEngine,
    strategy: LinkStrategy,
    payload: Payload,
    imports: &ImportTable,
    registry: &ModuleRegistry,
    module_id: &str,
) -> anyhow::Result<ExportTable> {
    match strategy {
        LinkStrategy::StreamingInstantiate => {
            let module = engine.compile_streaming(payload).await?;
            engine.instantiate(&module, imports, registry, module_id)
        }
        LinkStrategy::StreamingCompile => {
            let module = engine
                .compile_streaming(payload)
                .await
                .context("streaming compile")?;
            engine
                .instantiate(&module, imports, registry, module_id)
                .context("instantiate compiled module")
        }
        LinkStrategy::Buffered => {
            let bytes = payload.into_bytes().await.context("buffer binary module")?;
            let module = engine.compile(&bytes)?;
            engine.instantiate(&module, imports, registry, module_id)
        }
    }
}

impl Runtime {
    /// Links `module_id` once per process; later calls share the first attempt.
    pub fn link(&self, module_id: &str) -> PendingLink {
        self.inner.linker.link(
            &self.inner.manifest,
            &self.inner.config.public_path,
            &self.inner.registry,
            module_id,
        )
    }

    pub fn link_status(&self, module_id: &str) -> LinkStatus {
        self.inner.linker.status(module_id)
    }

    pub fn strategy(&self) -> LinkStrategy {
        self.inner.linker.strategy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_follows_capabilities() {
        assert_eq!(
            LinkStrategy::select(HostCapabilities::FULL),
            LinkStrategy::StreamingInstantiate
        );
        assert_eq!(
            LinkStrategy::select(HostCapabilities {
                streaming_compile: true,
                streaming_instantiate: false,
            }),
            LinkStrategy::StreamingCompile
        );
        assert_eq!(
            LinkStrategy::select(HostCapabilities::BUFFERED_ONLY),
            LinkStrategy::Buffered
        );
        for s in [
            LinkStrategy::StreamingInstantiate,
            LinkStrategy::StreamingCompile,
            LinkStrategy::Buffered,
        ] {
            assert_eq!(LinkStrategy::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn undeclared_module_is_a_link_error() {
        let err = prepare(&BundleManifest::default(), "", "ghost.wasm").unwrap_err();
        assert_eq!(err.kind(), LoadErrorKind::LinkError);
        assert_eq!(err.resource(), "ghost.wasm");
    }
}
