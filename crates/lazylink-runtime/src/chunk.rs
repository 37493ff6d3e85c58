//! Chunk loading: one script injection per chunk, shared by every concurrent caller.

use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, Either, LocalBoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::Notify;

use crate::error::{LoadError, LoadErrorKind};
use crate::host::{ScriptEvent, ScriptRequest};
use crate::linker::PendingLink;
use crate::runtime::{Inner, Runtime};

/// Shared outcome of one chunk load.
pub type PendingLoad = Shared<LocalBoxFuture<'static, Result<(), LoadError>>>;

pub(crate) enum ChunkState {
    Loading {
        attempt: u64,
        /// Taken and fired by the intake once the chunk's units are registered.
        resolver: Option<oneshot::Sender<()>>,
        pending: PendingLoad,
    },
    Loaded {
        attempt: u64,
        /// Kept while binary modules of the attempt may still be linking.
        pending: Option<PendingLoad>,
    },
}

impl ChunkState {
    fn attempt(&self) -> u64 {
        match self {
            ChunkState::Loading { attempt, .. } | ChunkState::Loaded { attempt, .. } => *attempt,
        }
    }

    fn pending(&self) -> Option<PendingLoad> {
        match self {
            ChunkState::Loading { pending, .. } => Some(pending.clone()),
            ChunkState::Loaded { pending, .. } => pending.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Unloaded,
    Loading,
    Loaded,
}

impl ChunkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStatus::Unloaded => "unloaded",
            ChunkStatus::Loading => "loading",
            ChunkStatus::Loaded => "loaded",
        }
    }
}

impl Runtime {
    /// Resolves once every code unit and binary module of `chunk_id` is ready to be required.
    pub fn ensure(&self, chunk_id: &str) -> PendingLoad {
        self.drain_intake();

        let existing = self
            .inner
            .chunks
            .borrow()
            .get(chunk_id)
            .map(ChunkState::pending);
        match existing {
            Some(Some(pending)) => return pending,
            Some(None) => return self.links_of(chunk_id),
            None => {}
        }

        let attempt = self.inner.next_attempt();
        let src = self
            .inner
            .manifest
            .chunk_script_src(&self.inner.config.public_path, chunk_id);
        let request = ScriptRequest {
            chunk_id: chunk_id.to_owned(),
            src: src.clone(),
            charset: self.inner.config.charset.clone(),
            timeout: self.inner.config.chunk_timeout,
            nonce: self.inner.config.nonce.clone(),
        };
        tracing::debug!(chunk = chunk_id, %src, attempt, "injecting chunk script");

        let (resolver, arrival) = oneshot::channel();
        let event = self.inner.scripts.inject_script(request, self.intake());
        let links = self.link_all(chunk_id);
        let weak = Rc::downgrade(&self.inner);
        let script = wait_for_script(
            weak.clone(),
            self.inner.intake_tx.signal(),
            chunk_id.to_owned(),
            src,
            attempt,
            self.inner.config.chunk_timeout,
            arrival,
            event,
        );

        let id = chunk_id.to_owned();
        let pending = async move {
            let (script, linked) = future::join(script, future::try_join_all(links)).await;
            let result = script.and(linked.map(|_| ()));
            if let Some(inner) = weak.upgrade() {
                let runtime = Runtime { inner };
                match &result {
                    Ok(()) => tracing::debug!(chunk = %id, attempt, "chunk loaded"),
                    Err(err) => {
                        runtime.clear_attempt(&id, attempt);
                        tracing::warn!(chunk = %id, attempt, kind = %err.kind(), "{err}");
                    }
                }
            }
            result
        }
        .boxed_local()
        .shared();

        self.inner.chunks.borrow_mut().insert(
            chunk_id.to_owned(),
            ChunkState::Loading {
                attempt,
                resolver: Some(resolver),
                pending: pending.clone(),
            },
        );
        pending
    }

    pub fn chunk_status(&self, chunk_id: &str) -> ChunkStatus {
        match self.inner.chunks.borrow().get(chunk_id) {
            None => ChunkStatus::Unloaded,
            Some(ChunkState::Loading { .. }) => ChunkStatus::Loading,
            Some(ChunkState::Loaded { .. }) => ChunkStatus::Loaded,
        }
    }

    pub(crate) fn mark_preloaded(&self, chunk_id: &str) {
        self.inner.chunks.borrow_mut().insert(
            chunk_id.to_owned(),
            ChunkState::Loaded {
                attempt: 0,
                pending: None,
            },
        );
    }

    fn link_all(&self, chunk_id: &str) -> Vec<PendingLink> {
        let modules = self.inner.manifest.chunk_binary_modules(chunk_id).to_vec();
        modules.iter().map(|module_id| self.link(module_id)).collect()
    }

    /// A chunk that is already loaded still waits for its binary modules.
    fn links_of(&self, chunk_id: &str) -> PendingLoad {
        let links = self.link_all(chunk_id);
        async move { future::try_join_all(links).await.map(|_| ()) }
            .boxed_local()
            .shared()
    }

    /// Drops the marker left by `attempt` so the next `ensure` starts over. A newer attempt is
    /// left alone.
    fn clear_attempt(&self, chunk_id: &str, attempt: u64) {
        let mut chunks = self.inner.chunks.borrow_mut();
        if chunks.get(chunk_id).is_some_and(|state| state.attempt() == attempt) {
            chunks.remove(chunk_id);
        }
    }

    fn settle_script(
        &self,
        chunk_id: &str,
        src: &str,
        outcome: Result<ScriptEvent, tokio::time::error::Elapsed>,
    ) -> Result<(), LoadError> {
        self.drain_intake();
        if matches!(
            self.inner.chunks.borrow().get(chunk_id),
            Some(ChunkState::Loaded { .. })
        ) {
            return Ok(());
        }
        let (kind, detail) = match outcome {
            Ok(ScriptEvent::Load) => (LoadErrorKind::Missing, None),
            Ok(ScriptEvent::Error(detail)) => (LoadErrorKind::FetchError, Some(detail)),
            Err(_) => (LoadErrorKind::Timeout, None),
        };
        Err(LoadError::chunk(kind, chunk_id, src, detail.as_deref()))
    }
}

/// Races the intake's resolver against the host's completion event, bounded by `timeout`. Every
/// delivery posted on the intake wakes the race and is registered straight away, so a chunk
/// completed by another script does not wait for its own script's event.
#[allow(clippy::too_many_arguments)]
async fn wait_for_script(
    runtime: Weak<Inner>,
    signal: Rc<Notify>,
    chunk_id: String,
    src: String,
    attempt: u64,
    timeout: Duration,
    mut arrival: oneshot::Receiver<()>,
    event: LocalBoxFuture<'static, ScriptEvent>,
) -> Result<(), LoadError> {
    let mut timed = Box::pin(tokio::time::timeout(timeout, event));
    let outcome = loop {
        let notified = Box::pin(signal.notified());
        if let Some(inner) = runtime.upgrade() {
            Runtime { inner }.drain_intake();
        }
        let settled = match future::select(&mut arrival, future::select(timed.as_mut(), notified)).await {
            Either::Left((Ok(()), _)) => return Ok(()),
            Either::Left((Err(oneshot::Canceled), _)) => None,
            Either::Right((Either::Left((outcome, _)), _)) => Some(outcome),
            Either::Right((Either::Right(((), _)), _)) => continue,
        };
        break match settled {
            Some(outcome) => outcome,
            None => timed.await,
        };
    };
    tracing::trace!(chunk = %chunk_id, attempt, "chunk script completed");
    match runtime.upgrade() {
        Some(inner) => Runtime { inner }.settle_script(&chunk_id, &src, outcome),
        None => Err(LoadError::chunk(
            LoadErrorKind::FetchError,
            &chunk_id,
            &src,
            Some("runtime dropped"),
        )),
    }
}
