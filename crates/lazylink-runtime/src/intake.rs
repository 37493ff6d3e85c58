//! Where arriving chunks hand over their code units.

use std::fmt;
use std::rc::Rc;

use futures::channel::mpsc;
use tokio::sync::Notify;

use crate::chunk::ChunkState;
use crate::registry::LoaderBody;
use crate::runtime::Runtime;

/// One arrival posted by a running chunk script: the chunks it completes and the units it
/// contributes.
#[derive(Clone, Default)]
pub struct ChunkDelivery {
    pub chunk_ids: Vec<String>,
    pub units: Vec<(String, LoaderBody)>,
}

impl ChunkDelivery {
    pub fn new<I, S>(chunk_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunk_ids: chunk_ids.into_iter().map(Into::into).collect(),
            units: Vec::new(),
        }
    }

    pub fn unit(mut self, id: &str, body: LoaderBody) -> Self {
        self.units.push((id.to_owned(), body));
        self
    }
}

impl fmt::Debug for ChunkDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkDelivery")
            .field("chunk_ids", &self.chunk_ids)
            .field(
                "units",
                &self.units.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Sending half of the intake channel, handed to every injected script.
#[derive(Clone)]
pub struct IntakeSender {
    tx: mpsc::UnboundedSender<ChunkDelivery>,
    signal: Rc<Notify>,
}

impl IntakeSender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<ChunkDelivery>) {
        let (tx, rx) = mpsc::unbounded();
        let signal = Rc::new(Notify::new());
        (Self { tx, signal }, rx)
    }

    /// Queues `delivery` for the runtime and wakes every chunk load waiting on a script. Returns
    /// false once the runtime is gone.
    pub fn deliver(&self, delivery: ChunkDelivery) -> bool {
        if self.tx.unbounded_send(delivery).is_err() {
            return false;
        }
        self.signal.notify_waiters();
        true
    }

    /// Fires on every delivery. Waiters must take a `notified()` future before draining, so a
    /// delivery posted in between still wakes them.
    pub(crate) fn signal(&self) -> Rc<Notify> {
        Rc::clone(&self.signal)
    }
}

impl fmt::Debug for IntakeSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntakeSender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Runtime {
    pub fn intake(&self) -> IntakeSender {
        self.inner.intake_tx.clone()
    }

    /// Processes every queued delivery. Returns how many were handled.
    pub fn drain_intake(&self) -> usize {
        let mut handled = 0;
        loop {
            let next = self.inner.intake_rx.borrow_mut().try_recv();
            match next {
                Ok(delivery) => {
                    self.on_chunks_arrived(&delivery.chunk_ids, delivery.units);
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        handled
    }

    /// Registers `units` and completes `chunk_ids`. Waiters are resolved only after every unit is
    /// registered and every chunk is marked loaded, in the order their chunks were listed.
    pub fn on_chunks_arrived(&self, chunk_ids: &[String], units: Vec<(String, LoaderBody)>) {
        let mut resolvers = Vec::new();
        {
            let mut chunks = self.inner.chunks.borrow_mut();
            for id in chunk_ids {
                if let Some(ChunkState::Loading { resolver, .. }) = chunks.get_mut(id) {
                    if let Some(resolver) = resolver.take() {
                        resolvers.push(resolver);
                    }
                }
            }
        }

        for (id, body) in units {
            self.inner.registry.register(&id, body);
        }

        {
            let mut chunks = self.inner.chunks.borrow_mut();
            for id in chunk_ids {
                let next = match chunks.remove(id) {
                    Some(ChunkState::Loading { attempt, pending, .. }) => {
                        tracing::debug!(chunk = %id, attempt, "chunk registered");
                        ChunkState::Loaded {
                            attempt,
                            pending: Some(pending),
                        }
                    }
                    Some(loaded @ ChunkState::Loaded { .. }) => loaded,
                    None => {
                        tracing::debug!(chunk = %id, "unrequested chunk registered");
                        ChunkState::Loaded {
                            attempt: 0,
                            pending: None,
                        }
                    }
                };
                chunks.insert(id.clone(), next);
            }
        }

        for resolver in resolvers {
            let _ = resolver.send(());
        }
    }
}
