//! Contracts between the loader and whatever actually fetches and runs resources.

use std::time::Duration;

use futures::future::LocalBoxFuture;
use futures::stream::LocalBoxStream;
use futures::StreamExt;

use crate::intake::IntakeSender;

/// Everything a host needs to inject one chunk script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRequest {
    pub chunk_id: String,
    pub src: String,
    pub charset: String,
    pub timeout: Duration,
    pub nonce: Option<String>,
}

/// Completion event reported by the host after the script ran (or failed to).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEvent {
    Load,
    Error(String),
}

impl ScriptEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptEvent::Load => "load",
            ScriptEvent::Error(_) => "error",
        }
    }
}

pub trait ScriptHost {
    /// Starts running `request.src`. The script posts its units on `intake`; the returned future
    /// completes with the host's `load`/`error` event. A future that never completes is a hang
    /// and is cut off by the chunk timeout.
    fn inject_script(
        &self,
        request: ScriptRequest,
        intake: IntakeSender,
    ) -> LocalBoxFuture<'static, ScriptEvent>;
}

pub type PayloadStream = LocalBoxStream<'static, anyhow::Result<Vec<u8>>>;

/// A fetched binary module payload.
pub enum Payload {
    /// Pieces as they arrive off the wire.
    Stream(PayloadStream),
    Buffered(Vec<u8>),
}

impl Payload {
    pub fn from_pieces(pieces: Vec<Vec<u8>>) -> Self {
        Payload::Stream(futures::stream::iter(pieces.into_iter().map(Ok)).boxed_local())
    }

    pub async fn into_bytes(self) -> anyhow::Result<Vec<u8>> {
        match self {
            Payload::Buffered(bytes) => Ok(bytes),
            Payload::Stream(mut stream) => {
                let mut out = Vec::new();
                while let Some(piece) = stream.next().await {
                    out.extend_from_slice(&piece?);
                }
                Ok(out)
            }
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Stream(_) => f.write_str("Payload::Stream"),
            Payload::Buffered(bytes) => write!(f, "Payload::Buffered({} bytes)", bytes.len()),
        }
    }
}

/// What the host can do with a payload response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    pub streaming_compile: bool,
    pub streaming_instantiate: bool,
}

impl HostCapabilities {
    pub const FULL: HostCapabilities = HostCapabilities {
        streaming_compile: true,
        streaming_instantiate: true,
    };
    pub const BUFFERED_ONLY: HostCapabilities = HostCapabilities {
        streaming_compile: false,
        streaming_instantiate: false,
    };
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self::FULL
    }
}

pub trait BinaryFetcher {
    fn capabilities(&self) -> HostCapabilities;

    fn fetch(&self, src: &str) -> LocalBoxFuture<'static, anyhow::Result<Payload>>;
}
