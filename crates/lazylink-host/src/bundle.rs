use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use futures::future::LocalBoxFuture;
use futures::{FutureExt, StreamExt};
use lazylink_runtime::{
    BinaryFetcher, BundleManifest, HostCapabilities, IntakeSender, Payload, ScriptEvent,
    ScriptHost, ScriptRequest,
};
use tokio::io::AsyncReadExt;

use crate::descriptor::ChunkDescriptor;
use crate::surface::HostSurface;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DEFAULT_PIECE_SIZE: usize = 64 * 1024;

/// A bundle laid out on disk: `manifest.json`, chunk descriptors named like chunk scripts, and
/// binary payloads named by hash.
#[derive(Debug, Clone)]
pub struct BundleDir {
    root: PathBuf,
    public_path: String,
    manifest: BundleManifest,
    surface: Rc<HostSurface>,
    capabilities: HostCapabilities,
    piece_size: usize,
}

impl BundleDir {
    pub fn open(root: &Path) -> Result<Self> {
        let manifest = BundleManifest::load(&root.join(MANIFEST_FILE))?;
        Ok(Self {
            root: root.to_path_buf(),
            public_path: String::new(),
            manifest,
            surface: Rc::new(HostSurface::new()),
            capabilities: HostCapabilities::default(),
            piece_size: DEFAULT_PIECE_SIZE,
        })
    }

    /// URL prefix this bundle is served under; must match the runtime's `public_path`.
    pub fn with_public_path(mut self, public_path: &str) -> Self {
        self.public_path = public_path.to_owned();
        self
    }

    pub fn with_surface(mut self, surface: Rc<HostSurface>) -> Self {
        self.surface = surface;
        self
    }

    pub fn with_capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_piece_size(mut self, piece_size: usize) -> Self {
        self.piece_size = piece_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    pub fn surface(&self) -> &Rc<HostSurface> {
        &self.surface
    }

    /// Maps a resource URL onto a file under the bundle root.
    pub fn resolve(&self, src: &str) -> Result<PathBuf> {
        let name = src
            .strip_prefix(self.public_path.as_str())
            .with_context(|| format!("{src:?} is outside public path {:?}", self.public_path))?;
        let rel = Path::new(name);
        if name.is_empty()
            || rel.is_absolute()
            || rel
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            anyhow::bail!("resource name {name:?} does not name a file in the bundle");
        }
        Ok(self.root.join(rel))
    }
}

async fn run_descriptor(
    path: Result<PathBuf>,
    surface: Rc<HostSurface>,
    intake: IntakeSender,
) -> Result<()> {
    let path = path?;
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("read chunk descriptor: {}", path.display()))?;
    let delivery = ChunkDescriptor::from_json(&bytes)
        .and_then(|descriptor| descriptor.into_delivery(&surface))
        .with_context(|| format!("load chunk descriptor: {}", path.display()))?;
    tracing::debug!(path = %path.display(), units = delivery.units.len(), "chunk descriptor loaded");
    intake.deliver(delivery);
    Ok(())
}

impl ScriptHost for BundleDir {
    fn inject_script(
        &self,
        request: ScriptRequest,
        intake: IntakeSender,
    ) -> LocalBoxFuture<'static, ScriptEvent> {
        let path = self.resolve(&request.src);
        let surface = Rc::clone(&self.surface);
        async move {
            match run_descriptor(path, surface, intake).await {
                Ok(()) => ScriptEvent::Load,
                Err(err) => ScriptEvent::Error(format!("{err:#}")),
            }
        }
        .boxed_local()
    }
}

impl BinaryFetcher for BundleDir {
    fn capabilities(&self) -> HostCapabilities {
        self.capabilities
    }

    fn fetch(&self, src: &str) -> LocalBoxFuture<'static, Result<Payload>> {
        let path = self.resolve(src);
        let streaming = self.capabilities.streaming_compile || self.capabilities.streaming_instantiate;
        let piece_size = self.piece_size;
        async move {
            let path = path?;
            if !streaming {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("read binary module: {}", path.display()))?;
                return Ok(Payload::Buffered(bytes));
            }
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("open binary module: {}", path.display()))?;
            let pieces = futures::stream::unfold(Some(file), move |file| async move {
                let mut file = file?;
                let mut buf = vec![0u8; piece_size];
                match file.read(&mut buf).await {
                    Ok(0) => None,
                    Ok(n) => {
                        buf.truncate(n);
                        Some((Ok(buf), Some(file)))
                    }
                    Err(err) => Some((Err(anyhow::Error::new(err).context("read binary module")), None)),
                }
            });
            Ok(Payload::Stream(pieces.boxed_local()))
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(dir: &Path) -> BundleDir {
        std::fs::write(dir.join(MANIFEST_FILE), br#"{ "preloaded_chunks": ["main"] }"#).unwrap();
        BundleDir::open(dir).unwrap()
    }

    #[test]
    fn resolve_stays_inside_the_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let b = bundle(dir.path()).with_public_path("/static/");
        assert_eq!(
            b.resolve("/static/0.bootstrap.js").unwrap(),
            dir.path().join("0.bootstrap.js")
        );
        assert!(b.resolve("/elsewhere/0.bootstrap.js").is_err());
        assert!(b.resolve("/static/../secret").is_err());
        assert!(b.resolve("/static/").is_err());
    }

    #[test]
    fn missing_manifest_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = BundleDir::open(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains(MANIFEST_FILE), "err={err:#}");
    }

    #[tokio::test]
    async fn payloads_stream_in_pieces() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc.module.wasm"), b"0123456789").unwrap();
        let b = bundle(dir.path()).with_piece_size(4);

        let Payload::Stream(stream) = b.fetch("abc.module.wasm").await.unwrap() else {
            panic!("expected a stream");
        };
        let pieces: Vec<Vec<u8>> = stream.map(|p| p.unwrap()).collect().await;
        assert_eq!(pieces, vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]);

        let buffered = b.with_capabilities(HostCapabilities::BUFFERED_ONLY);
        let payload = buffered.fetch("abc.module.wasm").await.unwrap();
        assert!(matches!(payload, Payload::Buffered(ref bytes) if bytes == b"0123456789"));
        assert!(buffered.fetch("nope.module.wasm").await.is_err());
    }

    #[tokio::test]
    async fn broken_descriptor_reports_an_error_event() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("1.bootstrap.js"), b"not json").unwrap();
        let b = bundle(dir.path());
        let (intake, _rx) = test_intake();
        let request = ScriptRequest {
            chunk_id: "1".to_string(),
            src: "1.bootstrap.js".to_string(),
            charset: "utf-8".to_string(),
            timeout: std::time::Duration::from_secs(1),
            nonce: None,
        };
        let event = b.inject_script(request, intake).await;
        assert!(matches!(event, ScriptEvent::Error(ref detail) if detail.contains("1.bootstrap.js")));
    }

    fn test_intake() -> (IntakeSender, lazylink_runtime::Runtime) {
        let runtime = lazylink_runtime::Runtime::new(
            Default::default(),
            BundleManifest::default(),
            Rc::new(lazylink_runtime::ScriptCatalog::new()),
            Rc::new(lazylink_runtime::PayloadCatalog::new()),
        );
        (runtime.intake(), runtime)
    }
}
