//! Lazy chunk loading and binary module linking for a single-threaded host.
//!
//! A [`Runtime`] owns the module registry. Code units arrive in chunks posted on the intake;
//! binary modules are fetched, compiled and wired to host-interface units by the linker.

pub mod catalog;
pub mod chunk;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod intake;
pub mod linker;
pub mod manifest;
pub mod registry;
pub mod runtime;
pub mod value;
pub mod wasm;

pub use catalog::{PayloadCatalog, ScriptBehavior, ScriptCatalog};
pub use chunk::{ChunkStatus, PendingLoad};
pub use config::RuntimeConfig;
pub use dispatch::ModuleContext;
pub use error::{LoadError, LoadErrorKind};
pub use host::{BinaryFetcher, HostCapabilities, Payload, PayloadStream, ScriptEvent, ScriptHost, ScriptRequest};
pub use intake::{ChunkDelivery, IntakeSender};
pub use linker::{LinkStatus, LinkStrategy, PendingLink};
pub use manifest::BundleManifest;
pub use registry::{loader, LoaderBody, ModuleRegistry, WeakRegistry};
pub use runtime::Runtime;
pub use value::{Exports, GuestMemory, HostCall, HostFn, Value};
pub use wasm::{ExportTable, ImportBinding, ImportTable, WasmEngine};
