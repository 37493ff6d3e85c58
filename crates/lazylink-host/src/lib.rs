//! Hosts for the lazylink runtime: a bundle directory on disk and a headless browser surface for
//! the binary modules it links.

pub mod bundle;
pub mod descriptor;
pub mod surface;

pub use bundle::{BundleDir, DEFAULT_PIECE_SIZE, MANIFEST_FILE};
pub use descriptor::{ChunkDescriptor, UnitDescriptor, UnitKind};
pub use surface::{Callback, DrawOp, Element, HostObject, HostSurface, PointerEvent, Rect, CONSOLE_TARGET};
