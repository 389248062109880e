//! `rk-display`: Display surface providers for the rkplay pipeline.
//!
//! - [`drm`]: KMS overlay plane on a DRM device node, using dumb buffers
//!   shared with the decoder as dma-bufs.
//! - [`sim`]: Recording provider for tests and `rkplay --dry-run`.

pub mod drm;
pub mod sim;

pub use drm::{DrmDevice, DrmLibrary, DrmLoadError};
pub use sim::{DisplayCall, SimDisplay, SimDisplayConfig};
