//! DRM/KMS overlay display.
//!
//! # Module Structure
//!
//! - [`ffi`]: Raw libdrm bindings (loaded via `libloading`).
//! - [`output`]: Connector / CRTC / overlay plane discovery.
//! - [`device`]: `DrmDevice`, the [`DisplaySurfaceProvider`](rk_common::DisplaySurfaceProvider)
//!   implementation over dumb buffers.

pub mod device;
pub mod ffi;
pub mod output;

pub use device::DrmDevice;
pub use ffi::{DrmLibrary, DrmLoadError};
pub use output::OutputSelection;
