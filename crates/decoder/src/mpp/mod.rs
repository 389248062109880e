//! Rockchip MPP hardware video decoder module.
//!
//! Decodes through the VPU using librockchip_mpp, loaded at runtime with
//! `libloading`. Decoded pictures are written straight into DRM dumb
//! buffers supplied by the display, so no copies happen on the way to
//! scan-out.
//!
//! # Module Structure
//!
//! - [`ffi`]: Raw FFI bindings for librockchip_mpp.
//! - [`session`]: `MppSession`, the [`DecoderEngine`](rk_common::DecoderEngine)
//!   implementation, and the RAII picture guard.
//!
//! # Usage
//!
//! ```ignore
//! use rk_decoder::mpp::{MppLibrary, MppSession};
//! use rk_common::CodingFormat;
//! use std::sync::Arc;
//!
//! let lib = Arc::new(MppLibrary::load()?);
//! let session = MppSession::new(lib, CodingFormat::H264, 1 << 20)?;
//! // Hand the session to the pipeline.
//! ```

pub mod ffi;
pub mod session;

pub use ffi::{MppLibrary, MppLoadError};
pub use session::{MppPicture, MppSession, SessionStats};
