//! `rk-common`: Shared types, traits, and errors for the rkplay workspace.
//!
//! This crate is the foundation the decoder, display and pipeline crates
//! depend on:
//!
//! - **Types**: `Resolution`, `FrameFormat`, `OutputRect`, `SurfaceId`,
//!   `BufferIdentity` (newtypes for the handles crossing subsystem borders)
//! - **Traits**: `DecoderEngine`, `DisplaySurfaceProvider` (hardware abstraction)
//! - **Codec**: `CodingFormat` (decoder coding ids)
//! - **Errors**: `DecodeError`, `DisplayError` (thiserror-based)
//! - **Config**: `PlayerConfig`

pub mod codec;
pub mod config;
pub mod error;
pub mod hw_traits;
pub mod types;

pub use codec::{CodingFormat, UnknownCodingFormat};
pub use config::{ConfigError, PlayerConfig};
pub use error::{DecodeError, DisplayError};
pub use hw_traits::{
    DecodedPicture, DecoderEngine, DisplaySurfaceProvider, FrameEvent, SourceRect, SubmitStatus,
};
pub use types::{
    BufferAllocation, BufferIdentity, ExportDescriptor, Fit, FrameFormat, OutputRect, PixelFormat,
    PlaneLayout, Resolution, SurfaceId,
};
