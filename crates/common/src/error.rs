//! Error types for the decoder and display collaborators (thiserror-based).

use thiserror::Error;

use crate::codec::CodingFormat;
use crate::types::PixelFormat;

/// Hardware decoder errors.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("HW decoder init failed for {codec}: {reason}")]
    HwDecoderInit { codec: CodingFormat, reason: String },

    #[error("Unsupported coding format for HW decode: {0}")]
    UnsupportedCodec(CodingFormat),

    #[error("Decoder control call {call} failed: {reason}")]
    Control { call: &'static str, reason: String },

    #[error("Decode failed at picture {picture}: {reason}")]
    DecodeFailed { picture: u64, reason: String },

    #[error("External buffer commit failed: {0}")]
    BufferCommit(String),

    #[error("Decoder has no pending resolution change to acknowledge")]
    NoPendingResolution,

    #[error("Decoder session expired or invalid")]
    InvalidSession,
}

/// Display driver errors.
#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("Display device open failed: {0}")]
    DeviceOpen(String),

    #[error("No usable display output: {0}")]
    NoOutput(String),

    #[error("Buffer allocation of {width}x{height} failed: {reason}")]
    AllocFailed {
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("Buffer export failed for handle {handle}: {reason}")]
    ExportFailed { handle: u32, reason: String },

    #[error("Surface import failed: {0}")]
    ImportFailed(String),

    #[error("Pixel format {0:?} cannot be imported as a display surface")]
    UnsupportedFormat(PixelFormat),

    #[error("Plane update failed: {0}")]
    PlaneUpdate(String),

    #[error("Destroy failed: {0}")]
    DestroyFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
