//! Pipeline error types.

use thiserror::Error;

use rk_common::{BufferIdentity, DecodeError, DisplayError, PixelFormat};

use crate::state::PipelineState;

/// Buffer pool errors.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("A buffer pool of {capacity} entries is already active; only one resolution change per run is supported")]
    PoolAlreadyActive { capacity: usize },

    #[error("Decoder output format {0:?} cannot be shared with the display (NV12 only)")]
    UnsupportedFormat(PixelFormat),

    #[error("Decoded picture references buffer {0:?}, which is not in the pool")]
    UnknownBuffer(BufferIdentity),

    #[error("Invalid pool capacity: {0}")]
    InvalidCapacity(usize),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Display(#[from] DisplayError),
}

/// Errors that stop the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Buffer pool: {0}")]
    Pool(#[from] PoolError),

    #[error("Decoder: {0}")]
    Decode(#[from] DecodeError),

    #[error("Display: {0}")]
    Display(#[from] DisplayError),

    #[error("Illegal state transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("Picture ready before any resolution change")]
    GeometryMissing,

    #[error("Failed to spawn {name} worker: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },

    #[error("{0} worker panicked")]
    WorkerPanicked(&'static str),

    #[error("Stream read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pipeline halted after a fatal error in another worker")]
    Halted,
}
