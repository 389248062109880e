//! Capability traits for the two hardware collaborators.
//!
//! The pipeline core only talks to the decoder and the display through
//! these traits. Concrete backends live in `rk-decoder` (Rockchip MPP and a
//! simulated engine) and `rk-display` (DRM/KMS and a simulated provider).
//!
//! Both traits take `&self`: the feeder thread submits packets while the
//! harvester thread pulls events from the same engine, and the harvester
//! and presenter share the display provider.

use crate::error::{DecodeError, DisplayError};
use crate::types::{
    BufferAllocation, BufferIdentity, ExportDescriptor, FrameFormat, OutputRect, PixelFormat,
    PlaneLayout, Resolution, SurfaceId,
};

// ---------------------------------------------------------------------------
// Decoder side
// ---------------------------------------------------------------------------

/// Result of a non-blocking packet submission.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubmitStatus {
    /// The packet was accepted.
    Accepted,
    /// The decoder input queue is full; retry the same packet later.
    WouldBlock,
}

/// A decoded picture still owned by the decoder.
///
/// The handle must be given back through [`DecoderEngine::release_picture`]
/// once the harvester has resolved its buffer.
pub trait DecodedPicture: Send {
    /// Identity of the external output buffer holding the picture.
    fn buffer_identity(&self) -> BufferIdentity;
}

/// One event pulled from the decoder.
#[derive(Debug)]
pub enum FrameEvent<P> {
    /// Output geometry changed; external buffers must be (re)supplied
    /// before the decoder produces further pictures.
    ResolutionChanged(FrameFormat),
    /// A picture is ready in one of the committed buffers.
    PictureReady(P),
    /// The decoder has drained; no further events follow.
    EndOfStream,
}

/// Hardware video decoder consumed through a packet-push / event-pull
/// protocol.
pub trait DecoderEngine: Send + Sync {
    type Picture: DecodedPicture;

    /// Submit compressed bytes. `is_eos` marks the final (possibly empty)
    /// packet. Never blocks.
    fn submit_packet(&self, data: &[u8], is_eos: bool) -> Result<SubmitStatus, DecodeError>;

    /// Block until the next event is available.
    fn pull_event(&self) -> Result<FrameEvent<Self::Picture>, DecodeError>;

    /// Add one exported buffer to the decoder-owned external buffer group.
    ///
    /// Consumes the descriptor and returns the identity the decoder will
    /// report in [`DecodedPicture::buffer_identity`] for this buffer.
    fn commit_external_buffer(
        &self,
        descriptor: ExportDescriptor,
        size: u64,
    ) -> Result<BufferIdentity, DecodeError>;

    /// Hand the populated external buffer group to the decoder.
    fn register_external_buffer_group(&self) -> Result<(), DecodeError>;

    /// Tell the decoder the resolution-change handshake is complete.
    /// Must follow [`register_external_buffer_group`](Self::register_external_buffer_group).
    fn acknowledge_resolution_ready(&self) -> Result<(), DecodeError>;

    /// Return a decoded picture handle to the decoder.
    fn release_picture(&self, picture: Self::Picture);

    /// Drop all queued input and pending output.
    fn reset(&self) -> Result<(), DecodeError>;
}

// ---------------------------------------------------------------------------
// Display side
// ---------------------------------------------------------------------------

/// Source crop within a surface, in picture pixels.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SourceRect {
    pub width: u32,
    pub height: u32,
}

impl From<Resolution> for SourceRect {
    fn from(res: Resolution) -> Self {
        Self {
            width: res.width,
            height: res.height,
        }
    }
}

/// Hardware display driver able to allocate scan-out capable buffers and
/// show them on an overlay plane.
pub trait DisplaySurfaceProvider: Send + Sync {
    /// Size of the selected CRTC mode.
    fn display_size(&self) -> Resolution;

    /// Allocate a linear buffer of `width_bytes × height_rows` bytes.
    fn create_buffer(
        &self,
        width_bytes: u32,
        height_rows: u32,
    ) -> Result<BufferAllocation, DisplayError>;

    /// Export an allocation as an importable descriptor.
    fn export(&self, allocation: &BufferAllocation) -> Result<ExportDescriptor, DisplayError>;

    /// Build a display surface over an allocation.
    fn import_as_surface(
        &self,
        allocation: &BufferAllocation,
        size: Resolution,
        pixel_format: PixelFormat,
        planes: &[PlaneLayout],
    ) -> Result<SurfaceId, DisplayError>;

    /// Show `surface` on the overlay plane. Paced by the display refresh.
    fn update_plane(
        &self,
        surface: SurfaceId,
        src: SourceRect,
        dst: OutputRect,
    ) -> Result<(), DisplayError>;

    fn destroy_surface(&self, surface: SurfaceId) -> Result<(), DisplayError>;

    fn destroy_buffer(&self, allocation: BufferAllocation) -> Result<(), DisplayError>;
}
