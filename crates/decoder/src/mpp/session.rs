//! Safe MPP decoder session wrapper with RAII resource management.
//!
//! `MppSession` owns the MPP context, the reusable input packet and the
//! external DRM buffer group, and implements [`DecoderEngine`] on top of
//! them.
//!
//! The session runs MPP in its simple packet/frame mode:
//! 1. Compressed data is pushed with `decode_put_packet` (non-blocking; a
//!    full input queue is reported as [`SubmitStatus::WouldBlock`]).
//! 2. Frames are pulled with a blocking `decode_get_frame`.
//! 3. The first frame of a new sequence is an *info-change* frame. The
//!    caller commits external buffers, registers the group, then
//!    acknowledges; only then does MPP start writing pictures.
//!
//! ## Picture Lifecycle
//!
//! A decoded frame references one of the committed buffers. While the frame
//! is alive MPP will not reuse that buffer. [`MppPicture`] is an RAII guard
//! that deinitialises the frame on drop, so handing it back through
//! [`DecoderEngine::release_picture`] (or dropping it) releases the buffer
//! exactly once.

use std::ffi::c_void;
use std::os::fd::{FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use rk_common::{
    BufferIdentity, CodingFormat, DecodeError, DecodedPicture, DecoderEngine, ExportDescriptor,
    FrameEvent, FrameFormat, SubmitStatus,
};

use super::ffi::{
    check_mpp_result, cmd, pixel_format_from_mpp, MppApi, MppBufferGroup, MppBufferInfo, MppCtx,
    MppFrame, MppLibrary, MppPacket, MppParam, MODULE_TAG, MPP_BUFFER_EXTERNAL,
    MPP_BUFFER_TYPE_DRM, MPP_CTX_DEC, MPP_OK, MPP_POLL_BLOCK,
};

// ---------------------------------------------------------------------------
// Decoded picture (RAII frame guard)
// ---------------------------------------------------------------------------

/// A decoded picture living in one of the external DRM buffers.
///
/// The underlying `MppFrame` is deinitialised on drop, which returns the
/// buffer to the decoder's free list.
pub struct MppPicture {
    frame: MppFrame,
    identity: BufferIdentity,
    /// Sequence number of this picture in decode-output order.
    sequence: u64,
    lib: Arc<MppLibrary>,
}

impl MppPicture {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl DecodedPicture for MppPicture {
    fn buffer_identity(&self) -> BufferIdentity {
        self.identity
    }
}

impl std::fmt::Debug for MppPicture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MppPicture")
            .field("identity", &self.identity)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl Drop for MppPicture {
    fn drop(&mut self) {
        if self.frame.is_null() {
            return;
        }
        // SAFETY: `frame` came from decode_get_frame and is owned by this
        // guard. mpp_frame_deinit releases the buffer reference and nulls
        // the handle.
        let result = unsafe { (self.lib.mpp_frame_deinit)(&mut self.frame) };
        if result != MPP_OK {
            error!(
                error_code = result,
                sequence = self.sequence,
                "Failed to deinit decoded frame"
            );
        }
    }
}

// SAFETY: MppFrame is a heap object managed by MPP with internal
// reference counting; deinit is legal from any thread. The Arc keeps the
// library mapped.
unsafe impl Send for MppPicture {}

// ---------------------------------------------------------------------------
// Session internals
// ---------------------------------------------------------------------------

/// The reusable input packet and the memory it points into.
struct PacketSlot {
    handle: MppPacket,
    buffer: Box<[u8]>,
}

/// External DRM buffer group supplied to the decoder.
struct ExternalGroup {
    handle: MppBufferGroup,
    committed: usize,
    registered: bool,
}

/// Statistics from an MPP decode session.
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Packets accepted by the decoder.
    pub packets_submitted: u64,
    /// Submissions refused because the input queue was full.
    pub packets_refused: u64,
    /// Pictures handed out by `pull_event`.
    pub pictures_out: u64,
    /// Buffers committed to the external group.
    pub buffers_committed: usize,
}

// ---------------------------------------------------------------------------
// MppSession
// ---------------------------------------------------------------------------

/// A Rockchip MPP decoder session with RAII cleanup.
///
/// # Thread Safety
///
/// The session is `Send + Sync`. `submit_packet` is called from the feeder
/// thread while `pull_event` and the buffer-group calls run on the
/// harvester thread; MPP supports exactly this split. The input packet and
/// the buffer group are each behind their own `Mutex`.
pub struct MppSession {
    lib: Arc<MppLibrary>,
    ctx: MppCtx,
    api: *mut MppApi,
    codec: CodingFormat,
    packet: Mutex<PacketSlot>,
    group: Mutex<ExternalGroup>,
    /// Set when an info-change frame was handed out and not yet acknowledged.
    info_change_pending: AtomicBool,
    /// Set when a picture carried the end-of-stream flag; the next pull
    /// reports `EndOfStream` without touching the decoder.
    eos_pending: AtomicBool,
    packets_submitted: AtomicU64,
    packets_refused: AtomicU64,
    pictures_out: AtomicU64,
}

// SAFETY: ctx and api are owned by this session and only destroyed in
// Drop. MPP allows put_packet and get_frame from different threads; all
// other mutable state is behind Mutexes or atomics.
unsafe impl Send for MppSession {}
unsafe impl Sync for MppSession {}

impl std::fmt::Debug for MppSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let group = self.group.lock();
        f.debug_struct("MppSession")
            .field("codec", &self.codec)
            .field("buffers_committed", &group.committed)
            .field("group_registered", &group.registered)
            .field("pictures_out", &self.pictures_out.load(Ordering::Relaxed))
            .finish()
    }
}

impl MppSession {
    /// Create and initialise a decoder for `codec`.
    ///
    /// `packet_size` is the largest chunk that will be passed to
    /// `submit_packet`.
    ///
    /// # Errors
    /// Returns `DecodeError::UnsupportedCodec` if the SoC cannot decode the
    /// format through the packet interface, or `DecodeError::HwDecoderInit`
    /// if any setup call fails.
    pub fn new(
        lib: Arc<MppLibrary>,
        codec: CodingFormat,
        packet_size: usize,
    ) -> Result<Self, DecodeError> {
        if !codec.is_streamable() || !lib.supports(codec) {
            return Err(DecodeError::UnsupportedCodec(codec));
        }

        let mut ctx: MppCtx = ptr::null_mut();
        let mut api: *mut MppApi = ptr::null_mut();

        // SAFETY: mpp_create writes a fresh context and its function table.
        let result = unsafe { (lib.mpp_create)(&mut ctx, &mut api) };
        check_mpp_result(result, "mpp_create")
            .map_err(|reason| DecodeError::HwDecoderInit { codec, reason })?;
        if api.is_null() {
            return Err(DecodeError::HwDecoderInit {
                codec,
                reason: "mpp_create returned no API table".into(),
            });
        }

        let session = Self {
            lib,
            ctx,
            api,
            codec,
            packet: Mutex::new(PacketSlot {
                handle: ptr::null_mut(),
                buffer: vec![0u8; packet_size].into_boxed_slice(),
            }),
            group: Mutex::new(ExternalGroup {
                handle: ptr::null_mut(),
                committed: 0,
                registered: false,
            }),
            info_change_pending: AtomicBool::new(false),
            eos_pending: AtomicBool::new(false),
            packets_submitted: AtomicU64::new(0),
            packets_refused: AtomicU64::new(0),
            pictures_out: AtomicU64::new(0),
        };

        // From here on Drop tears down whatever was created.
        session
            .configure()
            .map_err(|reason| DecodeError::HwDecoderInit { codec, reason })?;

        info!(
            codec = codec.display_name(),
            packet_size, "MPP decoder session created"
        );
        Ok(session)
    }

    fn configure(&self) -> Result<(), String> {
        // Split mode lets us feed arbitrary chunks of the elementary stream.
        // It must be set before mpp_init.
        let mut split: u32 = 1;
        self.raw_control(
            cmd::MPP_DEC_SET_PARSER_SPLIT_MODE,
            &mut split as *mut u32 as MppParam,
        )
        .map_err(|e| format!("MPP_DEC_SET_PARSER_SPLIT_MODE: {e}"))?;

        // SAFETY: ctx is a fresh context from mpp_create.
        let result = unsafe { (self.lib.mpp_init)(self.ctx, MPP_CTX_DEC, self.codec.id()) };
        check_mpp_result(result, "mpp_init")?;

        // Blocking output: decode_get_frame parks the harvester thread.
        let mut block: i32 = MPP_POLL_BLOCK;
        self.raw_control(cmd::MPP_SET_OUTPUT_BLOCK, &mut block as *mut i32 as MppParam)
            .map_err(|e| format!("MPP_SET_OUTPUT_BLOCK: {e}"))?;

        let mut slot = self.packet.lock();
        let size = slot.buffer.len();
        let data = slot.buffer.as_mut_ptr() as *mut c_void;
        // SAFETY: the buffer is owned by the slot and outlives the packet,
        // which is deinitialised in Drop before the slot is freed.
        let result = unsafe { (self.lib.mpp_packet_init)(&mut slot.handle, data, size) };
        check_mpp_result(result, "mpp_packet_init")
    }

    fn api(&self) -> &MppApi {
        // SAFETY: api is non-null (checked in new) and valid until
        // mpp_destroy, which only runs in Drop.
        unsafe { &*self.api }
    }

    fn raw_control(&self, command: u32, param: MppParam) -> Result<(), String> {
        // SAFETY: ctx is valid for the lifetime of the session; param points
        // to a value of the type the command expects, or is null.
        let result = unsafe { (self.api().control)(self.ctx, command, param) };
        check_mpp_result(result, "control")
    }

    fn control(&self, call: &'static str, command: u32, param: MppParam) -> Result<(), DecodeError> {
        self.raw_control(command, param)
            .map_err(|reason| DecodeError::Control { call, reason })
    }

    /// Get the coding format this session decodes.
    pub fn codec(&self) -> CodingFormat {
        self.codec
    }

    /// Get decode statistics.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            packets_submitted: self.packets_submitted.load(Ordering::Relaxed),
            packets_refused: self.packets_refused.load(Ordering::Relaxed),
            pictures_out: self.pictures_out.load(Ordering::Relaxed),
            buffers_committed: self.group.lock().committed,
        }
    }

    fn read_format(&self, frame: MppFrame) -> FrameFormat {
        // SAFETY: frame is a live frame from decode_get_frame; the getters
        // only read fields.
        unsafe {
            FrameFormat {
                width: (self.lib.mpp_frame_get_width)(frame),
                height: (self.lib.mpp_frame_get_height)(frame),
                hor_stride: (self.lib.mpp_frame_get_hor_stride)(frame),
                ver_stride: (self.lib.mpp_frame_get_ver_stride)(frame),
                pixel_format: pixel_format_from_mpp((self.lib.mpp_frame_get_fmt)(frame)),
            }
        }
    }

    fn deinit_frame(&self, mut frame: MppFrame) {
        // SAFETY: frame is owned by the caller and not used afterwards.
        let result = unsafe { (self.lib.mpp_frame_deinit)(&mut frame) };
        if result != MPP_OK {
            warn!(error_code = result, "Failed to deinit frame");
        }
    }
}

impl DecoderEngine for MppSession {
    type Picture = MppPicture;

    fn submit_packet(&self, data: &[u8], is_eos: bool) -> Result<SubmitStatus, DecodeError> {
        let mut slot = self.packet.lock();
        if data.len() > slot.buffer.len() {
            return Err(DecodeError::DecodeFailed {
                picture: self.pictures_out.load(Ordering::Relaxed),
                reason: format!(
                    "packet of {} bytes exceeds the {} byte input buffer",
                    data.len(),
                    slot.buffer.len()
                ),
            });
        }

        slot.buffer[..data.len()].copy_from_slice(data);
        let pos = slot.buffer.as_mut_ptr() as *mut c_void;
        let handle = slot.handle;

        // SAFETY: handle was initialised over `slot.buffer`; pos and length
        // stay inside it. MPP copies the payload during decode_put_packet.
        let result = unsafe {
            (self.lib.mpp_packet_set_pos)(handle, pos);
            (self.lib.mpp_packet_set_length)(handle, data.len());
            if is_eos {
                (self.lib.mpp_packet_set_eos)(handle);
            }
            (self.api().decode_put_packet)(self.ctx, handle)
        };

        if result == MPP_OK {
            self.packets_submitted.fetch_add(1, Ordering::Relaxed);
            if is_eos {
                debug!("End-of-stream packet accepted");
            }
            Ok(SubmitStatus::Accepted)
        } else {
            // The input queue depth is fixed inside MPP and put_packet has
            // no blocking mode; every refusal is a full queue.
            self.packets_refused.fetch_add(1, Ordering::Relaxed);
            Ok(SubmitStatus::WouldBlock)
        }
    }

    fn pull_event(&self) -> Result<FrameEvent<MppPicture>, DecodeError> {
        loop {
            if self.eos_pending.swap(false, Ordering::AcqRel) {
                return Ok(FrameEvent::EndOfStream);
            }

            let mut frame: MppFrame = ptr::null_mut();
            // SAFETY: ctx is valid; decode_get_frame blocks until a frame is
            // available and transfers ownership of it to us.
            let result = unsafe { (self.api().decode_get_frame)(self.ctx, &mut frame) };
            check_mpp_result(result, "decode_get_frame").map_err(|reason| {
                DecodeError::DecodeFailed {
                    picture: self.pictures_out.load(Ordering::Relaxed),
                    reason,
                }
            })?;
            if frame.is_null() {
                return Err(DecodeError::DecodeFailed {
                    picture: self.pictures_out.load(Ordering::Relaxed),
                    reason: "blocking decode_get_frame returned no frame".into(),
                });
            }

            // SAFETY: frame is live until deinit below or until the picture
            // guard drops it.
            let (info_change, eos, buffer) = unsafe {
                (
                    (self.lib.mpp_frame_get_info_change)(frame) != 0,
                    (self.lib.mpp_frame_get_eos)(frame) != 0,
                    (self.lib.mpp_frame_get_buffer)(frame),
                )
            };

            if info_change {
                let format = self.read_format(frame);
                self.deinit_frame(frame);
                self.info_change_pending.store(true, Ordering::Release);
                if eos {
                    self.eos_pending.store(true, Ordering::Release);
                }
                info!(
                    width = format.width,
                    height = format.height,
                    hor_stride = format.hor_stride,
                    ver_stride = format.ver_stride,
                    format = ?format.pixel_format,
                    "MPP info change"
                );
                return Ok(FrameEvent::ResolutionChanged(format));
            }

            if buffer.is_null() {
                self.deinit_frame(frame);
                if eos {
                    debug!("End-of-stream frame without picture");
                    return Ok(FrameEvent::EndOfStream);
                }
                debug!("Frame without buffer skipped");
                continue;
            }

            let mut info = MppBufferInfo::default();
            // SAFETY: buffer belongs to the live frame; info is a valid out
            // struct.
            let result = unsafe {
                (self.lib.mpp_buffer_info_get_with_caller)(
                    buffer,
                    &mut info,
                    MODULE_TAG.as_ptr().cast(),
                )
            };
            if let Err(reason) = check_mpp_result(result, "mpp_buffer_info_get") {
                self.deinit_frame(frame);
                return Err(DecodeError::DecodeFailed {
                    picture: self.pictures_out.load(Ordering::Relaxed),
                    reason,
                });
            }

            if eos {
                self.eos_pending.store(true, Ordering::Release);
            }
            let sequence = self.pictures_out.fetch_add(1, Ordering::Relaxed);
            debug!(fd = info.fd, sequence, "Picture ready");

            return Ok(FrameEvent::PictureReady(MppPicture {
                frame,
                identity: BufferIdentity(info.fd),
                sequence,
                lib: self.lib.clone(),
            }));
        }
    }

    fn commit_external_buffer(
        &self,
        descriptor: ExportDescriptor,
        size: u64,
    ) -> Result<BufferIdentity, DecodeError> {
        let mut group = self.group.lock();
        if group.registered {
            return Err(DecodeError::BufferCommit(
                "buffer group already registered with the decoder".into(),
            ));
        }

        if group.handle.is_null() {
            // SAFETY: writes a new external DRM group handle.
            let result = unsafe {
                (self.lib.mpp_buffer_group_get)(
                    &mut group.handle,
                    MPP_BUFFER_TYPE_DRM,
                    MPP_BUFFER_EXTERNAL,
                    MODULE_TAG.as_ptr().cast(),
                    MODULE_TAG.as_ptr().cast(),
                )
            };
            if let Err(reason) = check_mpp_result(result, "mpp_buffer_group_get") {
                close_descriptor(descriptor.0);
                return Err(DecodeError::BufferCommit(reason));
            }
        }

        let exported_fd = descriptor.0;
        let mut info = MppBufferInfo {
            buffer_type: MPP_BUFFER_TYPE_DRM,
            size: size as usize,
            fd: exported_fd,
            ..MppBufferInfo::default()
        };

        // SAFETY: group is a valid external group; info describes a dma-buf
        // we own. A null buffer out-pointer means "commit only".
        let result = unsafe {
            (self.lib.mpp_buffer_import_with_tag)(
                group.handle,
                &mut info,
                ptr::null_mut(),
                MODULE_TAG.as_ptr().cast(),
                MODULE_TAG.as_ptr().cast(),
            )
        };
        if let Err(reason) = check_mpp_result(result, "mpp_buffer_commit") {
            close_descriptor(exported_fd);
            return Err(DecodeError::BufferCommit(reason));
        }

        // MPP may keep a duplicate; the duplicate is what frames report.
        if info.fd != exported_fd {
            close_descriptor(exported_fd);
        }
        group.committed += 1;

        debug!(
            exported_fd,
            identity = info.fd,
            size,
            committed = group.committed,
            "Committed external buffer"
        );
        Ok(BufferIdentity(info.fd))
    }

    fn register_external_buffer_group(&self) -> Result<(), DecodeError> {
        let mut group = self.group.lock();
        if group.handle.is_null() {
            return Err(DecodeError::Control {
                call: "MPP_DEC_SET_EXT_BUF_GROUP",
                reason: "no buffers committed".into(),
            });
        }
        self.control(
            "MPP_DEC_SET_EXT_BUF_GROUP",
            cmd::MPP_DEC_SET_EXT_BUF_GROUP,
            group.handle,
        )?;
        group.registered = true;
        info!(buffers = group.committed, "External buffer group registered");
        Ok(())
    }

    fn acknowledge_resolution_ready(&self) -> Result<(), DecodeError> {
        if !self.info_change_pending.swap(false, Ordering::AcqRel) {
            return Err(DecodeError::NoPendingResolution);
        }
        self.control(
            "MPP_DEC_SET_INFO_CHANGE_READY",
            cmd::MPP_DEC_SET_INFO_CHANGE_READY,
            ptr::null_mut(),
        )
    }

    fn release_picture(&self, picture: MppPicture) {
        debug!(
            sequence = picture.sequence,
            fd = picture.identity.0,
            "Releasing picture"
        );
        drop(picture);
    }

    fn reset(&self) -> Result<(), DecodeError> {
        // SAFETY: ctx is valid; reset flushes queued packets and frames.
        let result = unsafe { (self.api().reset)(self.ctx) };
        check_mpp_result(result, "reset").map_err(|reason| DecodeError::Control {
            call: "reset",
            reason,
        })?;
        self.eos_pending.store(false, Ordering::Release);
        self.info_change_pending.store(false, Ordering::Release);
        info!("MPP session reset");
        Ok(())
    }
}

/// Close a descriptor we still own.
fn close_descriptor(fd: i32) {
    if fd < 0 {
        return;
    }
    // SAFETY: the caller owns `fd` and does not use it afterwards; OwnedFd
    // closes it on drop.
    drop(unsafe { OwnedFd::from_raw_fd(fd) });
}

impl Drop for MppSession {
    fn drop(&mut self) {
        // Release the external group first: MPP drops its references to the
        // committed dma-bufs, then the context can go.
        let group = self.group.get_mut();
        if !group.handle.is_null() {
            debug!(buffers = group.committed, "Releasing external buffer group");
            // SAFETY: handle came from mpp_buffer_group_get.
            let result = unsafe { (self.lib.mpp_buffer_group_put)(group.handle) };
            if result != MPP_OK {
                error!(error_code = result, "Failed to release buffer group");
            }
            group.handle = ptr::null_mut();
        }

        let slot = self.packet.get_mut();
        if !slot.handle.is_null() {
            // SAFETY: handle came from mpp_packet_init.
            unsafe { (self.lib.mpp_packet_deinit)(&mut slot.handle) };
            slot.handle = ptr::null_mut();
        }

        if !self.ctx.is_null() {
            // SAFETY: ctx came from mpp_create; no frames or packets remain.
            let result = unsafe { (self.lib.mpp_destroy)(self.ctx) };
            if result != MPP_OK {
                error!(error_code = result, "Failed to destroy MPP context");
            }
            self.ctx = ptr::null_mut();
        }

        info!(
            codec = self.codec.display_name(),
            packets = self.packets_submitted.load(Ordering::Relaxed),
            pictures = self.pictures_out.load(Ordering::Relaxed),
            "MPP session destroyed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_stats_default() {
        let stats = SessionStats::default();
        assert_eq!(stats.packets_submitted, 0);
        assert_eq!(stats.pictures_out, 0);
        assert_eq!(stats.buffers_committed, 0);
    }

    #[test]
    fn close_descriptor_ignores_negative() {
        // Must not attempt to close an invalid descriptor.
        close_descriptor(-1);
    }

    #[test]
    #[ignore = "requires librockchip_mpp and a Rockchip VPU"]
    fn session_opens_h264() {
        let lib = Arc::new(MppLibrary::load().expect("MPP runtime"));
        let session = MppSession::new(lib, CodingFormat::H264, 1 << 20).expect("session");
        assert_eq!(session.codec(), CodingFormat::H264);
        assert_eq!(session.stats().buffers_committed, 0);
    }

    #[test]
    #[ignore = "requires librockchip_mpp"]
    fn mjpeg_is_rejected() {
        let lib = Arc::new(MppLibrary::load().expect("MPP runtime"));
        let err = MppSession::new(lib, CodingFormat::Mjpeg, 1 << 20).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedCodec(CodingFormat::Mjpeg)));
    }
}
