//! Raw FFI bindings for Rockchip's Media Process Platform (librockchip_mpp).
//!
//! These bindings are loaded dynamically at runtime via `libloading`.
//! They cover the minimum API surface needed for packet-in / frame-out
//! decoding into externally supplied DRM buffers.
//!
//! Reference: Rockchip MPP headers `rk_mpi.h`, `rk_mpi_cmd.h`, `mpp_frame.h`,
//! `mpp_packet.h`, `mpp_buffer.h`.

use std::ffi::{c_char, c_void};
use std::path::Path;

use libloading::Library;
use tracing::{debug, info};

use rk_common::{CodingFormat, PixelFormat};

// ---------------------------------------------------------------------------
// Opaque handles
// ---------------------------------------------------------------------------

/// MPP context handle.
pub type MppCtx = *mut c_void;

/// Compressed packet handle.
pub type MppPacket = *mut c_void;

/// Decoded frame handle.
pub type MppFrame = *mut c_void;

/// Buffer handle (one decoder output buffer).
pub type MppBuffer = *mut c_void;

/// Buffer group handle.
pub type MppBufferGroup = *mut c_void;

/// Untyped control parameter.
pub type MppParam = *mut c_void;

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// MPP return type: 0 means success, negative values are errors.
pub type MppRet = i32;

pub const MPP_OK: MppRet = 0;
pub const MPP_NOK: MppRet = -1;
pub const MPP_ERR_NULL_PTR: MppRet = -3;
pub const MPP_ERR_MALLOC: MppRet = -4;
pub const MPP_ERR_INIT: MppRet = -1002;
pub const MPP_ERR_VALUE: MppRet = -6;
pub const MPP_ERR_READ_BIT: MppRet = -7;
pub const MPP_ERR_TIMEOUT: MppRet = -8;
pub const MPP_ERR_BUFFER_FULL: MppRet = -1008;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Context type (`MppCtxType`).
pub const MPP_CTX_DEC: i32 = 0;

/// `MppPollType`: block until data is available.
pub const MPP_POLL_BLOCK: i32 = -1;

/// `MppBufferType`.
pub const MPP_BUFFER_TYPE_DRM: i32 = 3;

/// `MppBufferMode`: buffers are supplied by the caller.
pub const MPP_BUFFER_EXTERNAL: i32 = 1;

/// `MppFrameFormat` codes we recognise.
pub mod frame_format {
    pub const MPP_FMT_YUV420SP: i32 = 0;
    pub const MPP_FMT_YUV420SP_10BIT: i32 = 1;
    pub const MPP_FMT_YUV422SP: i32 = 2;
    pub const MPP_FMT_YUV420P: i32 = 4;
    /// Mask for the layout part of the format (upper bits carry AFBC/HDR flags).
    pub const MPP_FRAME_FMT_MASK: i32 = 0x000f_ffff;
}

/// Map an `MppFrameFormat` code to the shared pixel format.
///
/// Codes with flag bits set (AFBC compression, HDR) are never linear
/// layouts and map to [`PixelFormat::Other`].
pub fn pixel_format_from_mpp(code: i32) -> PixelFormat {
    if code & !frame_format::MPP_FRAME_FMT_MASK != 0 {
        return PixelFormat::Other(code);
    }
    match code {
        frame_format::MPP_FMT_YUV420SP => PixelFormat::Nv12,
        frame_format::MPP_FMT_YUV420SP_10BIT => PixelFormat::Nv15,
        frame_format::MPP_FMT_YUV422SP => PixelFormat::Nv16,
        frame_format::MPP_FMT_YUV420P => PixelFormat::I420,
        _ => PixelFormat::Other(code),
    }
}

/// `MpiCmd` control codes (see `rk_mpi_cmd.h`).
pub mod cmd {
    const CMD_MODULE_MPP: u32 = 0x0020_0000;
    const CMD_MODULE_CODEC: u32 = 0x0030_0000;
    const CMD_CTX_ID_DEC: u32 = 0x0001_0000;

    const MPP_CMD_BASE: u32 = CMD_MODULE_MPP;
    /// Output port blocking mode (`MppPollType` parameter).
    pub const MPP_SET_OUTPUT_BLOCK: u32 = MPP_CMD_BASE + 4;

    const MPP_DEC_CMD_BASE: u32 = CMD_MODULE_CODEC | CMD_CTX_ID_DEC;
    /// Hand an external buffer group to the decoder.
    pub const MPP_DEC_SET_EXT_BUF_GROUP: u32 = MPP_DEC_CMD_BASE + 2;
    /// Acknowledge an info-change frame.
    pub const MPP_DEC_SET_INFO_CHANGE_READY: u32 = MPP_DEC_CMD_BASE + 3;
    /// Split arbitrary input into whole frames. Must be set before init.
    pub const MPP_DEC_SET_PARSER_SPLIT_MODE: u32 = MPP_DEC_CMD_BASE + 5;
}

// ---------------------------------------------------------------------------
// MppBufferInfo
// ---------------------------------------------------------------------------

/// Buffer description used for import and info queries. Matches
/// `MppBufferInfo` from `mpp_buffer.h`.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct MppBufferInfo {
    pub buffer_type: i32,
    pub size: usize,
    pub ptr: *mut c_void,
    pub hnd: *mut c_void,
    pub fd: i32,
    pub index: i32,
}

impl Default for MppBufferInfo {
    fn default() -> Self {
        // SAFETY: All-zeros is a valid default for this POD struct.
        unsafe { std::mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// MppApi: function table returned by mpp_create
// ---------------------------------------------------------------------------

/// Function table returned by `mpp_create`. Matches `MppApi` from `rk_mpi.h`.
///
/// Only the decode entry points are typed; the encoder / ISP / task slots
/// are kept as raw pointers so the layout stays correct.
#[repr(C)]
pub struct MppApi {
    pub size: u32,
    pub version: u32,

    pub decode: *const c_void,
    pub decode_put_packet: unsafe extern "C" fn(ctx: MppCtx, packet: MppPacket) -> MppRet,
    pub decode_get_frame: unsafe extern "C" fn(ctx: MppCtx, frame: *mut MppFrame) -> MppRet,

    pub encode: *const c_void,
    pub encode_put_frame: *const c_void,
    pub encode_get_packet: *const c_void,

    pub isp: *const c_void,
    pub isp_put_frame: *const c_void,
    pub isp_get_frame: *const c_void,

    pub poll: *const c_void,
    pub dequeue: *const c_void,
    pub enqueue: *const c_void,

    pub reset: unsafe extern "C" fn(ctx: MppCtx) -> MppRet,
    pub control: unsafe extern "C" fn(ctx: MppCtx, cmd: u32, param: MppParam) -> MppRet,

    pub reserved: [u32; 16],
}

// ---------------------------------------------------------------------------
// Dynamic library wrapper
// ---------------------------------------------------------------------------

pub struct MppLibrary {
    _lib: Library,

    // -- Context --
    pub mpp_create: unsafe extern "C" fn(ctx: *mut MppCtx, mpi: *mut *mut MppApi) -> MppRet,
    pub mpp_init: unsafe extern "C" fn(ctx: MppCtx, ctx_type: i32, coding: i32) -> MppRet,
    pub mpp_destroy: unsafe extern "C" fn(ctx: MppCtx) -> MppRet,
    pub mpp_check_support_format: unsafe extern "C" fn(ctx_type: i32, coding: i32) -> MppRet,
    pub mpp_show_support_format: unsafe extern "C" fn(),

    // -- Packets --
    pub mpp_packet_init:
        unsafe extern "C" fn(packet: *mut MppPacket, data: *mut c_void, size: usize) -> MppRet,
    pub mpp_packet_deinit: unsafe extern "C" fn(packet: *mut MppPacket) -> MppRet,
    pub mpp_packet_set_pos: unsafe extern "C" fn(packet: MppPacket, pos: *mut c_void),
    pub mpp_packet_set_length: unsafe extern "C" fn(packet: MppPacket, length: usize),
    pub mpp_packet_set_eos: unsafe extern "C" fn(packet: MppPacket) -> MppRet,

    // -- Frames --
    pub mpp_frame_get_info_change: unsafe extern "C" fn(frame: MppFrame) -> u32,
    pub mpp_frame_get_width: unsafe extern "C" fn(frame: MppFrame) -> u32,
    pub mpp_frame_get_height: unsafe extern "C" fn(frame: MppFrame) -> u32,
    pub mpp_frame_get_hor_stride: unsafe extern "C" fn(frame: MppFrame) -> u32,
    pub mpp_frame_get_ver_stride: unsafe extern "C" fn(frame: MppFrame) -> u32,
    pub mpp_frame_get_fmt: unsafe extern "C" fn(frame: MppFrame) -> i32,
    pub mpp_frame_get_eos: unsafe extern "C" fn(frame: MppFrame) -> u32,
    pub mpp_frame_get_buffer: unsafe extern "C" fn(frame: MppFrame) -> MppBuffer,
    pub mpp_frame_deinit: unsafe extern "C" fn(frame: *mut MppFrame) -> MppRet,

    // -- Buffers --
    pub mpp_buffer_group_get: unsafe extern "C" fn(
        group: *mut MppBufferGroup,
        buffer_type: i32,
        mode: i32,
        tag: *const c_char,
        caller: *const c_char,
    ) -> MppRet,
    pub mpp_buffer_group_put: unsafe extern "C" fn(group: MppBufferGroup) -> MppRet,
    pub mpp_buffer_import_with_tag: unsafe extern "C" fn(
        group: MppBufferGroup,
        info: *mut MppBufferInfo,
        buffer: *mut MppBuffer,
        tag: *const c_char,
        caller: *const c_char,
    ) -> MppRet,
    pub mpp_buffer_info_get_with_caller: unsafe extern "C" fn(
        buffer: MppBuffer,
        info: *mut MppBufferInfo,
        caller: *const c_char,
    ) -> MppRet,
}

// SAFETY: MppLibrary only holds function pointers resolved from the loaded
// shared library. MPP's entry points are callable from any thread; the
// session serialises the calls that are not. The Library handle keeps the
// code mapped for as long as the pointers exist.
unsafe impl Send for MppLibrary {}
unsafe impl Sync for MppLibrary {}

impl std::fmt::Debug for MppLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MppLibrary").field("loaded", &true).finish()
    }
}

/// Resolve one symbol and copy the function pointer out of the borrow.
///
/// # Safety
///
/// `T` must match the C signature of `name`.
unsafe fn resolve<T: Copy>(lib: &Library, name: &str) -> Result<T, MppLoadError> {
    lib.get::<T>(name.as_bytes())
        .map(|symbol| *symbol)
        .map_err(|e| MppLoadError::SymbolNotFound(format!("{name}: {e}")))
}

impl MppLibrary {
    /// Load the system MPP library.
    pub fn load() -> Result<Self, MppLoadError> {
        Self::load_from(Path::new(Self::library_name()))
    }

    /// Load from a specific path (useful for non-standard installs).
    pub fn load_from(path: &Path) -> Result<Self, MppLoadError> {
        info!(library = %path.display(), "Loading MPP library");

        // SAFETY: Loading the Rockchip MPP shared library only runs its
        // static initialisers, which register codec tables.
        let lib = unsafe { Library::new(path) }.map_err(|e| {
            MppLoadError::LibraryNotFound(format!(
                "Failed to load {}: {e}. Is the Rockchip MPP runtime installed?",
                path.display()
            ))
        })?;

        // SAFETY: Every symbol below is part of the public MPP C API and the
        // field types match the declarations in the MPP headers. `resolve`
        // copies each pointer out, so the borrow on `lib` ends before `lib`
        // is moved into the struct.
        let loaded = unsafe {
            Self {
                mpp_create: resolve(&lib, "mpp_create")?,
                mpp_init: resolve(&lib, "mpp_init")?,
                mpp_destroy: resolve(&lib, "mpp_destroy")?,
                mpp_check_support_format: resolve(&lib, "mpp_check_support_format")?,
                mpp_show_support_format: resolve(&lib, "mpp_show_support_format")?,
                mpp_packet_init: resolve(&lib, "mpp_packet_init")?,
                mpp_packet_deinit: resolve(&lib, "mpp_packet_deinit")?,
                mpp_packet_set_pos: resolve(&lib, "mpp_packet_set_pos")?,
                mpp_packet_set_length: resolve(&lib, "mpp_packet_set_length")?,
                mpp_packet_set_eos: resolve(&lib, "mpp_packet_set_eos")?,
                mpp_frame_get_info_change: resolve(&lib, "mpp_frame_get_info_change")?,
                mpp_frame_get_width: resolve(&lib, "mpp_frame_get_width")?,
                mpp_frame_get_height: resolve(&lib, "mpp_frame_get_height")?,
                mpp_frame_get_hor_stride: resolve(&lib, "mpp_frame_get_hor_stride")?,
                mpp_frame_get_ver_stride: resolve(&lib, "mpp_frame_get_ver_stride")?,
                mpp_frame_get_fmt: resolve(&lib, "mpp_frame_get_fmt")?,
                mpp_frame_get_eos: resolve(&lib, "mpp_frame_get_eos")?,
                mpp_frame_get_buffer: resolve(&lib, "mpp_frame_get_buffer")?,
                mpp_frame_deinit: resolve(&lib, "mpp_frame_deinit")?,
                mpp_buffer_group_get: resolve(&lib, "mpp_buffer_group_get")?,
                mpp_buffer_group_put: resolve(&lib, "mpp_buffer_group_put")?,
                mpp_buffer_import_with_tag: resolve(&lib, "mpp_buffer_import_with_tag")?,
                mpp_buffer_info_get_with_caller: resolve(&lib, "mpp_buffer_info_get_with_caller")?,
                _lib: lib,
            }
        };

        debug!("All MPP symbols resolved");
        Ok(loaded)
    }

    /// Whether the decoder supports `coding` on this SoC.
    pub fn supports(&self, coding: CodingFormat) -> bool {
        // SAFETY: pure query on static codec tables.
        let result = unsafe { (self.mpp_check_support_format)(MPP_CTX_DEC, coding.id()) };
        result == MPP_OK
    }

    /// Print MPP's own table of supported formats to stdout.
    pub fn show_support_format(&self) {
        // SAFETY: prints static tables, no arguments.
        unsafe { (self.mpp_show_support_format)() }
    }

    /// Get the platform library filename.
    fn library_name() -> &'static str {
        "librockchip_mpp.so.1"
    }
}

/// Tag and caller strings passed to the tagged buffer APIs.
pub const MODULE_TAG: &[u8] = b"rkplay\0";

// ---------------------------------------------------------------------------
// Error type for library loading
// ---------------------------------------------------------------------------

/// Errors that can occur when loading the MPP library.
#[derive(Debug, thiserror::Error)]
pub enum MppLoadError {
    #[error("MPP library not found: {0}")]
    LibraryNotFound(String),

    #[error("Required symbol not found: {0}")]
    SymbolNotFound(String),
}

// ---------------------------------------------------------------------------
// Helper: Check MppRet and convert to Result
// ---------------------------------------------------------------------------

/// Convert an MppRet to a Result, mapping non-zero values to an error string.
pub fn check_mpp_result(result: MppRet, function_name: &str) -> Result<(), String> {
    if result == MPP_OK {
        Ok(())
    } else {
        Err(format!(
            "{function_name} failed with {} ({result})",
            mpp_ret_name(result)
        ))
    }
}

fn mpp_ret_name(result: MppRet) -> &'static str {
    match result {
        MPP_OK => "MPP_OK",
        MPP_NOK => "MPP_NOK",
        MPP_ERR_NULL_PTR => "MPP_ERR_NULL_PTR",
        MPP_ERR_MALLOC => "MPP_ERR_MALLOC",
        MPP_ERR_VALUE => "MPP_ERR_VALUE",
        MPP_ERR_READ_BIT => "MPP_ERR_READ_BIT",
        MPP_ERR_TIMEOUT => "MPP_ERR_TIMEOUT",
        MPP_ERR_INIT => "MPP_ERR_INIT",
        MPP_ERR_BUFFER_FULL => "MPP_ERR_BUFFER_FULL",
        _ => "MPP_ERR_UNKNOWN",
    }
}
